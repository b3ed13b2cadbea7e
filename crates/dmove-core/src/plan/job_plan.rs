use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::generate::{split_into_parts, Expander};
use super::hydrate::Hydrator;
use super::model::{Direction, JobModel, PartGenerator};
use super::part::{JobPart, PartDoneHook};
use super::{HydrationParameters, PlanSettings};
use crate::error::PlanError;
use crate::journal::{
    self, open_part_file, parse_part_file_name, part_file_name, write_part_file, Counter,
    JobInfoFile, PartGenLog, PartGenRecord, PartRecord, DELETE_SUFFIX, JOB_INFO_FILE,
};
use crate::task::{SharedStatusOptions, Task, TaskSharedStatus, TransferType};

#[derive(Debug)]
enum PartState {
    /// On disk, not loaded in this session.
    Unloaded,
    /// Loaded; some of its subtasks are still in flight.
    Active(Arc<JobPart>),
    /// Every subtask resolved but some failed. The file stays for a later
    /// resume.
    Settled,
}

/// A job's plan directory, loaded.
///
/// Owned by the job engine thread; tasks only reach back through the
/// [`JobPart`]s and the shared status they carry.
pub struct JobPlan {
    job_id: String,
    dir: PathBuf,
    model: JobModel,
    transfer_type: TransferType,
    direction: Direction,
    params: HydrationParameters,
    settings: PlanSettings,
    status: Arc<TaskSharedStatus>,
    gens: PartGenLog,
    pending_gens: VecDeque<PartGenRecord>,
    parts: BTreeMap<u32, PartState>,
    next_part_id: u32,
    on_part_done: PartDoneHook,
}

impl fmt::Debug for JobPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobPlan")
            .field("job_id", &self.job_id)
            .field("transfer_type", &self.transfer_type)
            .field("pending_gens", &self.pending_gens.len())
            .field("parts", &self.parts)
            .finish()
    }
}

fn plan_dir(plans_dir: &Path, job_id: &str) -> PathBuf {
    plans_dir.join(job_id)
}

impl JobPlan {
    /// Write a new plan directory for `model`, holding a single generator
    /// that covers the whole job.
    pub fn create(plans_dir: &Path, job_id: &str, model: &JobModel) -> Result<PathBuf, PlanError> {
        model.transfer_type()?;
        let dir = plan_dir(plans_dir, job_id);
        if dir.exists() {
            return Err(PlanError::Invalid(format!(
                "plan directory {} already exists",
                dir.display()
            )));
        }
        fs::create_dir_all(&dir).map_err(PlanError::io_at(&dir))?;
        let root = serde_json::to_string(&PartGenerator::root())?;
        PartGenLog::create(&dir, &[root])?;
        // job_info goes last: a directory without it is not a plan.
        JobInfoFile::create(&dir, &serde_json::to_string(model)?)?;
        tracing::info!(job_id, dir = %dir.display(), "job plan created");
        Ok(dir)
    }

    pub fn exists(plans_dir: &Path, job_id: &str) -> bool {
        plan_dir(plans_dir, job_id).join(JOB_INFO_FILE).is_file()
    }

    pub fn load(
        plans_dir: &Path,
        job_id: &str,
        params: HydrationParameters,
        settings: PlanSettings,
        on_part_done: PartDoneHook,
    ) -> Result<Self, PlanError> {
        let dir = plan_dir(plans_dir, job_id);
        let (job_info, record) = JobInfoFile::open(&dir)?;
        let model: JobModel = serde_json::from_str(&record)
            .map_err(|e| PlanError::corrupt(job_info.path(), format!("bad job record: {e}")))?;
        let transfer_type = model.transfer_type()?;
        let direction = model.direction()?;
        let (need_source, need_destination) = match direction {
            Direction::Upload => (false, true),
            Direction::Download => (true, false),
            Direction::Copy => (true, true),
        };
        if need_source && params.source_store.is_none() {
            return Err(PlanError::Invalid(format!("job {job_id} needs a source store")));
        }
        if need_destination && params.destination_store.is_none() {
            return Err(PlanError::Invalid(format!(
                "job {job_id} needs a destination store"
            )));
        }

        // Failed subtasks are re-issued, so their count starts over.
        job_info.store(Counter::FilesFailed, 0);
        let status = TaskSharedStatus::with_options(
            job_id,
            SharedStatusOptions {
                progress_handler: params.progress_handler.clone(),
                error_handler: params.error_handler.clone(),
                job_info: Some(Arc::new(job_info)),
                progress_interval: settings.progress_interval,
            },
        );

        let (gens, records) = PartGenLog::open(&dir)?;
        let pending_gens: VecDeque<PartGenRecord> = records.into_iter().filter(|r| !r.done).collect();

        let mut parts = BTreeMap::new();
        let mut next_part_id = 0u32;
        let entries = fs::read_dir(&dir).map_err(PlanError::io_at(&dir))?;
        for entry in entries {
            let entry = entry.map_err(PlanError::io_at(&dir))?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let (stem, retired) = match name.strip_suffix(DELETE_SUFFIX) {
                Some(stem) => (stem, true),
                None => (name.as_str(), false),
            };
            let Some(id) = parse_part_file_name(stem) else {
                continue;
            };
            next_part_id = next_part_id.max(id.saturating_add(1));
            if !retired {
                parts.insert(id, PartState::Unloaded);
            }
        }

        tracing::info!(
            job_id,
            transfer_type = ?transfer_type,
            parts = parts.len(),
            pending_generators = pending_gens.len(),
            "job plan loaded"
        );
        Ok(Self {
            job_id: job_id.to_string(),
            dir,
            model,
            transfer_type,
            direction,
            params,
            settings,
            status,
            gens,
            pending_gens,
            parts,
            next_part_id,
            on_part_done,
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn model(&self) -> &JobModel {
        &self.model
    }

    pub fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }

    pub fn status(&self) -> &Arc<TaskSharedStatus> {
        &self.status
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist more generators for later expansion.
    pub fn append_part_generators(&mut self, generators: &[PartGenerator]) -> Result<(), PlanError> {
        let payloads = generators
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        let offsets = self.gens.append(&payloads)?;
        self.pending_gens
            .extend(offsets.into_iter().zip(payloads).map(|(offset, payload)| PartGenRecord {
                offset,
                done: false,
                payload,
            }));
        Ok(())
    }

    /// Expand the next pending generator into part files. Returns the ids of
    /// the new parts; empty when no generator is left.
    pub fn generate_parts(&mut self) -> Result<Vec<u32>, PlanError> {
        let Some(record) = self.pending_gens.front().cloned() else {
            return Ok(Vec::new());
        };
        let gen: PartGenerator = serde_json::from_str(&record.payload).map_err(|e| {
            PlanError::corrupt(&self.dir, format!("bad generator at {}: {e}", record.offset))
        })?;
        let expansion = Expander {
            model: &self.model,
            direction: self.direction,
            params: &self.params,
            limits: &self.settings.limits,
            retry: &self.settings.retry,
        }
        .expand(&gen)?;

        let mut ids = Vec::new();
        for models in split_into_parts(expansion.models, self.settings.limits.subtasks_per_part) {
            let records = models
                .iter()
                .map(|m| -> Result<PartRecord, PlanError> {
                    Ok(PartRecord {
                        num_subtasks: m.num_subtasks(),
                        payload: serde_json::to_string(m)?,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let id = self.next_part_id;
            write_part_file(&self.dir, id, &records)?;
            self.next_part_id += 1;
            self.parts.insert(id, PartState::Unloaded);
            ids.push(id);
        }
        self.append_part_generators(&expansion.generators)?;
        self.gens.mark_done(record.offset)?;
        self.pending_gens.pop_front();
        tracing::debug!(
            job_id = %self.job_id,
            generator = %gen.source,
            parts = ids.len(),
            generators = expansion.generators.len(),
            "generator expanded"
        );
        if self.pending_gens.is_empty() {
            self.gens.retire()?;
        }
        Ok(ids)
    }

    /// Tasks of the next part that has work left, generating parts as
    /// needed. Empty once the plan has nothing more to hand out.
    pub fn get_more_tasks(&mut self) -> Result<Vec<Task>, PlanError> {
        loop {
            let next = self
                .parts
                .iter()
                .find(|(_, s)| matches!(s, PartState::Unloaded))
                .map(|(&id, _)| id);
            if let Some(id) = next {
                let tasks = self.load_part(id)?;
                if !tasks.is_empty() {
                    return Ok(tasks);
                }
                continue;
            }
            if self.pending_gens.is_empty() {
                self.gens.retire()?;
                return Ok(Vec::new());
            }
            self.generate_parts()?;
        }
    }

    /// Map part `id` and hydrate its undone subtasks.
    pub fn load_part(&mut self, id: u32) -> Result<Vec<Task>, PlanError> {
        let path = self.dir.join(part_file_name(id));
        let file = open_part_file(&path)?;
        let part = JobPart::new(
            &self.job_id,
            id,
            Some(file.path),
            file.bitmap,
            Arc::clone(&self.on_part_done),
        );
        let tasks = Hydrator {
            model: &self.model,
            direction: self.direction,
            params: &self.params,
            settings: &self.settings,
            status: &self.status,
        }
        .hydrate(&part, &file.records)?;
        tracing::debug!(job_id = %self.job_id, part_id = id, tasks = tasks.len(), unresolved = part.unresolved(), "part loaded");
        self.parts.insert(id, PartState::Active(part));
        if tasks.is_empty() {
            self.part_settled(id)?;
        }
        Ok(tasks)
    }

    /// Every subtask of part `id` has resolved. A fully done part is retired;
    /// one with failures is kept on disk. Unknown or already settled ids are
    /// ignored.
    pub fn part_settled(&mut self, id: u32) -> Result<(), PlanError> {
        let Some(PartState::Active(part)) = self.parts.get(&id) else {
            return Ok(());
        };
        if part.unresolved() != 0 {
            return Ok(());
        }
        if part.bitmap().all_set() {
            let path = self.dir.join(part_file_name(id));
            part.bitmap()
                .flush()
                .map_err(PlanError::io_at(&path))?;
            journal::retire(&path)?;
            self.parts.remove(&id);
            tracing::debug!(job_id = %self.job_id, part_id = id, "part retired");
        } else {
            tracing::info!(job_id = %self.job_id, part_id = id, "part settled with failures");
            self.parts.insert(id, PartState::Settled);
        }
        Ok(())
    }

    /// No generator left and no part loaded or waiting to be.
    pub fn is_finished(&self) -> bool {
        self.pending_gens.is_empty()
            && self.parts.values().all(|s| matches!(s, PartState::Settled))
    }

    /// Settle the job's final status and retire the plan directory if every
    /// part was retired. Returns whether the directory was retired.
    pub fn finish(self) -> Result<bool, PlanError> {
        let status = self.status.derive_final_status();
        self.status.set_status(status);
        if !self.parts.is_empty() {
            tracing::info!(job_id = %self.job_id, status = ?status, kept = self.parts.len(), "job finished, plan kept for retry");
            return Ok(false);
        }
        let (job_id, dir) = (self.job_id.clone(), self.dir.clone());
        drop(self);
        journal::retire(&dir)?;
        tracing::info!(job_id = %job_id, status = ?status, "job finished, plan retired");
        Ok(true)
    }

    /// Drop the plan and retire its directory.
    pub fn discard(self) -> Result<(), PlanError> {
        let dir = self.dir.clone();
        drop(self);
        journal::retire(&dir)?;
        Ok(())
    }
}
