//! Expanding a part generator into task models.
//!
//! Local directories are walked breadth-first; once the subtask cap is hit,
//! every directory not yet listed becomes a generator of its own. Remote
//! folders are listed one page per generator, the continuation token riding
//! along in the follow-up generator.

use std::collections::VecDeque;
use std::fs;
use std::sync::Arc;

use super::model::{
    is_plain_relative, Direction, JobModel, PartGenerator, TaskModel, TransferEnd,
};
use super::{HydrationParameters, PlanLimits};
use crate::error::PlanError;
use crate::remote::RemoteStore;
use crate::retry::{run_with_retry, RetryPolicy};
use crate::storage;

/// Output of one expansion step.
#[derive(Debug, Default)]
pub(crate) struct Expansion {
    pub models: Vec<TaskModel>,
    pub generators: Vec<PartGenerator>,
}

pub(crate) struct Expander<'a> {
    pub model: &'a JobModel,
    pub direction: Direction,
    pub params: &'a HydrationParameters,
    pub limits: &'a PlanLimits,
    pub retry: &'a RetryPolicy,
}

fn join_rel(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

impl Expander<'_> {
    fn chunk_size(&self) -> u64 {
        match self.direction {
            Direction::Upload => self.limits.upload_block_size.max(1),
            Direction::Download => self.limits.download_block_size.max(1),
            Direction::Copy => 0,
        }
    }

    fn source_store(&self) -> Result<&Arc<dyn RemoteStore>, PlanError> {
        self.params
            .source_store
            .as_ref()
            .ok_or_else(|| PlanError::Invalid("remote source requires a source store".into()))
    }

    pub fn expand(&self, gen: &PartGenerator) -> Result<Expansion, PlanError> {
        match &self.model.source {
            TransferEnd::LocalFile { .. } => self.expand_local_file(gen),
            TransferEnd::LocalDirectory { .. } => self.expand_local_directory(gen),
            TransferEnd::RemoteObject { .. } => self.expand_remote_object(gen),
            TransferEnd::RemoteFolder { .. } => self.expand_remote_folder(gen),
        }
    }

    fn expand_local_file(&self, gen: &PartGenerator) -> Result<Expansion, PlanError> {
        let path = self.model.source.local_child(&gen.source)?;
        let meta = fs::metadata(&path).map_err(PlanError::io_at(&path))?;
        if !meta.is_file() {
            return Err(PlanError::Source {
                path,
                message: "not a regular file".into(),
            });
        }
        Ok(Expansion {
            models: vec![TaskModel::new(
                gen.source.clone(),
                gen.destination.clone(),
                meta.len(),
                self.chunk_size(),
            )],
            generators: Vec::new(),
        })
    }

    fn expand_local_directory(&self, gen: &PartGenerator) -> Result<Expansion, PlanError> {
        let mut out = Expansion::default();
        let mut queue: VecDeque<String> = VecDeque::from([gen.source.clone()]);
        let mut generated = 0usize;
        let chunk_size = self.chunk_size();

        while let Some(rel) = queue.pop_front() {
            if generated >= self.limits.max_subtasks_generated {
                queue.push_front(rel);
                break;
            }
            let dir = self.model.source.local_child(&rel)?;
            let entries = storage::list_directory(&dir).map_err(|e| PlanError::Source {
                path: dir.clone(),
                message: format!("{e:#}"),
            })?;
            for entry in entries {
                let child = join_rel(&rel, &entry.name);
                if entry.is_dir {
                    queue.push_back(child);
                } else {
                    let m = TaskModel::new(child.clone(), child, entry.size, chunk_size);
                    generated += m.num_subtasks() as usize;
                    out.models.push(m);
                }
            }
        }

        out.generators = queue
            .into_iter()
            .map(|rel| PartGenerator {
                source: rel.clone(),
                destination: rel,
                continuation_token: None,
            })
            .collect();
        tracing::debug!(
            dir = %gen.source,
            models = out.models.len(),
            deferred = out.generators.len(),
            "expanded local directory"
        );
        Ok(out)
    }

    fn expand_remote_object(&self, gen: &PartGenerator) -> Result<Expansion, PlanError> {
        let store = self.source_store()?;
        let name = self.model.source.remote_child(&gen.source)?;
        let props = run_with_retry(self.retry, || store.properties(&name))?;
        Ok(Expansion {
            models: vec![TaskModel::new(
                gen.source.clone(),
                gen.destination.clone(),
                props.size,
                self.chunk_size(),
            )],
            generators: Vec::new(),
        })
    }

    fn expand_remote_folder(&self, gen: &PartGenerator) -> Result<Expansion, PlanError> {
        let store = self.source_store()?;
        let prefix = self.model.source.remote_child(&gen.source)?;
        let page_size = self.limits.list_page_size.max(1);
        let page = run_with_retry(self.retry, || {
            store.list(&prefix, gen.continuation_token.as_deref(), page_size)
        })?;
        let chunk_size = self.chunk_size();

        let mut out = Expansion::default();
        for obj in page.objects {
            let Some(rel) = obj.name.strip_prefix(&prefix) else {
                tracing::warn!(name = %obj.name, prefix = %prefix, "listing returned a name outside the prefix");
                continue;
            };
            // Folder markers and the prefix itself carry no data.
            if rel.is_empty() || rel.ends_with('/') {
                continue;
            }
            if self.direction == Direction::Download && !is_plain_relative(rel) {
                tracing::warn!(name = %obj.name, "listed name would land outside the destination, skipping");
                continue;
            }
            let source = join_rel(&gen.source, rel);
            let destination = join_rel(&gen.destination, rel);
            out.models
                .push(TaskModel::new(source, destination, obj.size, chunk_size));
        }
        if let Some(token) = page.continuation {
            out.generators.push(PartGenerator {
                source: gen.source.clone(),
                destination: gen.destination.clone(),
                continuation_token: Some(token),
            });
        }
        Ok(out)
    }
}

/// Group models into parts of at most `per_part` done bits.
pub(crate) fn split_into_parts(models: Vec<TaskModel>, per_part: usize) -> Vec<Vec<TaskModel>> {
    let per_part = per_part.max(1);
    let mut parts = Vec::new();
    let mut current = Vec::new();
    let mut bits = 0usize;
    for m in models {
        let n = m.num_subtasks() as usize;
        if !current.is_empty() && bits + n > per_part {
            parts.push(std::mem::take(&mut current));
            bits = 0;
        }
        bits += n;
        current.push(m);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}
