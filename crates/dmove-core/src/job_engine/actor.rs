use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use super::{JobEngineOptions, Request};
use crate::engine::TransferEngine;
use crate::error::{Error, Result};
use crate::journal;
use crate::manager::JobProperties;
use crate::plan::{HydrationParameters, JobModel, JobPlan, PartDoneHook};
use crate::task::JobStatus;

const TICK: Duration = Duration::from_millis(100);

pub(super) struct Actor {
    engine: Arc<TransferEngine>,
    options: JobEngineOptions,
    mailbox: Sender<Request>,
    jobs: Vec<JobPlan>,
    /// Round-robin position into `jobs` for the next refill.
    cursor: usize,
}

impl Actor {
    pub(super) fn new(
        engine: Arc<TransferEngine>,
        options: JobEngineOptions,
        mailbox: Sender<Request>,
    ) -> Self {
        Self {
            engine,
            options,
            mailbox,
            jobs: Vec::new(),
            cursor: 0,
        }
    }

    pub(super) fn run(mut self, rx: Receiver<Request>) {
        tracing::debug!(plans_dir = %self.options.plans_dir.display(), "job engine started");
        let mut stop_reply = None;
        'outer: loop {
            let first = match rx.recv_timeout(TICK) {
                Ok(req) => Some(req),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            for req in first.into_iter().chain(std::iter::from_fn(|| rx.try_recv().ok())) {
                if let Request::Stop { reply } = req {
                    stop_reply = Some(reply);
                    break 'outer;
                }
                self.handle(req);
            }
            self.refill();
        }
        self.pause_all();
        if let Some(reply) = stop_reply {
            let _ = reply.send(());
        }
        tracing::debug!("job engine stopped");
    }

    fn handle(&mut self, req: Request) {
        tracing::trace!(request = req.name(), "job engine request");
        match req {
            Request::CreateJob {
                job_id,
                model,
                params,
                reply,
            } => {
                let _ = reply.send(self.create_job(&job_id, &model, params));
            }
            Request::ResumeJob {
                job_id,
                params,
                reply,
            } => {
                let _ = reply.send(self.resume_job(&job_id, params));
            }
            Request::PauseJob { job_id, reply } => {
                let _ = reply.send(self.pause_job(&job_id));
            }
            Request::CancelJob { job_id, reply } => {
                let _ = reply.send(self.cancel_job(&job_id));
            }
            Request::RemoveJob { job_id, reply } => {
                let _ = reply.send(self.remove_job(&job_id));
            }
            Request::JobPartDone { job_id, part_id } => self.part_done(&job_id, part_id),
            Request::Stop { .. } => {}
        }
    }

    fn position(&self, job_id: &str) -> Option<usize> {
        self.jobs.iter().position(|p| p.job_id() == job_id)
    }

    fn part_done_hook(&self) -> PartDoneHook {
        let mailbox = self.mailbox.clone();
        Arc::new(move |job_id: &str, part_id: u32| {
            let _ = mailbox.send(Request::JobPartDone {
                job_id: job_id.to_string(),
                part_id,
            });
        })
    }

    fn load(&mut self, job_id: &str, params: HydrationParameters) -> Result<JobProperties> {
        let plan = JobPlan::load(
            &self.options.plans_dir,
            job_id,
            params,
            self.options.settings.clone(),
            self.part_done_hook(),
        )?;
        let props = JobProperties::from_plan(&plan);
        self.jobs.push(plan);
        Ok(props)
    }

    fn create_job(
        &mut self,
        job_id: &str,
        model: &JobModel,
        params: HydrationParameters,
    ) -> Result<JobProperties> {
        if self.position(job_id).is_some() || JobPlan::exists(&self.options.plans_dir, job_id) {
            return Err(Error::JobAlreadyExists(job_id.to_string()));
        }
        JobPlan::create(&self.options.plans_dir, job_id, model)?;
        self.load(job_id, params)
    }

    fn resume_job(&mut self, job_id: &str, params: HydrationParameters) -> Result<JobProperties> {
        if let Some(i) = self.position(job_id) {
            let plan = &self.jobs[i];
            let status = plan.status().status();
            if status != JobStatus::Paused {
                return Err(Error::InvalidState {
                    job_id: job_id.to_string(),
                    status,
                });
            }
            plan.status().set_status(JobStatus::InProgress);
            self.engine.resume_paused_tasks();
            return Ok(JobProperties::from_plan(plan));
        }
        if !JobPlan::exists(&self.options.plans_dir, job_id) {
            return Err(Error::JobNotFound(job_id.to_string()));
        }
        self.load(job_id, params)
    }

    fn pause_job(&mut self, job_id: &str) -> Result<()> {
        let i = self
            .position(job_id)
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        let status = self.jobs[i].status();
        if !status.set_status(JobStatus::Paused) {
            return Err(Error::InvalidState {
                job_id: job_id.to_string(),
                status: status.status(),
            });
        }
        Ok(())
    }

    fn cancel_job(&mut self, job_id: &str) -> Result<()> {
        let Some(i) = self.position(job_id) else {
            return self.remove_job(job_id);
        };
        let plan = self.take(i);
        plan.status().set_status(JobStatus::Cancelled);
        // Parked tasks of the job are dropped here.
        self.engine.resume_paused_tasks();
        plan.discard()?;
        tracing::info!(job_id, "job cancelled");
        Ok(())
    }

    fn remove_job(&mut self, job_id: &str) -> Result<()> {
        if let Some(i) = self.position(job_id) {
            return Err(Error::InvalidState {
                job_id: job_id.to_string(),
                status: self.jobs[i].status().status(),
            });
        }
        if !JobPlan::exists(&self.options.plans_dir, job_id) {
            return Err(Error::JobNotFound(job_id.to_string()));
        }
        journal::retire(&self.options.plans_dir.join(job_id))?;
        tracing::info!(job_id, "job plan removed");
        Ok(())
    }

    fn part_done(&mut self, job_id: &str, part_id: u32) {
        let Some(i) = self.position(job_id) else {
            tracing::trace!(job_id, part_id, "part done for a job no longer loaded");
            return;
        };
        match self.jobs[i].part_settled(part_id) {
            Ok(()) => {
                self.finish_if_done(i);
            }
            Err(e) => self.fail_job(i, &e.to_string()),
        }
    }

    fn take(&mut self, i: usize) -> JobPlan {
        let plan = self.jobs.remove(i);
        if self.cursor > i {
            self.cursor -= 1;
        }
        plan
    }

    /// Mark the job failed and unload it. Its plan stays on disk.
    fn fail_job(&mut self, i: usize, message: &str) {
        let plan = self.take(i);
        tracing::error!(job_id = %plan.job_id(), error = message, "job plan error, failing job");
        plan.status().set_status(JobStatus::Failed);
    }

    /// Returns whether job `i` was finished and unloaded.
    fn finish_if_done(&mut self, i: usize) -> bool {
        let plan = &self.jobs[i];
        if plan.status().status() != JobStatus::InProgress || !plan.is_finished() {
            return false;
        }
        let plan = self.take(i);
        let job_id = plan.job_id().to_string();
        if let Err(e) = plan.finish() {
            tracing::warn!(job_id = %job_id, error = %e, "failed to retire finished plan");
        }
        true
    }

    /// Hand out parts while the transfer engine's backlog is low.
    fn refill(&mut self) {
        let mut idle_in_a_row = 0;
        while idle_in_a_row < self.jobs.len()
            && self.engine.outstanding_tasks() < self.options.task_refill_threshold
        {
            if self.cursor >= self.jobs.len() {
                self.cursor = 0;
            }
            let i = self.cursor;
            if self.jobs[i].status().status() != JobStatus::InProgress {
                self.cursor += 1;
                idle_in_a_row += 1;
                continue;
            }
            match self.jobs[i].get_more_tasks() {
                Ok(tasks) if tasks.is_empty() => {
                    if !self.finish_if_done(i) {
                        self.cursor += 1;
                    }
                    idle_in_a_row += 1;
                }
                Ok(tasks) => {
                    tracing::debug!(job_id = %self.jobs[i].job_id(), tasks = tasks.len(), "feeding engine");
                    self.engine.add_tasks(tasks);
                    self.cursor += 1;
                    idle_in_a_row = 0;
                }
                Err(e) => {
                    self.fail_job(i, &e.to_string());
                    idle_in_a_row = 0;
                }
            }
        }
    }

    fn pause_all(&mut self) {
        for plan in self.jobs.drain(..) {
            let status = plan.status();
            if status.status() == JobStatus::InProgress && status.set_status(JobStatus::Paused) {
                tracing::info!(job_id = %plan.job_id(), "job paused on shutdown");
            }
        }
    }
}
