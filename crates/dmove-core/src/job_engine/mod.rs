//! Job engine: the single thread that owns every loaded [`JobPlan`].
//!
//! Requests arrive through a mailbox and are answered over a one-shot reply
//! channel, so plans are only ever touched from the engine thread. Between
//! mailbox drains the thread keeps the transfer engine fed, pulling one part
//! at a time from in-progress jobs in round-robin order while the engine's
//! backlog is below the refill threshold.

mod actor;

use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::engine::TransferEngine;
use crate::error::{Error, Result};
use crate::manager::JobProperties;
use crate::plan::{HydrationParameters, JobModel, PlanSettings};

/// Default backlog below which the engine is refilled.
pub const DEFAULT_REFILL_THRESHOLD: usize = 5_000;

type Reply<T> = Sender<Result<T>>;

pub(crate) enum Request {
    CreateJob {
        job_id: String,
        model: JobModel,
        params: HydrationParameters,
        reply: Reply<JobProperties>,
    },
    ResumeJob {
        job_id: String,
        params: HydrationParameters,
        reply: Reply<JobProperties>,
    },
    PauseJob {
        job_id: String,
        reply: Reply<()>,
    },
    CancelJob {
        job_id: String,
        reply: Reply<()>,
    },
    RemoveJob {
        job_id: String,
        reply: Reply<()>,
    },
    JobPartDone {
        job_id: String,
        part_id: u32,
    },
    Stop {
        reply: Sender<()>,
    },
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Request::CreateJob { .. } => "create_job",
            Request::ResumeJob { .. } => "resume_job",
            Request::PauseJob { .. } => "pause_job",
            Request::CancelJob { .. } => "cancel_job",
            Request::RemoveJob { .. } => "remove_job",
            Request::JobPartDone { .. } => "job_part_done",
            Request::Stop { .. } => "stop",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobEngineOptions {
    pub plans_dir: PathBuf,
    pub settings: PlanSettings,
    pub task_refill_threshold: usize,
}

/// Handle to the job engine thread.
pub struct JobEngine {
    tx: Sender<Request>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for JobEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEngine")
            .field("running", &self.thread.lock().unwrap().is_some())
            .finish()
    }
}

impl JobEngine {
    pub fn start(engine: Arc<TransferEngine>, options: JobEngineOptions) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let actor = actor::Actor::new(engine, options, tx.clone());
        let name = "dmove-jobs".to_string();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || actor.run(rx))
            .map_err(|source| Error::Thread { name, source })?;
        Ok(Self {
            tx,
            thread: Mutex::new(Some(handle)),
        })
    }

    fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        let (reply, rx) = mpsc::channel();
        self.tx.send(make(reply)).map_err(|_| Error::EngineStopped)?;
        rx.recv().map_err(|_| Error::EngineStopped)?
    }

    /// Persist a new plan for `model` and start feeding its tasks.
    pub fn create_job(
        &self,
        job_id: &str,
        model: JobModel,
        params: HydrationParameters,
    ) -> Result<JobProperties> {
        self.call(|reply| Request::CreateJob {
            job_id: job_id.to_string(),
            model,
            params,
            reply,
        })
    }

    /// Resume a paused job, or load a job's plan from disk.
    pub fn resume_job(&self, job_id: &str, params: HydrationParameters) -> Result<JobProperties> {
        self.call(|reply| Request::ResumeJob {
            job_id: job_id.to_string(),
            params,
            reply,
        })
    }

    pub fn pause_job(&self, job_id: &str) -> Result<()> {
        self.call(|reply| Request::PauseJob {
            job_id: job_id.to_string(),
            reply,
        })
    }

    pub fn cancel_job(&self, job_id: &str) -> Result<()> {
        self.call(|reply| Request::CancelJob {
            job_id: job_id.to_string(),
            reply,
        })
    }

    /// Delete the plan of a job that is not loaded.
    pub fn remove_job(&self, job_id: &str) -> Result<()> {
        self.call(|reply| Request::RemoveJob {
            job_id: job_id.to_string(),
            reply,
        })
    }

    /// Tell the engine that every subtask of a part has resolved.
    pub fn job_part_done(&self, job_id: &str, part_id: u32) {
        let _ = self.tx.send(Request::JobPartDone {
            job_id: job_id.to_string(),
            part_id,
        });
    }

    /// Pause every in-progress job and stop the thread. Safe to call more
    /// than once.
    pub fn stop(&self) {
        let Some(handle) = self.thread.lock().unwrap().take() else {
            return;
        };
        let (reply, rx) = mpsc::channel();
        if self.tx.send(Request::Stop { reply }).is_ok() {
            let _ = rx.recv();
        }
        if handle.join().is_err() {
            tracing::error!("job engine thread panicked");
        }
    }
}

impl Drop for JobEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests;
