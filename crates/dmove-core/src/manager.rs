//! Public entry point: schedule, pause, resume and cancel transfer jobs.
//!
//! A [`TransferManager`] owns one [`TransferEngine`] and one [`JobEngine`].
//! Each `schedule_*` call persists a new plan and returns the job's
//! [`JobProperties`], whose wait handle resolves once the job leaves
//! `InProgress`. Dropping the manager pauses whatever is still running; a
//! later manager over the same plan directory can resume it.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::engine::{EngineOptions, TransferEngine};
use crate::error::{Error, PlanError, Result};
use crate::job_engine::{JobEngine, JobEngineOptions, DEFAULT_REFILL_THRESHOLD};
use crate::plan::{HydrationParameters, JobModel, JobPlan, PlanLimits, PlanSettings, TransferEnd};
use crate::progress::{ErrorHandler, ProgressHandler};
use crate::remote::RemoteStore;
use crate::retry::RetryPolicy;
use crate::task::{JobStatus, TransferType};

#[derive(Debug, Clone)]
pub struct TransferManagerOptions {
    /// Directory holding one plan directory per job.
    pub plans_dir: PathBuf,
    pub engine: EngineOptions,
    pub limits: PlanLimits,
    pub task_refill_threshold: usize,
    pub copy_poll_interval: Duration,
    pub progress_interval: Duration,
    pub retry: RetryPolicy,
}

impl TransferManagerOptions {
    /// Defaults for everything but the plan directory.
    pub fn new(plans_dir: impl Into<PathBuf>) -> Self {
        let settings = PlanSettings::default();
        Self {
            plans_dir: plans_dir.into(),
            engine: EngineOptions::default(),
            limits: settings.limits,
            task_refill_threshold: DEFAULT_REFILL_THRESHOLD,
            copy_poll_interval: settings.copy_poll_interval,
            progress_interval: settings.progress_interval,
            retry: settings.retry,
        }
    }
}

/// Per-job callbacks and flags for the `schedule_*` calls.
#[derive(Clone, Default)]
pub struct ScheduleOptions {
    pub progress_handler: Option<ProgressHandler>,
    pub error_handler: Option<ErrorHandler>,
    /// Replace existing local files when downloading.
    pub overwrite: bool,
}

impl fmt::Debug for ScheduleOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleOptions")
            .field("progress_handler", &self.progress_handler.is_some())
            .field("error_handler", &self.error_handler.is_some())
            .field("overwrite", &self.overwrite)
            .finish()
    }
}

/// Stores and callbacks for [`TransferManager::resume_job`]. Stores are
/// never persisted, so a job loaded from disk needs them again.
#[derive(Clone, Default)]
pub struct ResumeJobOptions {
    pub source_store: Option<Arc<dyn RemoteStore>>,
    pub destination_store: Option<Arc<dyn RemoteStore>>,
    pub progress_handler: Option<ProgressHandler>,
    pub error_handler: Option<ErrorHandler>,
    pub overwrite: bool,
}

impl fmt::Debug for ResumeJobOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumeJobOptions")
            .field("source_store", &self.source_store)
            .field("destination_store", &self.destination_store)
            .field("overwrite", &self.overwrite)
            .finish()
    }
}

/// One object in a remote store.
#[derive(Debug, Clone)]
pub struct RemoteObject {
    pub store: Arc<dyn RemoteStore>,
    pub name: String,
}

impl RemoteObject {
    pub fn new(store: Arc<dyn RemoteStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }
}

/// Every object under a prefix of a remote store.
#[derive(Debug, Clone)]
pub struct RemoteFolder {
    pub store: Arc<dyn RemoteStore>,
    pub prefix: String,
}

impl RemoteFolder {
    pub fn new(store: Arc<dyn RemoteStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }
}

/// Awaitable view of a job's status.
#[derive(Debug, Clone)]
pub struct JobWaitHandle {
    rx: watch::Receiver<JobStatus>,
}

impl JobWaitHandle {
    pub fn status(&self) -> JobStatus {
        *self.rx.borrow()
    }

    /// Resolves to the first status other than `InProgress`: a terminal
    /// status, or `Paused`.
    pub async fn wait(&self) -> JobStatus {
        let mut rx = self.rx.clone();
        let result = rx.wait_for(|s| *s != JobStatus::InProgress).await.map(|s| *s);
        match result {
            Ok(status) => status,
            Err(_) => *rx.borrow(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobProperties {
    pub id: String,
    pub transfer_type: TransferType,
    pub source_url: String,
    pub destination_url: String,
    pub wait_handle: JobWaitHandle,
}

impl JobProperties {
    pub(crate) fn from_plan(plan: &JobPlan) -> Self {
        Self {
            id: plan.job_id().to_string(),
            transfer_type: plan.transfer_type(),
            source_url: plan.model().source.url().to_string(),
            destination_url: plan.model().destination.url().to_string(),
            wait_handle: JobWaitHandle {
                rx: plan.status().subscribe(),
            },
        }
    }
}

fn endpoint<T>(r: std::result::Result<T, PlanError>) -> Result<T> {
    r.map_err(|e| Error::InvalidEndpoint(e.to_string()))
}

fn new_job_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Schedules and controls transfer jobs.
pub struct TransferManager {
    engine: Arc<TransferEngine>,
    jobs: JobEngine,
    plans_dir: PathBuf,
}

impl fmt::Debug for TransferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferManager")
            .field("plans_dir", &self.plans_dir)
            .field("engine", &self.engine)
            .finish()
    }
}

impl TransferManager {
    pub fn new(options: TransferManagerOptions) -> Result<Self> {
        fs::create_dir_all(&options.plans_dir).map_err(PlanError::io_at(&options.plans_dir))?;
        let engine = Arc::new(TransferEngine::new(options.engine)?);
        let jobs = JobEngine::start(
            Arc::clone(&engine),
            JobEngineOptions {
                plans_dir: options.plans_dir.clone(),
                settings: PlanSettings {
                    limits: options.limits,
                    retry: options.retry,
                    copy_poll_interval: options.copy_poll_interval,
                    progress_interval: options.progress_interval,
                },
                task_refill_threshold: options.task_refill_threshold,
            },
        )?;
        tracing::info!(plans_dir = %options.plans_dir.display(), "transfer manager started");
        Ok(Self {
            engine,
            jobs,
            plans_dir: options.plans_dir,
        })
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    pub fn plans_dir(&self) -> &Path {
        &self.plans_dir
    }

    fn schedule(&self, model: JobModel, params: HydrationParameters) -> Result<JobProperties> {
        let job_id = new_job_id();
        let props = self.jobs.create_job(&job_id, model, params)?;
        tracing::info!(job_id = %props.id, transfer_type = ?props.transfer_type, source = %props.source_url, destination = %props.destination_url, "job scheduled");
        Ok(props)
    }

    fn params(
        source_store: Option<Arc<dyn RemoteStore>>,
        destination_store: Option<Arc<dyn RemoteStore>>,
        options: ScheduleOptions,
    ) -> HydrationParameters {
        HydrationParameters {
            source_store,
            destination_store,
            progress_handler: options.progress_handler,
            error_handler: options.error_handler,
            overwrite: options.overwrite,
        }
    }

    /// Upload one local file to a remote object.
    pub fn schedule_upload(
        &self,
        source: &Path,
        destination: RemoteObject,
        options: ScheduleOptions,
    ) -> Result<JobProperties> {
        if !source.is_file() {
            return Err(Error::InvalidEndpoint(format!(
                "{} is not a file",
                source.display()
            )));
        }
        let model = JobModel {
            source: endpoint(TransferEnd::local_file(source))?,
            destination: TransferEnd::remote_object(destination.store.as_ref(), &destination.name),
        };
        self.schedule(model, Self::params(None, Some(destination.store), options))
    }

    /// Upload a local directory tree under a remote prefix.
    pub fn schedule_upload_directory(
        &self,
        source: &Path,
        destination: RemoteFolder,
        options: ScheduleOptions,
    ) -> Result<JobProperties> {
        if !source.is_dir() {
            return Err(Error::InvalidEndpoint(format!(
                "{} is not a directory",
                source.display()
            )));
        }
        let model = JobModel {
            source: endpoint(TransferEnd::local_directory(source))?,
            destination: TransferEnd::remote_folder(destination.store.as_ref(), &destination.prefix),
        };
        self.schedule(model, Self::params(None, Some(destination.store), options))
    }

    /// Download one remote object to a local file.
    pub fn schedule_download(
        &self,
        source: RemoteObject,
        destination: &Path,
        options: ScheduleOptions,
    ) -> Result<JobProperties> {
        let model = JobModel {
            source: TransferEnd::remote_object(source.store.as_ref(), &source.name),
            destination: endpoint(TransferEnd::local_file(destination))?,
        };
        self.schedule(model, Self::params(Some(source.store), None, options))
    }

    /// Download every object under a remote prefix into a local directory.
    pub fn schedule_download_directory(
        &self,
        source: RemoteFolder,
        destination: &Path,
        options: ScheduleOptions,
    ) -> Result<JobProperties> {
        let model = JobModel {
            source: TransferEnd::remote_folder(source.store.as_ref(), &source.prefix),
            destination: endpoint(TransferEnd::local_directory(destination))?,
        };
        self.schedule(model, Self::params(Some(source.store), None, options))
    }

    /// Server-side copy of one object.
    pub fn schedule_copy(
        &self,
        source: RemoteObject,
        destination: RemoteObject,
        options: ScheduleOptions,
    ) -> Result<JobProperties> {
        let model = JobModel {
            source: TransferEnd::remote_object(source.store.as_ref(), &source.name),
            destination: TransferEnd::remote_object(destination.store.as_ref(), &destination.name),
        };
        self.schedule(
            model,
            Self::params(Some(source.store), Some(destination.store), options),
        )
    }

    /// Server-side copy of every object under a prefix.
    pub fn schedule_copy_directory(
        &self,
        source: RemoteFolder,
        destination: RemoteFolder,
        options: ScheduleOptions,
    ) -> Result<JobProperties> {
        let model = JobModel {
            source: TransferEnd::remote_folder(source.store.as_ref(), &source.prefix),
            destination: TransferEnd::remote_folder(destination.store.as_ref(), &destination.prefix),
        };
        self.schedule(
            model,
            Self::params(Some(source.store), Some(destination.store), options),
        )
    }

    /// Stop handing out the job's tasks. Tasks already running finish;
    /// queued ones are parked.
    pub fn pause_job(&self, job_id: &str) -> Result<()> {
        self.jobs.pause_job(job_id)
    }

    /// Continue a paused job, or load an interrupted job from its plan.
    pub fn resume_job(&self, job_id: &str, options: ResumeJobOptions) -> Result<JobProperties> {
        let params = HydrationParameters {
            source_store: options.source_store,
            destination_store: options.destination_store,
            progress_handler: options.progress_handler,
            error_handler: options.error_handler,
            overwrite: options.overwrite,
        };
        let props = self.jobs.resume_job(job_id, params)?;
        tracing::info!(job_id, "job resumed");
        Ok(props)
    }

    /// Cancel the job and discard its plan. Queued tasks are dropped without
    /// running.
    pub fn cancel_job(&self, job_id: &str) -> Result<()> {
        self.jobs.cancel_job(job_id)
    }

    /// Discard the plan of a job that is not loaded, e.g. one that finished
    /// with failures.
    pub fn remove_job(&self, job_id: &str) -> Result<()> {
        self.jobs.remove_job(job_id)
    }
}

impl Drop for TransferManager {
    fn drop(&mut self) {
        self.jobs.stop();
        self.engine.shutdown();
        tracing::info!("transfer manager stopped");
    }
}
