//! Per-job state shared by every task of the job.
//!
//! Counters are atomics, mirrored into the job's `job_info` file when the job
//! is backed by a plan. The status is an atomic for the scheduler's hot path
//! and a watch channel for waiters; both are updated under the channel's lock.
//! When the last reference goes away a job still `InProgress` settles on a
//! terminal status derived from its counters.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use super::{JobStatus, JournalContext};
use crate::journal::{Counter, JobInfoFile};
use crate::progress::{ErrorHandler, ProgressHandler, TransferError, TransferProgress};

/// Handlers and persistence for [`TaskSharedStatus::with_options`].
#[derive(Clone, Default)]
pub struct SharedStatusOptions {
    pub progress_handler: Option<ProgressHandler>,
    pub error_handler: Option<ErrorHandler>,
    /// Counters are restored from and mirrored into this file.
    pub job_info: Option<Arc<JobInfoFile>>,
    /// Minimum gap between two progress callbacks.
    pub progress_interval: Duration,
}

pub struct TaskSharedStatus {
    job_id: String,
    status: AtomicU8,
    status_tx: watch::Sender<JobStatus>,
    files_transferred: AtomicI64,
    files_skipped: AtomicI64,
    files_failed: AtomicI64,
    bytes_transferred: AtomicI64,
    progress_handler: Option<ProgressHandler>,
    error_handler: Option<ErrorHandler>,
    job_info: Option<Arc<JobInfoFile>>,
    started: Instant,
    progress_interval: Duration,
    last_progress: Mutex<Option<Instant>>,
}

impl fmt::Debug for TaskSharedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSharedStatus")
            .field("job_id", &self.job_id)
            .field("status", &self.status())
            .field("files_transferred", &self.files_transferred.load(Ordering::Relaxed))
            .field("files_failed", &self.files_failed.load(Ordering::Relaxed))
            .finish()
    }
}

impl TaskSharedStatus {
    /// Status with no handlers and no persistence.
    pub fn new(job_id: impl Into<String>) -> Arc<Self> {
        Self::with_options(job_id, SharedStatusOptions::default())
    }

    pub fn with_options(job_id: impl Into<String>, options: SharedStatusOptions) -> Arc<Self> {
        let restored = options
            .job_info
            .as_ref()
            .map(|info| info.counters())
            .unwrap_or_default();
        let (status_tx, _) = watch::channel(JobStatus::InProgress);
        Arc::new(Self {
            job_id: job_id.into(),
            status: AtomicU8::new(JobStatus::InProgress as u8),
            status_tx,
            files_transferred: AtomicI64::new(restored.files_transferred),
            files_skipped: AtomicI64::new(restored.files_skipped),
            files_failed: AtomicI64::new(restored.files_failed),
            bytes_transferred: AtomicI64::new(restored.bytes_transferred),
            progress_handler: options.progress_handler,
            error_handler: options.error_handler,
            job_info: options.job_info,
            started: Instant::now(),
            progress_interval: options.progress_interval,
            last_progress: Mutex::new(None),
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn status(&self) -> JobStatus {
        JobStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Watch the job status.
    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.status_tx.subscribe()
    }

    /// Move to `new` unless the job is already terminal. Returns whether the
    /// status is now `new`.
    pub fn set_status(&self, new: JobStatus) -> bool {
        let mut result = false;
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == new {
                result = true;
                return false;
            }
            if current.is_terminal() {
                return false;
            }
            *current = new;
            self.status.store(new as u8, Ordering::Release);
            result = true;
            true
        });
        if changed {
            tracing::info!(job_id = %self.job_id, status = ?new, "job status changed");
        }
        result
    }

    /// A whole file (or the last chunk of one) finished. Counts the file and
    /// `bytes` only if the journal bit was not already set.
    pub fn file_transferred(&self, journal: Option<JournalContext>, bytes: u64) {
        if mark(&journal) {
            self.bump(Counter::FilesTransferred, 1);
            self.bump(Counter::BytesTransferred, bytes as i64);
            self.report_progress(false);
        }
        resolve(journal);
    }

    /// One chunk of a multi-chunk file finished.
    pub fn chunk_transferred(&self, journal: Option<JournalContext>, bytes: u64) {
        if mark(&journal) {
            self.bump(Counter::BytesTransferred, bytes as i64);
            self.report_progress(false);
        }
        resolve(journal);
    }

    /// The file was left alone (e.g. destination exists and overwrite is off).
    pub fn file_skipped(&self, journal: Option<JournalContext>) {
        if mark(&journal) {
            self.bump(Counter::FilesSkipped, 1);
            self.report_progress(false);
        }
        resolve(journal);
    }

    /// The file failed. Its journal bit stays clear so a resume re-issues it.
    pub fn task_failed(
        &self,
        journal: Option<JournalContext>,
        source_url: &str,
        destination_url: &str,
        message: &str,
    ) {
        self.bump(Counter::FilesFailed, 1);
        tracing::warn!(job_id = %self.job_id, source = source_url, destination = destination_url, error = message, "transfer failed");
        if let Some(handler) = &self.error_handler {
            handler(&TransferError {
                job_id: self.job_id.clone(),
                source_url: source_url.to_string(),
                destination_url: destination_url.to_string(),
                message: message.to_string(),
            });
        }
        self.report_progress(false);
        resolve(journal);
    }

    /// Resolve a journal slot without marking it or counting anything; used
    /// by chunks of an object that already failed.
    pub fn abandon(&self, journal: Option<JournalContext>) {
        resolve(journal);
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            job_id: self.job_id.clone(),
            files_transferred: self.files_transferred.load(Ordering::Acquire),
            files_skipped: self.files_skipped.load(Ordering::Acquire),
            files_failed: self.files_failed.load(Ordering::Acquire),
            bytes_transferred: self.bytes_transferred.load(Ordering::Acquire),
            elapsed_secs: self.started.elapsed().as_secs_f64(),
        }
    }

    /// Terminal status for a job that ran to completion.
    pub fn derive_final_status(&self) -> JobStatus {
        let failed = self.files_failed.load(Ordering::Acquire);
        let done = self.files_transferred.load(Ordering::Acquire)
            + self.files_skipped.load(Ordering::Acquire);
        match (failed, done) {
            (0, _) => JobStatus::Succeeded,
            (_, 0) => JobStatus::Failed,
            _ => JobStatus::PartiallySucceeded,
        }
    }

    fn bump(&self, counter: Counter, delta: i64) {
        if delta == 0 {
            return;
        }
        let slot = match counter {
            Counter::FilesTransferred => &self.files_transferred,
            Counter::FilesSkipped => &self.files_skipped,
            Counter::FilesFailed => &self.files_failed,
            Counter::BytesTransferred => &self.bytes_transferred,
        };
        slot.fetch_add(delta, Ordering::AcqRel);
        if let Some(info) = &self.job_info {
            info.add(counter, delta);
        }
    }

    fn report_progress(&self, force: bool) {
        let Some(handler) = &self.progress_handler else {
            return;
        };
        {
            let mut last = self.last_progress.lock().unwrap();
            let now = Instant::now();
            let due = last.map_or(true, |t| now.duration_since(t) >= self.progress_interval);
            if !force && !due {
                return;
            }
            *last = Some(now);
        }
        handler(&self.progress());
    }
}

fn mark(journal: &Option<JournalContext>) -> bool {
    journal.as_ref().map_or(true, |j| j.mark_done())
}

fn resolve(journal: Option<JournalContext>) {
    if let Some(j) = journal {
        j.resolve();
    }
}

impl Drop for TaskSharedStatus {
    fn drop(&mut self) {
        if self.status() == JobStatus::InProgress {
            let fin = self.derive_final_status();
            self.set_status(fin);
        }
        if let Some(info) = &self.job_info {
            if let Err(e) = info.flush() {
                tracing::warn!(job_id = %self.job_id, error = %e, "failed to flush job counters");
            }
        }
        self.report_progress(true);
        tracing::debug!(job_id = %self.job_id, status = ?self.status(), "job status released");
    }
}
