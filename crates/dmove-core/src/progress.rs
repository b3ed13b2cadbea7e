//! Progress and failure reporting for jobs.
//!
//! Every job can carry a progress handler (called with a [`TransferProgress`]
//! snapshot, throttled per job) and an error handler (called once per failed
//! file with a [`TransferError`]). Per-failure detail is not retained after
//! the handler returns.

use std::sync::Arc;

/// Snapshot of one job's counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferProgress {
    pub job_id: String,
    pub files_transferred: i64,
    pub files_skipped: i64,
    pub files_failed: i64,
    pub bytes_transferred: i64,
    /// Seconds since the job was loaded in this process.
    pub elapsed_secs: f64,
}

impl TransferProgress {
    /// Transfer rate in bytes per second for this session (0 if elapsed is 0).
    pub fn bytes_per_sec(&self) -> f64 {
        if self.elapsed_secs <= 0.0 {
            return 0.0;
        }
        self.bytes_transferred as f64 / self.elapsed_secs
    }

    /// Files that reached a final outcome.
    pub fn files_done(&self) -> i64 {
        self.files_transferred + self.files_skipped + self.files_failed
    }
}

/// One failed file, delivered to the job's error handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferError {
    pub job_id: String,
    pub source_url: String,
    pub destination_url: String,
    pub message: String,
}

pub type ProgressHandler = Arc<dyn Fn(&TransferProgress) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&TransferError) + Send + Sync>;
