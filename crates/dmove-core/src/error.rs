//! Typed errors for plan persistence and the manager surface.
//!
//! Task execution failures never show up here: they are recorded against the
//! job's counters and reported through its error handler.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::journal::CodecError;
use crate::remote::RemoteError;
use crate::task::JobStatus;

/// Failure reading, writing or generating a job plan.
///
/// Any of these is fatal to the affected job only.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan i/o on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt plan file {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("unsupported plan format version {version} in {}", path.display())]
    UnsupportedVersion { path: PathBuf, version: i32 },
    #[error("plan record encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("listing source failed: {0}")]
    Remote(#[from] RemoteError),
    #[error("cannot read source {}: {message}", path.display())]
    Source { path: PathBuf, message: String },
    #[error("{0}")]
    Invalid(String),
}

impl PlanError {
    /// Map an io error to `PlanError::Io` tagged with `path`.
    pub fn io_at(path: &Path) -> impl FnOnce(io::Error) -> PlanError + '_ {
        move |source| PlanError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn corrupt(path: &Path, reason: impl Into<String>) -> PlanError {
        PlanError::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub(crate) fn codec(path: &Path, e: CodecError) -> PlanError {
        PlanError::corrupt(path, e.to_string())
    }
}

/// Errors returned by [`crate::TransferManager`] operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("job {0} is already active")]
    JobAlreadyExists(String),
    #[error("job {job_id} is {status:?}")]
    InvalidState { job_id: String, status: JobStatus },
    #[error("invalid transfer endpoint: {0}")]
    InvalidEndpoint(String),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("job engine has stopped")]
    EngineStopped,
    #[error("failed to start thread {name}: {source}")]
    Thread {
        name: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
