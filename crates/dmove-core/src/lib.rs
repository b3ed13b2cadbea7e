//! dmove core: resumable bulk transfers between a local filesystem and a
//! remote blob store.
//!
//! A transfer is a job. Its durable state lives in a plan directory (job
//! info, part generator log, part files with done bitmaps) so an interrupted
//! job resumes from the last completed chunk. Tasks hydrated from plan parts
//! run on the [`engine::TransferEngine`], which gates disk work on a shared
//! memory budget. [`manager::TransferManager`] is the entry point.

pub mod config;
pub mod engine;
pub mod error;
pub mod job_engine;
pub mod journal;
pub mod logging;
pub mod manager;
pub mod plan;
pub mod progress;
pub mod remote;
pub mod retry;
pub mod storage;
pub mod task;

pub use error::{Error, PlanError, Result};
pub use manager::{
    JobProperties, JobWaitHandle, RemoteFolder, RemoteObject, ResumeJobOptions, ScheduleOptions,
    TransferManager, TransferManagerOptions,
};
pub use task::{JobStatus, TransferType};
