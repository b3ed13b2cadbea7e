//! Job plans: the durable, resumable description of a transfer.
//!
//! A plan directory holds the job's `job_info` record, its `part_gens` log
//! of unexpanded listing work, and part files of task models with done
//! bitmaps. [`JobPlan`] expands generators into parts lazily and hydrates one
//! part at a time into engine tasks, so memory stays bounded however large
//! the source tree is.

mod generate;
mod hydrate;
mod job_plan;
mod model;
mod part;

pub use job_plan::JobPlan;
pub use model::{
    normalize_prefix, Direction, JobModel, PartGenerator, TaskModel, TransferEnd,
    SUBTASKS_ATTRIBUTE,
};
pub use part::{JobPart, JournalContext, PartDoneHook};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::progress::{ErrorHandler, ProgressHandler};
use crate::remote::RemoteStore;
use crate::retry::RetryPolicy;

/// Sizes that shape how a job is split into parts and subtasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    pub upload_block_size: u64,
    pub download_block_size: u64,
    /// Target number of done bits per part. A single object with more chunks
    /// gets a part of its own.
    pub subtasks_per_part: usize,
    /// Subtasks one generator expansion may produce before the rest of the
    /// listing is deferred to new generators.
    pub max_subtasks_generated: usize,
    pub list_page_size: usize,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            upload_block_size: 8 * 1024 * 1024,
            download_block_size: 8 * 1024 * 1024,
            subtasks_per_part: 50_000,
            max_subtasks_generated: 1_000_000,
            list_page_size: 250,
        }
    }
}

/// Engine-side settings a plan needs to build tasks.
#[derive(Debug, Clone)]
pub struct PlanSettings {
    pub limits: PlanLimits,
    pub retry: RetryPolicy,
    pub copy_poll_interval: Duration,
    pub progress_interval: Duration,
}

impl Default for PlanSettings {
    fn default() -> Self {
        Self {
            limits: PlanLimits::default(),
            retry: RetryPolicy::default(),
            copy_poll_interval: Duration::from_secs(1),
            progress_interval: Duration::from_millis(500),
        }
    }
}

/// Runtime inputs supplied each time a job is created or resumed. None of
/// this is persisted.
#[derive(Clone, Default)]
pub struct HydrationParameters {
    pub source_store: Option<Arc<dyn RemoteStore>>,
    pub destination_store: Option<Arc<dyn RemoteStore>>,
    pub progress_handler: Option<ProgressHandler>,
    pub error_handler: Option<ErrorHandler>,
    /// Replace existing local files on download.
    pub overwrite: bool,
}

impl fmt::Debug for HydrationParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HydrationParameters")
            .field("source_store", &self.source_store)
            .field("destination_store", &self.destination_store)
            .field("progress_handler", &self.progress_handler.is_some())
            .field("error_handler", &self.error_handler.is_some())
            .field("overwrite", &self.overwrite)
            .finish()
    }
}
