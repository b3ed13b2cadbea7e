//! Tasks: the units of work the transfer engine schedules.
//!
//! A [`Task`] is tagged with a [`TaskClass`] that picks its queue, carries a
//! memory cost reserved at admission, and may hold a journal slot that it
//! resolves when its subtask succeeds or fails. Task bodies are a closed set
//! of transfer steps plus a boxed closure for ad-hoc work.

mod copy;
mod download;
mod status;
mod upload;

pub use copy::{ServerCopy, StartCopy, WaitCopy};
pub use download::{DownloadRange, RangedDownload, WriteFileRange};
pub use status::{SharedStatusOptions, TaskSharedStatus};
pub use upload::{block_id, BlockUpload, CommitBlocks, ReadFileRange, StageBlock, UploadObject};

pub use crate::plan::JournalContext;

use std::fmt;
use std::sync::Arc;

use crate::engine::TaskContext;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum JobStatus {
    InProgress = 0,
    Paused = 1,
    Succeeded = 2,
    Failed = 3,
    PartiallySucceeded = 4,
    Cancelled = 5,
}

impl JobStatus {
    pub(crate) fn from_u8(v: u8) -> JobStatus {
        match v {
            0 => JobStatus::InProgress,
            1 => JobStatus::Paused,
            2 => JobStatus::Succeeded,
            3 => JobStatus::Failed,
            4 => JobStatus::PartiallySucceeded,
            _ => JobStatus::Cancelled,
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::InProgress | JobStatus::Paused)
    }

    /// Tasks of a job in this status are dropped instead of executed.
    pub(crate) fn drops_tasks(self) -> bool {
        matches!(self, JobStatus::Cancelled | JobStatus::Failed)
    }
}

/// Kind of transfer a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferType {
    SingleUpload,
    DirectoryUpload,
    SingleDownload,
    DirectoryDownload,
    SingleCopy,
    DirectoryCopy,
}

/// Scheduling class of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskClass {
    /// Local disk reads/writes; admitted against the memory budget in FIFO order.
    DiskIo,
    NetworkUpload,
    NetworkDownload,
    /// Completion-chain continuations; skip the pending queues entirely.
    Other,
}

/// Ad-hoc task body.
pub type CustomBody = Box<dyn FnOnce(&mut TaskContext<'_>) + Send>;

/// What a task does when executed.
pub enum TaskBody {
    UploadObject(UploadObject),
    ReadFileRange(ReadFileRange),
    StageBlock(StageBlock),
    CommitBlocks(CommitBlocks),
    DownloadRange(DownloadRange),
    WriteFileRange(WriteFileRange),
    StartCopy(StartCopy),
    WaitCopy(WaitCopy),
    Custom(CustomBody),
}

impl TaskBody {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            TaskBody::UploadObject(_) => "upload_object",
            TaskBody::ReadFileRange(_) => "read_file_range",
            TaskBody::StageBlock(_) => "stage_block",
            TaskBody::CommitBlocks(_) => "commit_blocks",
            TaskBody::DownloadRange(_) => "download_range",
            TaskBody::WriteFileRange(_) => "write_file_range",
            TaskBody::StartCopy(_) => "start_copy",
            TaskBody::WaitCopy(_) => "wait_copy",
            TaskBody::Custom(_) => "custom",
        }
    }

    pub(crate) fn run(self, ctx: &mut TaskContext<'_>) {
        match self {
            TaskBody::UploadObject(t) => t.run(ctx),
            TaskBody::ReadFileRange(t) => t.run(ctx),
            TaskBody::StageBlock(t) => t.run(ctx),
            TaskBody::CommitBlocks(t) => t.run(ctx),
            TaskBody::DownloadRange(t) => t.run(ctx),
            TaskBody::WriteFileRange(t) => t.run(ctx),
            TaskBody::StartCopy(t) => t.run(ctx),
            TaskBody::WaitCopy(t) => t.run(ctx),
            TaskBody::Custom(f) => f(ctx),
        }
    }
}

impl fmt::Debug for TaskBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One schedulable unit of work.
///
/// `memory_cost` is reserved when the engine admits the task and from then on
/// counts toward `memory_give_back`, the amount released after the task runs.
/// A running task can move part of what it holds to a child it spawns.
#[derive(Debug)]
pub struct Task {
    pub(crate) class: TaskClass,
    pub(crate) memory_cost: u64,
    pub(crate) memory_give_back: u64,
    pub(crate) shared: Arc<TaskSharedStatus>,
    pub(crate) journal: Option<JournalContext>,
    pub(crate) body: TaskBody,
}

impl Task {
    pub fn new(class: TaskClass, memory_cost: u64, shared: Arc<TaskSharedStatus>, body: TaskBody) -> Self {
        Self {
            class,
            memory_cost,
            memory_give_back: 0,
            shared,
            journal: None,
            body,
        }
    }

    /// Task running `f` when executed.
    pub fn custom<F>(class: TaskClass, memory_cost: u64, shared: Arc<TaskSharedStatus>, f: F) -> Self
    where
        F: FnOnce(&mut TaskContext<'_>) + Send + 'static,
    {
        Self::new(class, memory_cost, shared, TaskBody::Custom(Box::new(f)))
    }

    pub fn with_journal(mut self, journal: JournalContext) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn class(&self) -> TaskClass {
        self.class
    }

    pub fn memory_cost(&self) -> u64 {
        self.memory_cost
    }

    pub fn memory_give_back(&self) -> u64 {
        self.memory_give_back
    }

    pub fn shared(&self) -> &Arc<TaskSharedStatus> {
        &self.shared
    }

    pub fn journal(&self) -> Option<&JournalContext> {
        self.journal.as_ref()
    }

    pub fn body(&self) -> &TaskBody {
        &self.body
    }

    pub(crate) fn take_journal(&mut self) -> Option<JournalContext> {
        self.journal.take()
    }

    pub(crate) fn status(&self) -> JobStatus {
        self.shared.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        for s in [
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::PartiallySucceeded,
            JobStatus::Cancelled,
        ] {
            assert!(s.is_terminal());
            assert_eq!(JobStatus::from_u8(s as u8), s);
        }
        assert!(JobStatus::Cancelled.drops_tasks());
        assert!(!JobStatus::Paused.drops_tasks());
    }

    #[test]
    fn new_task_holds_no_memory() {
        let shared = TaskSharedStatus::new("job");
        let t = Task::custom(TaskClass::DiskIo, 42, shared, |_| {});
        assert_eq!(t.memory_cost(), 42);
        assert_eq!(t.memory_give_back(), 0);
        assert!(t.journal().is_none());
        assert_eq!(format!("{:?}", t.body()), "custom");
    }
}
