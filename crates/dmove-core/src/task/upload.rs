//! Upload task bodies.
//!
//! A file that fits in one block goes up with a single [`UploadObject`]. A
//! larger file is read block by block on the disk pool ([`ReadFileRange`]);
//! each read hands its buffer and memory to a [`StageBlock`] on the network
//! pool, and whichever block is staged last spawns [`CommitBlocks`]. That
//! block's journal bit is only set once the commit has gone through.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use super::{JournalContext, Task, TaskBody, TaskClass, TaskSharedStatus};
use crate::engine::TaskContext;
use crate::remote::RemoteStore;
use crate::retry::{run_with_retry, RetryPolicy};
use crate::storage;

/// Block id of block `index`. Fixed width so ids sort in block order.
pub fn block_id(index: u32) -> String {
    format!("{index:08x}")
}

/// Single-request upload of a small file.
#[derive(Debug)]
pub struct UploadObject {
    pub(crate) source: PathBuf,
    pub(crate) store: Arc<dyn RemoteStore>,
    pub(crate) name: String,
    pub(crate) size: u64,
    pub(crate) retry: RetryPolicy,
    pub(crate) source_url: String,
    pub(crate) destination_url: String,
}

impl UploadObject {
    pub(crate) fn run(self, ctx: &mut TaskContext<'_>) {
        let journal = ctx.take_journal();
        let result = storage::read_file_range(&self.source, 0, self.size as usize)
            .map_err(|e| format!("{e:#}"))
            .and_then(|data| {
                run_with_retry(&self.retry, || self.store.put_object(&self.name, &data))
                    .map_err(|e| e.to_string())
            });
        match result {
            Ok(()) => {
                tracing::debug!(name = %self.name, size = self.size, "object uploaded");
                ctx.shared().file_transferred(journal, self.size);
            }
            Err(msg) => {
                ctx.shared()
                    .task_failed(journal, &self.source_url, &self.destination_url, &msg)
            }
        }
    }
}

/// State shared by the block tasks of one multi-block upload.
#[derive(Debug)]
pub struct BlockUpload {
    pub(crate) source: PathBuf,
    pub(crate) store: Arc<dyn RemoteStore>,
    pub(crate) name: String,
    pub(crate) size: u64,
    pub(crate) block_size: u64,
    pub(crate) num_blocks: u32,
    /// Blocks staged so far, including those finished before a resume.
    pub(crate) staged: AtomicU32,
    pub(crate) failed: AtomicBool,
    pub(crate) retry: RetryPolicy,
    pub(crate) source_url: String,
    pub(crate) destination_url: String,
}

impl BlockUpload {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        source: PathBuf,
        store: Arc<dyn RemoteStore>,
        name: String,
        size: u64,
        block_size: u64,
        num_blocks: u32,
        already_staged: u32,
        retry: RetryPolicy,
        source_url: String,
        destination_url: String,
    ) -> Self {
        Self {
            source,
            store,
            name,
            size,
            block_size,
            num_blocks,
            staged: AtomicU32::new(already_staged),
            failed: AtomicBool::new(false),
            retry,
            source_url,
            destination_url,
        }
    }

    /// Offset and length of block `index`.
    pub fn block_range(&self, index: u32) -> (u64, u64) {
        let offset = u64::from(index) * self.block_size;
        (offset, self.block_size.min(self.size.saturating_sub(offset)))
    }

    fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Report the object as failed once; later failing blocks only resolve
    /// their journal slot.
    fn fail(&self, shared: &TaskSharedStatus, journal: Option<JournalContext>, message: &str) {
        if self.failed.swap(true, Ordering::AcqRel) {
            shared.abandon(journal);
        } else {
            shared.task_failed(journal, &self.source_url, &self.destination_url, message);
        }
    }
}

pub(crate) fn attach(task: Task, journal: Option<JournalContext>) -> Task {
    match journal {
        Some(j) => task.with_journal(j),
        None => task,
    }
}

/// Disk read of one block.
#[derive(Debug)]
pub struct ReadFileRange {
    pub(crate) upload: Arc<BlockUpload>,
    pub(crate) block: u32,
}

impl ReadFileRange {
    pub(crate) fn run(self, ctx: &mut TaskContext<'_>) {
        let journal = ctx.take_journal();
        if self.upload.has_failed() {
            ctx.shared().abandon(journal);
            return;
        }
        let (offset, len) = self.upload.block_range(self.block);
        match storage::read_file_range(&self.upload.source, offset, len as usize) {
            Ok(data) => {
                let held = ctx.held_memory();
                let stage = ctx.child(
                    TaskClass::NetworkUpload,
                    0,
                    TaskBody::StageBlock(StageBlock {
                        upload: self.upload,
                        block: self.block,
                        data,
                    }),
                );
                ctx.spawn_with_memory(attach(stage, journal), held);
            }
            Err(e) => self.upload.fail(ctx.shared(), journal, &format!("{e:#}")),
        }
    }
}

/// Network stage of one block read by [`ReadFileRange`].
pub struct StageBlock {
    pub(crate) upload: Arc<BlockUpload>,
    pub(crate) block: u32,
    pub(crate) data: Vec<u8>,
}

impl std::fmt::Debug for StageBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageBlock")
            .field("name", &self.upload.name)
            .field("block", &self.block)
            .field("len", &self.data.len())
            .finish()
    }
}

impl StageBlock {
    pub(crate) fn run(self, ctx: &mut TaskContext<'_>) {
        let journal = ctx.take_journal();
        let upload = self.upload;
        if upload.has_failed() {
            ctx.shared().abandon(journal);
            return;
        }
        let id = block_id(self.block);
        let staged = run_with_retry(&upload.retry, || {
            upload.store.stage_block(&upload.name, &id, &self.data)
        });
        if let Err(e) = staged {
            upload.fail(ctx.shared(), journal, &e.to_string());
            return;
        }

        let len = self.data.len() as u64;
        let count = upload.staged.fetch_add(1, Ordering::AcqRel) + 1;
        if count == upload.num_blocks {
            let commit = ctx.child(
                TaskClass::Other,
                0,
                TaskBody::CommitBlocks(CommitBlocks {
                    upload,
                    last_len: len,
                }),
            );
            ctx.spawn(attach(commit, journal));
        } else {
            ctx.shared().chunk_transferred(journal, len);
        }
    }
}

/// Assembles the object once every block is staged.
#[derive(Debug)]
pub struct CommitBlocks {
    pub(crate) upload: Arc<BlockUpload>,
    /// Length of the block whose journal slot this task carries.
    pub(crate) last_len: u64,
}

impl CommitBlocks {
    pub(crate) fn run(self, ctx: &mut TaskContext<'_>) {
        let journal = ctx.take_journal();
        let upload = &self.upload;
        let ids: Vec<String> = (0..upload.num_blocks).map(block_id).collect();
        match run_with_retry(&upload.retry, || upload.store.commit_blocks(&upload.name, &ids)) {
            Ok(()) => {
                tracing::debug!(name = %upload.name, blocks = upload.num_blocks, "block list committed");
                ctx.shared().file_transferred(journal, self.last_len);
            }
            Err(e) => upload.fail(ctx.shared(), journal, &e.to_string()),
        }
    }
}
