//! Download task bodies.
//!
//! Each chunk is fetched on the network pool ([`DownloadRange`]) and written
//! into `<destination>.part` on the disk pool ([`WriteFileRange`]), which
//! inherits the fetch's memory. The write that completes the object syncs the
//! file and renames it into place before its journal bit is set.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};

use super::upload::attach;
use super::{JournalContext, TaskBody, TaskClass, TaskSharedStatus};
use crate::engine::TaskContext;
use crate::remote::RemoteStore;
use crate::retry::{run_with_retry, RetryPolicy};
use crate::storage::{self, StorageWriter, StorageWriterBuilder};

#[derive(Debug)]
enum WriterState {
    Unopened,
    Open(StorageWriter),
    Finalized,
}

/// State shared by the chunk tasks of one download.
#[derive(Debug)]
pub struct RangedDownload {
    pub(crate) store: Arc<dyn RemoteStore>,
    pub(crate) name: String,
    pub(crate) destination: PathBuf,
    pub(crate) size: u64,
    pub(crate) chunk_size: u64,
    pub(crate) num_chunks: u32,
    /// Chunks on disk, including those written before a resume.
    written: AtomicU32,
    failed: AtomicBool,
    /// Earlier chunks already sit in the `.part` file, which must be reopened
    /// rather than recreated.
    resume: bool,
    writer: Mutex<WriterState>,
    pub(crate) retry: RetryPolicy,
    pub(crate) source_url: String,
    pub(crate) destination_url: String,
}

impl RangedDownload {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<dyn RemoteStore>,
        name: String,
        destination: PathBuf,
        size: u64,
        chunk_size: u64,
        num_chunks: u32,
        already_written: u32,
        retry: RetryPolicy,
        source_url: String,
        destination_url: String,
    ) -> Self {
        Self {
            store,
            name,
            destination,
            size,
            chunk_size,
            num_chunks,
            written: AtomicU32::new(already_written),
            failed: AtomicBool::new(false),
            resume: already_written > 0,
            writer: Mutex::new(WriterState::Unopened),
            retry,
            source_url,
            destination_url,
        }
    }

    /// Offset and length of chunk `index`.
    pub fn chunk_range(&self, index: u32) -> (u64, u64) {
        if self.chunk_size == 0 {
            return (0, self.size);
        }
        let offset = u64::from(index) * self.chunk_size;
        (offset, self.chunk_size.min(self.size.saturating_sub(offset)))
    }

    fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn fail(&self, shared: &TaskSharedStatus, journal: Option<JournalContext>, message: &str) {
        if self.failed.swap(true, Ordering::AcqRel) {
            shared.abandon(journal);
        } else {
            shared.task_failed(journal, &self.source_url, &self.destination_url, message);
        }
    }

    /// Writer for the `.part` file, opened on first use.
    fn writer(&self) -> Result<StorageWriter> {
        let mut state = self.writer.lock().unwrap();
        match &*state {
            WriterState::Open(w) => return Ok(w.clone()),
            WriterState::Finalized => bail!("{} is already finalized", self.destination.display()),
            WriterState::Unopened => {}
        }
        let temp = storage::temp_path(&self.destination);
        let writer = if self.resume {
            StorageWriter::open_existing(&temp)?
        } else {
            let mut builder = StorageWriterBuilder::create(&temp)?;
            builder.preallocate(self.size)?;
            builder.build()
        };
        *state = WriterState::Open(writer.clone());
        Ok(writer)
    }

    /// Sync and rename the `.part` file. Every other writer clone must be gone.
    fn finish(&self) -> Result<()> {
        let state = std::mem::replace(&mut *self.writer.lock().unwrap(), WriterState::Finalized);
        let WriterState::Open(writer) = state else {
            bail!("no open writer for {}", self.destination.display());
        };
        writer.sync()?;
        writer.finalize(&self.destination)?;
        tracing::debug!(destination = %self.destination.display(), size = self.size, "download finalized");
        Ok(())
    }
}

/// Network fetch of one chunk.
#[derive(Debug)]
pub struct DownloadRange {
    pub(crate) download: Arc<RangedDownload>,
    pub(crate) chunk: u32,
}

impl DownloadRange {
    pub(crate) fn run(self, ctx: &mut TaskContext<'_>) {
        let journal = ctx.take_journal();
        let download = self.download;
        if download.has_failed() {
            ctx.shared().abandon(journal);
            return;
        }
        let (offset, len) = download.chunk_range(self.chunk);
        let fetched = run_with_retry(&download.retry, || {
            download.store.read_range(&download.name, offset, len)
        });
        let data = match fetched {
            Ok(data) if data.len() as u64 == len => data,
            Ok(data) => {
                let msg = format!("short read at {offset}: got {} of {len} bytes", data.len());
                download.fail(ctx.shared(), journal, &msg);
                return;
            }
            Err(e) => {
                download.fail(ctx.shared(), journal, &e.to_string());
                return;
            }
        };
        let held = ctx.held_memory();
        let write = ctx.child(
            TaskClass::DiskIo,
            0,
            TaskBody::WriteFileRange(WriteFileRange {
                download,
                chunk: self.chunk,
                data,
            }),
        );
        ctx.spawn_with_memory(attach(write, journal), held);
    }
}

/// Disk write of one fetched chunk.
pub struct WriteFileRange {
    pub(crate) download: Arc<RangedDownload>,
    pub(crate) chunk: u32,
    pub(crate) data: Vec<u8>,
}

impl std::fmt::Debug for WriteFileRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteFileRange")
            .field("destination", &self.download.destination)
            .field("chunk", &self.chunk)
            .field("len", &self.data.len())
            .finish()
    }
}

impl WriteFileRange {
    pub(crate) fn run(self, ctx: &mut TaskContext<'_>) {
        let journal = ctx.take_journal();
        let download = self.download;
        if download.has_failed() {
            ctx.shared().abandon(journal);
            return;
        }
        let (offset, len) = download.chunk_range(self.chunk);
        let written = download
            .writer()
            .and_then(|w| w.write_at(offset, &self.data));
        drop(self.data);
        if let Err(e) = written {
            download.fail(ctx.shared(), journal, &format!("{e:#}"));
            return;
        }

        let count = download.written.fetch_add(1, Ordering::AcqRel) + 1;
        if count < download.num_chunks {
            ctx.shared().chunk_transferred(journal, len);
            return;
        }
        match download.finish() {
            Ok(()) => ctx.shared().file_transferred(journal, len),
            Err(e) => download.fail(ctx.shared(), journal, &format!("{e:#}")),
        }
    }
}
