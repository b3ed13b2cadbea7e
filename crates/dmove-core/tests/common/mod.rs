//! Shared harness for the integration tests: a temp directory holding a plans
//! dir, a local source tree and a directory-backed store.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dmove_core::engine::EngineOptions;
use dmove_core::plan::PlanLimits;
use dmove_core::progress::{ErrorHandler, ProgressHandler, TransferError, TransferProgress};
use dmove_core::remote::{LocalDirStore, RemoteStore};
use dmove_core::retry::RetryPolicy;
use dmove_core::{ScheduleOptions, TransferManager, TransferManagerOptions};
use tempfile::TempDir;

pub const MIB: u64 = 1024 * 1024;

pub struct Harness {
    pub dir: TempDir,
    pub store: LocalDirStore,
    pub limits: PlanLimits,
}

impl Harness {
    pub fn new() -> Self {
        dmove_core::logging::init_logging_stderr();
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDirStore::open(dir.path().join("store")).unwrap();
        Self {
            dir,
            store,
            limits: PlanLimits::default(),
        }
    }

    pub fn plans(&self) -> PathBuf {
        self.dir.path().join("plans")
    }

    /// Path under the harness' scratch area.
    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn remote(&self) -> Arc<dyn RemoteStore> {
        Arc::new(self.store.clone())
    }

    pub fn options(&self) -> TransferManagerOptions {
        let mut o = TransferManagerOptions::new(self.plans());
        o.engine = EngineOptions {
            num_threads: Some(4),
            max_memory_size: Some(64 * MIB),
            disk_io_threads: 2,
        };
        o.limits = self.limits;
        o.retry = RetryPolicy::no_retry();
        o.copy_poll_interval = Duration::from_millis(10);
        o.progress_interval = Duration::ZERO;
        o
    }

    pub fn manager(&self) -> TransferManager {
        TransferManager::new(self.options()).unwrap()
    }
}

/// Deterministic, non-repeating-per-block content.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32 * 7) as u8)
        .collect()
}

/// Write `files` (relative path, content) under `root`.
pub fn write_tree(root: &Path, files: &[(&str, Vec<u8>)]) {
    for (rel, data) in files {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }
}

/// Captures the last progress snapshot and every reported failure.
#[derive(Clone, Default)]
pub struct Recorder {
    last: Arc<Mutex<Option<TransferProgress>>>,
    errors: Arc<Mutex<Vec<TransferError>>>,
}

impl Recorder {
    pub fn options(&self) -> ScheduleOptions {
        ScheduleOptions {
            progress_handler: Some(self.progress_handler()),
            error_handler: Some(self.error_handler()),
            overwrite: false,
        }
    }

    pub fn progress_handler(&self) -> ProgressHandler {
        let last = Arc::clone(&self.last);
        Arc::new(move |p: &TransferProgress| {
            *last.lock().unwrap() = Some(p.clone());
        })
    }

    pub fn error_handler(&self) -> ErrorHandler {
        let errors = Arc::clone(&self.errors);
        Arc::new(move |e: &TransferError| errors.lock().unwrap().push(e.clone()))
    }

    /// Last snapshot. Read after the manager is dropped so the final report
    /// has been delivered.
    pub fn last(&self) -> TransferProgress {
        self.last.lock().unwrap().clone().expect("no progress reported")
    }

    pub fn errors(&self) -> Vec<TransferError> {
        self.errors.lock().unwrap().clone()
    }
}
