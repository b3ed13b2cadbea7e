//! `job_info`: persistent job counters plus the serialized job record.
//!
//! Layout: four little-endian `i64` counters (files transferred, files
//! skipped, files failed, bytes transferred) followed by a varint-length
//! prefixed record string. The counter header stays mapped while the job is
//! loaded so counter updates land in the file without explicit writes.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use memmap2::{MmapMut, MmapOptions};

use super::codec::{self, Reader};
use super::write_atomically;
use crate::error::PlanError;

pub const JOB_INFO_FILE: &str = "job_info";

const HEADER_LEN: usize = 32;

/// One of the four persisted job counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    FilesTransferred = 0,
    FilesSkipped = 1,
    FilesFailed = 2,
    BytesTransferred = 3,
}

/// Snapshot of the persisted counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounters {
    pub files_transferred: i64,
    pub files_skipped: i64,
    pub files_failed: i64,
    pub bytes_transferred: i64,
}

/// Open `job_info` file with its counter header mapped.
#[derive(Debug)]
pub struct JobInfoFile {
    path: PathBuf,
    header: Mutex<MmapMut>,
}

impl JobInfoFile {
    /// Write a fresh `job_info` with zeroed counters into `dir`.
    pub fn create(dir: &Path, record: &str) -> Result<(), PlanError> {
        let mut buf = vec![0u8; HEADER_LEN];
        codec::write_string(&mut buf, record);
        write_atomically(&dir.join(JOB_INFO_FILE), &buf)
    }

    /// Open `job_info` in `dir`, returning the mapped counters and the record string.
    pub fn open(dir: &Path) -> Result<(Self, String), PlanError> {
        let path = dir.join(JOB_INFO_FILE);
        let data = fs::read(&path).map_err(PlanError::io_at(&path))?;
        if data.len() < HEADER_LEN {
            return Err(PlanError::corrupt(&path, "job_info shorter than its header"));
        }
        let mut reader = Reader::new(&data[HEADER_LEN..]);
        let record = reader
            .read_string()
            .map_err(|e| PlanError::codec(&path, e))?;

        let file = File::options()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(PlanError::io_at(&path))?;
        // Safety: job_info is only written by the plan that owns it.
        let header = unsafe { MmapOptions::new().len(HEADER_LEN).map_mut(&file) }
            .map_err(PlanError::io_at(&path))?;
        Ok((
            Self {
                path,
                header: Mutex::new(header),
            },
            record,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn counters(&self) -> JobCounters {
        let h = self.header.lock().unwrap();
        JobCounters {
            files_transferred: read_slot(&h, Counter::FilesTransferred),
            files_skipped: read_slot(&h, Counter::FilesSkipped),
            files_failed: read_slot(&h, Counter::FilesFailed),
            bytes_transferred: read_slot(&h, Counter::BytesTransferred),
        }
    }

    /// Add `delta` to one counter.
    pub fn add(&self, counter: Counter, delta: i64) {
        let mut h = self.header.lock().unwrap();
        let v = read_slot(&h, counter) + delta;
        let at = counter as usize * 8;
        h[at..at + 8].copy_from_slice(&v.to_le_bytes());
    }

    /// Overwrite one counter.
    pub fn store(&self, counter: Counter, value: i64) {
        let mut h = self.header.lock().unwrap();
        let at = counter as usize * 8;
        h[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.header.lock().unwrap().flush()
    }
}

fn read_slot(header: &[u8], counter: Counter) -> i64 {
    let at = counter as usize * 8;
    let mut b = [0u8; 8];
    b.copy_from_slice(&header[at..at + 8]);
    i64::from_le_bytes(b)
}
