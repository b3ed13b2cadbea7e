//! `part_gens`: append-only log of part generator records.
//!
//! Each record is a done flag byte followed by a varint-length string. The
//! flag is flipped in place once the generator has been expanded, so record
//! offsets never move.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use super::codec::{self, Reader};
use super::{retire_path, write_atomically};
use crate::error::PlanError;

pub const PART_GENS_FILE: &str = "part_gens";

const FLAG_PENDING: u8 = 0;
const FLAG_DONE: u8 = 1;

/// One record read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartGenRecord {
    /// Byte offset of the record's done flag.
    pub offset: u64,
    pub done: bool,
    pub payload: String,
}

/// Handle to a job's `part_gens` file.
#[derive(Debug)]
pub struct PartGenLog {
    path: PathBuf,
    /// `None` once the log has been retired.
    file: Option<File>,
    len: u64,
}

impl PartGenLog {
    /// Write a new log holding `payloads` as pending records.
    pub fn create(dir: &Path, payloads: &[String]) -> Result<(), PlanError> {
        let mut buf = Vec::new();
        for p in payloads {
            encode_record(&mut buf, p);
        }
        write_atomically(&dir.join(PART_GENS_FILE), &buf)
    }

    /// Open the log in `dir` and read every record. A log that was already
    /// retired opens as empty.
    pub fn open(dir: &Path) -> Result<(Self, Vec<PartGenRecord>), PlanError> {
        let path = dir.join(PART_GENS_FILE);
        if !path.exists() && retire_path(&path).exists() {
            return Ok((
                Self {
                    path,
                    file: None,
                    len: 0,
                },
                Vec::new(),
            ));
        }
        let data = fs::read(&path).map_err(PlanError::io_at(&path))?;
        let records = decode_records(&path, &data)?;
        let file = File::options()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(PlanError::io_at(&path))?;
        Ok((
            Self {
                path,
                file: Some(file),
                len: data.len() as u64,
            },
            records,
        ))
    }

    pub fn is_retired(&self) -> bool {
        self.file.is_none()
    }

    fn file(&self) -> Result<&File, PlanError> {
        self.file.as_ref().ok_or_else(|| {
            PlanError::Invalid(format!("{} has been retired", self.path.display()))
        })
    }

    /// Append pending records, returning their offsets.
    pub fn append(&mut self, payloads: &[String]) -> Result<Vec<u64>, PlanError> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }
        let mut buf = Vec::new();
        let mut offsets = Vec::with_capacity(payloads.len());
        for p in payloads {
            offsets.push(self.len + buf.len() as u64);
            encode_record(&mut buf, p);
        }
        let file = self.file()?;
        write_at(file, self.len, &buf).map_err(PlanError::io_at(&self.path))?;
        file.sync_data().map_err(PlanError::io_at(&self.path))?;
        self.len += buf.len() as u64;
        Ok(offsets)
    }

    /// Flip the done flag of the record at `offset`.
    pub fn mark_done(&mut self, offset: u64) -> Result<(), PlanError> {
        let file = self.file()?;
        if offset >= self.len {
            return Err(PlanError::corrupt(
                &self.path,
                format!("no part generator record at offset {offset}"),
            ));
        }
        write_at(file, offset, &[FLAG_DONE]).map_err(PlanError::io_at(&self.path))?;
        file.sync_data().map_err(PlanError::io_at(&self.path))
    }

    /// Rename the exhausted log to `part_gens.delete`. Later appends fail.
    pub fn retire(&mut self) -> Result<(), PlanError> {
        if self.file.is_none() {
            return Ok(());
        }
        let target = retire_path(&self.path);
        fs::rename(&self.path, &target).map_err(PlanError::io_at(&self.path))?;
        self.file = None;
        tracing::debug!(path = %target.display(), "part generator log retired");
        Ok(())
    }
}

fn encode_record(out: &mut Vec<u8>, payload: &str) {
    out.push(FLAG_PENDING);
    codec::write_string(out, payload);
}

fn decode_records(path: &Path, data: &[u8]) -> Result<Vec<PartGenRecord>, PlanError> {
    let mut reader = Reader::new(data);
    let mut out = Vec::new();
    while !reader.is_empty() {
        let offset = reader.position() as u64;
        let flag = reader.read_u8().map_err(|e| PlanError::codec(path, e))?;
        if flag != FLAG_PENDING && flag != FLAG_DONE {
            return Err(PlanError::corrupt(
                path,
                format!("bad done flag {flag} at offset {offset}"),
            ));
        }
        let payload = reader.read_string().map_err(|e| PlanError::codec(path, e))?;
        out.push(PartGenRecord {
            offset,
            done: flag == FLAG_DONE,
            payload,
        });
    }
    Ok(out)
}

#[cfg(unix)]
fn write_at(file: &File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(not(unix))]
fn write_at(file: &File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    let mut f = file.try_clone()?;
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payloads(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn append_and_mark_keep_offsets_stable() {
        let dir = tempfile::tempdir().unwrap();
        PartGenLog::create(dir.path(), &payloads(&["root"])).unwrap();

        let (mut log, records) = PartGenLog::open(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].offset, 0);
        assert!(!records[0].done);

        let offsets = log.append(&payloads(&["a", "bb"])).unwrap();
        assert_eq!(offsets, vec![6, 9]);
        log.mark_done(0).unwrap();
        log.mark_done(offsets[0]).unwrap();
        drop(log);

        let (_, records) = PartGenLog::open(dir.path()).unwrap();
        let flags: Vec<(u64, bool, &str)> = records
            .iter()
            .map(|r| (r.offset, r.done, r.payload.as_str()))
            .collect();
        assert_eq!(flags, vec![(0, true, "root"), (6, true, "a"), (9, false, "bb")]);
    }

    #[test]
    fn bad_flag_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PART_GENS_FILE), [7u8, 0]).unwrap();
        assert!(matches!(
            PartGenLog::open(dir.path()),
            Err(PlanError::Corrupt { .. })
        ));
    }

    #[test]
    fn retired_log_reopens_empty() {
        let dir = tempfile::tempdir().unwrap();
        PartGenLog::create(dir.path(), &payloads(&["x"])).unwrap();
        let (mut log, _) = PartGenLog::open(dir.path()).unwrap();
        log.retire().unwrap();
        log.retire().unwrap();
        assert!(dir.path().join("part_gens.delete").exists());
        assert!(log.append(&payloads(&["y"])).is_err());

        let (log, records) = PartGenLog::open(dir.path()).unwrap();
        assert!(records.is_empty());
        assert!(log.is_retired());
        assert!(!dir.path().join(PART_GENS_FILE).exists());
    }

    #[test]
    fn done_flag_is_on_disk_while_the_log_is_open() {
        let dir = tempfile::tempdir().unwrap();
        PartGenLog::create(dir.path(), &payloads(&["root", "next"])).unwrap();
        let (mut log, records) = PartGenLog::open(dir.path()).unwrap();
        log.mark_done(records[1].offset).unwrap();

        let (_, seen) = PartGenLog::open(dir.path()).unwrap();
        assert_eq!(seen.iter().map(|r| r.done).collect::<Vec<_>>(), vec![false, true]);
        drop(log);
    }

    #[test]
    fn mark_done_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        PartGenLog::create(dir.path(), &payloads(&["x"])).unwrap();
        let (mut log, _) = PartGenLog::open(dir.path()).unwrap();
        assert!(log.mark_done(100).is_err());
    }
}
