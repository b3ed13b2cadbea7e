//! Part file encoding.
//!
//! Layout: `i32` format version, `i32` number of done bits, one byte per done
//! bit, then for each task a varint subtask count and a varint-length record
//! string. The subtask counts must add up to the number of done bits; each
//! task claims the next contiguous run of bits.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use super::codec::{self, Reader};
use super::{write_atomically, DoneBitmap};
use crate::error::PlanError;

pub const PART_FORMAT_VERSION: i32 = 1;

const HEADER_LEN: usize = 8;

/// File name of part `id`: 8 lowercase hex digits.
pub fn part_file_name(id: u32) -> String {
    format!("{id:08x}")
}

/// Inverse of [`part_file_name`]. Anything else in a plan directory is ignored.
pub fn parse_part_file_name(name: &str) -> Option<u32> {
    if name.len() != 8
        || !name
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return None;
    }
    u32::from_str_radix(name, 16).ok()
}

/// One task entry of a part file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartRecord {
    pub num_subtasks: u32,
    pub payload: String,
}

/// A part file opened for marking: its mapped bitmap and task records.
#[derive(Debug)]
pub struct PartFile {
    pub path: PathBuf,
    pub bitmap: DoneBitmap,
    pub records: Vec<PartRecord>,
}

/// Write part `id` into `dir` with every done bit cleared.
pub fn write_part_file(dir: &Path, id: u32, records: &[PartRecord]) -> Result<PathBuf, PlanError> {
    let path = dir.join(part_file_name(id));
    let num_bits: u64 = records.iter().map(|r| u64::from(r.num_subtasks)).sum();
    let num_bits = i32::try_from(num_bits)
        .map_err(|_| PlanError::Invalid(format!("part {id} has too many subtasks ({num_bits})")))?;

    let mut buf = Vec::with_capacity(HEADER_LEN + num_bits as usize + records.len() * 64);
    codec::write_i32_le(&mut buf, PART_FORMAT_VERSION);
    codec::write_i32_le(&mut buf, num_bits);
    buf.resize(HEADER_LEN + num_bits as usize, 0);
    for r in records {
        codec::write_varint(&mut buf, i64::from(r.num_subtasks));
        codec::write_string(&mut buf, &r.payload);
    }
    write_atomically(&path, &buf)?;
    Ok(path)
}

/// Open a part file, validate it, and map its bitmap region.
pub fn open_part_file(path: &Path) -> Result<PartFile, PlanError> {
    let data = fs::read(path).map_err(PlanError::io_at(path))?;
    let mut reader = Reader::new(&data);
    let codec_err = |e| PlanError::codec(path, e);

    let version = reader.read_i32_le().map_err(codec_err)?;
    if version != PART_FORMAT_VERSION {
        return Err(PlanError::UnsupportedVersion {
            path: path.to_path_buf(),
            version,
        });
    }
    let num_bits = reader.read_i32_le().map_err(codec_err)?;
    if num_bits < 0 {
        return Err(PlanError::corrupt(path, format!("negative bit count {num_bits}")));
    }
    let num_bits = num_bits as usize;
    let bits = reader.read_bytes(num_bits).map_err(codec_err)?;
    if let Some(pos) = bits.iter().position(|&b| b > 1) {
        return Err(PlanError::corrupt(path, format!("bad done bit at index {pos}")));
    }

    let mut records = Vec::new();
    let mut claimed = 0usize;
    while !reader.is_empty() {
        let n = reader.read_len().map_err(codec_err)?;
        if n == 0 {
            return Err(PlanError::corrupt(path, "task record with zero subtasks"));
        }
        let num_subtasks = u32::try_from(n)
            .map_err(|_| PlanError::corrupt(path, format!("task record claims {n} subtasks")))?;
        let payload = reader.read_string().map_err(codec_err)?;
        claimed = claimed
            .checked_add(n)
            .ok_or_else(|| PlanError::corrupt(path, "subtask count overflows"))?;
        records.push(PartRecord {
            num_subtasks,
            payload,
        });
    }
    if claimed != num_bits {
        return Err(PlanError::corrupt(
            path,
            format!("records claim {claimed} subtasks but header has {num_bits}"),
        ));
    }

    let file = File::options()
        .read(true)
        .write(true)
        .open(path)
        .map_err(PlanError::io_at(path))?;
    let bitmap = DoneBitmap::map(&file, HEADER_LEN as u64, num_bits).map_err(PlanError::io_at(path))?;
    Ok(PartFile {
        path: path.to_path_buf(),
        bitmap,
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(n: u32, p: &str) -> PartRecord {
        PartRecord {
            num_subtasks: n,
            payload: p.to_string(),
        }
    }

    #[test]
    fn names_are_fixed_width_hex() {
        assert_eq!(part_file_name(0), "00000000");
        assert_eq!(part_file_name(0x2a), "0000002a");
        assert_eq!(parse_part_file_name("0000002a"), Some(42));
        assert_eq!(parse_part_file_name("0000002A"), None);
        assert_eq!(parse_part_file_name("2a"), None);
        assert_eq!(parse_part_file_name("job_info"), None);
        assert_eq!(parse_part_file_name("0000002a.delete"), None);
    }

    #[test]
    fn written_part_reopens_with_clear_bits() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_part_file(dir.path(), 3, &[rec(1, "a"), rec(13, "big"), rec(2, "c")]).unwrap();
        assert_eq!(path.file_name().unwrap(), "00000003");

        let part = open_part_file(&path).unwrap();
        assert_eq!(part.bitmap.len(), 16);
        assert_eq!(part.bitmap.count_set(), 0);
        assert_eq!(part.records, vec![rec(1, "a"), rec(13, "big"), rec(2, "c")]);

        assert!(part.bitmap.set(5));
        drop(part);
        let part = open_part_file(&path).unwrap();
        assert!(part.bitmap.is_set(5));
        assert_eq!(part.bitmap.count_set(), 1);
    }

    #[test]
    fn wrong_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(part_file_name(1));
        let mut buf = Vec::new();
        codec::write_i32_le(&mut buf, 7);
        codec::write_i32_le(&mut buf, 0);
        fs::write(&path, buf).unwrap();
        assert!(matches!(
            open_part_file(&path),
            Err(PlanError::UnsupportedVersion { version: 7, .. })
        ));
    }

    #[test]
    fn mismatched_subtask_count_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(part_file_name(1));
        let mut buf = Vec::new();
        codec::write_i32_le(&mut buf, PART_FORMAT_VERSION);
        codec::write_i32_le(&mut buf, 3);
        buf.extend_from_slice(&[0, 0, 0]);
        codec::write_varint(&mut buf, 2);
        codec::write_string(&mut buf, "x");
        fs::write(&path, buf).unwrap();
        assert!(matches!(open_part_file(&path), Err(PlanError::Corrupt { .. })));
    }

    #[test]
    fn oversized_subtask_count_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(part_file_name(1));
        let mut buf = Vec::new();
        codec::write_i32_le(&mut buf, PART_FORMAT_VERSION);
        codec::write_i32_le(&mut buf, 1);
        buf.push(0);
        codec::write_varint(&mut buf, 1 << 33);
        codec::write_string(&mut buf, "x");
        fs::write(&path, buf).unwrap();
        let err = open_part_file(&path).unwrap_err();
        assert!(
            matches!(&err, PlanError::Corrupt { reason, .. } if reason.contains("claims")),
            "{err}"
        );
    }

    #[test]
    fn truncated_bitmap_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(part_file_name(1));
        let mut buf = Vec::new();
        codec::write_i32_le(&mut buf, PART_FORMAT_VERSION);
        codec::write_i32_le(&mut buf, 50);
        buf.extend_from_slice(&[0; 10]);
        fs::write(&path, buf).unwrap();
        assert!(matches!(open_part_file(&path), Err(PlanError::Corrupt { .. })));
    }
}
