//! On-disk journal for job plans.
//!
//! Every file in a plan directory is written to `<name>.tmp` first and then
//! renamed into place, so a crash never leaves a half-written record behind.
//! Files that are no longer needed are renamed with a `.delete` suffix rather
//! than removed.

mod bitmap;
mod codec;
mod job_info;
mod part_file;
mod part_gens;

pub use bitmap::DoneBitmap;
pub use codec::{
    write_i32_le, write_string, write_varint, zigzag_decode, zigzag_encode, CodecError, Reader,
};
pub use job_info::{Counter, JobCounters, JobInfoFile, JOB_INFO_FILE};
pub use part_file::{
    open_part_file, parse_part_file_name, part_file_name, write_part_file, PartFile, PartRecord,
    PART_FORMAT_VERSION,
};
pub use part_gens::{PartGenLog, PartGenRecord, PART_GENS_FILE};

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::PlanError;

/// Suffix for journal files that have been written but not yet renamed.
pub const TMP_SUFFIX: &str = ".tmp";
/// Suffix for retired journal files and plan directories.
pub const DELETE_SUFFIX: &str = ".delete";

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut o = path.as_os_str().to_owned();
    o.push(suffix);
    PathBuf::from(o)
}

/// `path` with `.delete` appended.
pub fn retire_path(path: &Path) -> PathBuf {
    with_suffix(path, DELETE_SUFFIX)
}

/// Write `data` to `<path>.tmp`, sync it, and rename over `path`.
pub fn write_atomically(path: &Path, data: &[u8]) -> Result<(), PlanError> {
    let tmp = with_suffix(path, TMP_SUFFIX);
    let mut file = File::create(&tmp).map_err(PlanError::io_at(&tmp))?;
    file.write_all(data).map_err(PlanError::io_at(&tmp))?;
    file.sync_all().map_err(PlanError::io_at(&tmp))?;
    drop(file);
    fs::rename(&tmp, path).map_err(PlanError::io_at(path))?;
    Ok(())
}

/// Rename `path` (file or directory) to `<path>.delete`, replacing any
/// earlier retired copy.
pub fn retire(path: &Path) -> Result<PathBuf, PlanError> {
    let target = retire_path(path);
    if target.is_dir() {
        fs::remove_dir_all(&target).map_err(PlanError::io_at(&target))?;
    }
    fs::rename(path, &target).map_err(PlanError::io_at(path))?;
    Ok(target)
}
