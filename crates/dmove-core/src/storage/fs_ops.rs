//! Directory listing and ranged reads on the local filesystem.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::Path;

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    /// File size in bytes (0 for directories).
    pub size: u64,
}

/// List `dir`, sorted by name. Symlinks are followed; entries whose names are
/// not valid UTF-8 or that vanish mid-listing are skipped with a warning.
pub fn list_directory(dir: &Path) -> Result<Vec<DirEntry>> {
    let mut out = Vec::new();
    let read = fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    for entry in read {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        let Ok(name) = entry.file_name().into_string() else {
            tracing::warn!(dir = %dir.display(), "skipping entry with non-UTF-8 name");
            continue;
        };
        let meta = match fs::metadata(entry.path()) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        out.push(DirEntry {
            name,
            is_dir: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
        });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

pub fn file_size(path: &Path) -> Result<u64> {
    let meta = fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
    if !meta.is_file() {
        anyhow::bail!("{} is not a regular file", path.display());
    }
    Ok(meta.len())
}

/// Read exactly `len` bytes at `offset`.
pub fn read_file_range(path: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut buf = vec![0u8; len];
    read_exact_at(&file, &mut buf, offset)
        .with_context(|| format!("failed to read {} bytes at {} from {}", len, offset, path.display()))?;
    Ok(buf)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(not(unix))]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    let mut f = file.try_clone()?;
    f.seek(SeekFrom::Start(offset))?;
    f.read_exact(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_is_sorted_and_typed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), b"12345").unwrap();
        fs::create_dir(dir.path().join("a")).unwrap();
        fs::write(dir.path().join("c"), b"").unwrap();

        let entries = list_directory(dir.path()).unwrap();
        let summary: Vec<(&str, bool, u64)> = entries
            .iter()
            .map(|e| (e.name.as_str(), e.is_dir, e.size))
            .collect();
        assert_eq!(summary, vec![("a", true, 0), ("b.txt", false, 5), ("c", false, 0)]);
    }

    #[test]
    fn ranged_reads() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f");
        fs::write(&p, b"0123456789").unwrap();
        assert_eq!(read_file_range(&p, 3, 4).unwrap(), b"3456");
        assert_eq!(read_file_range(&p, 10, 0).unwrap(), b"");
        assert!(read_file_range(&p, 8, 4).is_err());
        assert_eq!(file_size(&p).unwrap(), 10);
        assert!(file_size(dir.path()).is_err());
    }
}
