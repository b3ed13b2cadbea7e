//! Creating `.part` files for fresh downloads.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::writer::StorageWriter;

/// A freshly truncated `.part` file, sized with [`preallocate`] before it is
/// turned into a shareable [`StorageWriter`].
///
/// [`preallocate`]: StorageWriterBuilder::preallocate
#[derive(Debug)]
pub struct StorageWriterBuilder {
    file: File,
    path: PathBuf,
}

impl StorageWriterBuilder {
    /// Create (or truncate) `temp_path`, making missing parent directories.
    pub fn create(temp_path: &Path) -> Result<Self> {
        if let Some(parent) = temp_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating download directory {}", parent.display()))?;
        }
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(temp_path)
            .with_context(|| format!("creating {}", temp_path.display()))?;
        Ok(Self {
            file,
            path: temp_path.to_path_buf(),
        })
    }

    /// Reserve `size` bytes. Real blocks via `posix_fallocate` where the
    /// filesystem supports it, a sparse `set_len` otherwise.
    pub fn preallocate(&mut self, size: u64) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        if self.fallocate(size) {
            return Ok(());
        }
        self.file
            .set_len(size)
            .with_context(|| format!("sizing {} to {size} bytes", self.path.display()))
    }

    #[cfg(unix)]
    fn fallocate(&self, size: u64) -> bool {
        use std::os::unix::io::AsRawFd;
        let Ok(len) = libc::off_t::try_from(size) else {
            return false;
        };
        // SAFETY: the descriptor is owned by `self.file` and open for writing.
        let rc = unsafe { libc::posix_fallocate(self.file.as_raw_fd(), 0, len) };
        if rc != 0 {
            tracing::debug!(errno = rc, path = %self.path.display(), "posix_fallocate unavailable, using set_len");
        }
        rc == 0
    }

    #[cfg(not(unix))]
    fn fallocate(&self, _size: u64) -> bool {
        false
    }

    pub fn build(self) -> StorageWriter {
        StorageWriter::new(self.file, self.path)
    }
}
