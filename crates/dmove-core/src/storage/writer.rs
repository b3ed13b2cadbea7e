//! Shared positional writer over one `.part` file.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

/// Handle to an open `.part` file. Clones share the descriptor, and writes
/// carry their own offset, so chunk tasks on different disk workers never
/// contend on a cursor.
#[derive(Clone)]
pub struct StorageWriter {
    file: Arc<File>,
    path: PathBuf,
}

impl std::fmt::Debug for StorageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageWriter")
            .field("path", &self.path)
            .field("handles", &Arc::strong_count(&self.file))
            .finish()
    }
}

#[cfg(unix)]
fn pwrite(file: &File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(not(unix))]
fn pwrite(file: &File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    let mut f = file.try_clone()?;
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(data)
}

impl StorageWriter {
    pub(super) fn new(file: File, path: PathBuf) -> Self {
        Self {
            file: Arc::new(file),
            path,
        }
    }

    /// Reopen the `.part` file of an interrupted download. Chunks written
    /// before the interruption are left in place.
    pub fn open_existing(temp_path: &Path) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(temp_path)
            .with_context(|| format!("no partial download at {}", temp_path.display()))?;
        Ok(Self::new(file, temp_path.to_path_buf()))
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        pwrite(&self.file, offset, data).with_context(|| {
            format!(
                "writing {} bytes at offset {offset} of {}",
                data.len(),
                self.path.display()
            )
        })
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .with_context(|| format!("fsync of {}", self.path.display()))
    }

    pub fn temp_path(&self) -> &Path {
        &self.path
    }

    /// Move the file to `final_path`. Every other clone must already be
    /// dropped; a clone kept alive would write into the renamed file.
    pub fn finalize(self, final_path: &Path) -> Result<()> {
        let Self { file, path } = self;
        drop(file);
        fs::rename(&path, final_path).with_context(|| {
            format!("renaming {} to {}", path.display(), final_path.display())
        })
    }
}
