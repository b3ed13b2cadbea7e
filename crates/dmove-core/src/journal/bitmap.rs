//! Memory-mapped done bitmap for one plan part.
//!
//! One byte per subtask (0 = pending, 1 = done). Tasks of the same part run
//! on different workers and mark different bits, so a whole byte per bit keeps
//! concurrent marks from sharing a storage unit. Writes go to the mapping and
//! reach disk through page-cache writeback; `flush` forces them out.

use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use memmap2::{MmapMut, MmapOptions};

/// Done flags for the subtasks of one part, backed by a region of the part file.
#[derive(Debug)]
pub struct DoneBitmap {
    map: Mutex<Option<MmapMut>>,
    len: usize,
    done: AtomicUsize,
}

impl DoneBitmap {
    /// Map `len` bytes of `file` starting at `offset`. The file must be open
    /// for reading and writing and already be at least `offset + len` long.
    pub fn map(file: &File, offset: u64, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Ok(Self::from_map(None, 0));
        }
        // Safety: the part file is owned by this process's plan directory and
        // is never truncated while the part is loaded.
        let map = unsafe { MmapOptions::new().offset(offset).len(len).map_mut(file)? };
        Ok(Self::from_map(Some(map), len))
    }

    /// Anonymous bitmap with no backing file, for callers that only need the
    /// marking semantics.
    pub fn anonymous(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Ok(Self::from_map(None, 0));
        }
        Ok(Self::from_map(Some(MmapMut::map_anon(len)?), len))
    }

    fn from_map(map: Option<MmapMut>, len: usize) -> Self {
        let done = map
            .as_ref()
            .map(|m| m.iter().filter(|&&b| b != 0).count())
            .unwrap_or(0);
        Self {
            map: Mutex::new(map),
            len,
            done: AtomicUsize::new(done),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_set(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        let guard = self.map.lock().unwrap();
        guard.as_ref().map(|m| m[index] != 0).unwrap_or(false)
    }

    /// Mark `index` done. Returns `true` only if the bit was not already set,
    /// so repeated marks of the same subtask are counted once.
    pub fn set(&self, index: usize) -> bool {
        if index >= self.len {
            tracing::warn!(index, len = self.len, "done bit out of range");
            return false;
        }
        let mut guard = self.map.lock().unwrap();
        let Some(map) = guard.as_mut() else {
            return false;
        };
        if map[index] != 0 {
            return false;
        }
        map[index] = 1;
        self.done.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Number of bits set.
    pub fn count_set(&self) -> usize {
        self.done.load(Ordering::Acquire)
    }

    pub fn all_set(&self) -> bool {
        self.count_set() == self.len
    }

    /// Copy of the flags in `[start, start + n)`.
    pub fn snapshot(&self, start: usize, n: usize) -> Vec<bool> {
        let guard = self.map.lock().unwrap();
        (start..start + n)
            .map(|i| {
                i < self.len && guard.as_ref().map(|m| m[i] != 0).unwrap_or(false)
            })
            .collect()
    }

    /// Force mapped writes out to the file.
    pub fn flush(&self) -> io::Result<()> {
        let guard = self.map.lock().unwrap();
        match guard.as_ref() {
            Some(m) => m.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn set_is_idempotent() {
        let bm = DoneBitmap::anonymous(4).unwrap();
        assert_eq!(bm.count_set(), 0);
        assert!(bm.set(2));
        assert!(!bm.set(2));
        assert!(bm.is_set(2));
        assert!(!bm.is_set(1));
        assert_eq!(bm.count_set(), 1);
        assert!(!bm.set(9));
        assert!(!bm.all_set());
        for i in 0..4 {
            bm.set(i);
        }
        assert!(bm.all_set());
        assert_eq!(bm.snapshot(1, 3), vec![true, true, true]);
    }

    #[test]
    fn empty_bitmap_is_complete() {
        let bm = DoneBitmap::anonymous(0).unwrap();
        assert!(bm.is_empty());
        assert!(bm.all_set());
        assert!(!bm.set(0));
    }

    #[test]
    fn marks_reach_the_file_region() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"HEADER__").unwrap();
        file.write_all(&[0, 1, 0]).unwrap();
        file.write_all(b"tail").unwrap();

        let bm = DoneBitmap::map(&file, 8, 3).unwrap();
        assert_eq!(bm.count_set(), 1);
        assert!(bm.is_set(1));
        assert!(bm.set(0));
        assert!(bm.set(2));
        assert!(bm.all_set());
        bm.flush().unwrap();
        drop(bm);

        let mut buf = Vec::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_end(&mut buf).unwrap();
        assert_eq!(&buf[..8], b"HEADER__");
        assert_eq!(&buf[8..11], &[1, 1, 1]);
        assert_eq!(&buf[11..], b"tail");
    }
}
