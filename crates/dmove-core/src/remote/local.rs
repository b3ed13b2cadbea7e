//! Directory-backed [`RemoteStore`].
//!
//! Objects live under `<root>/objects/<name>`, staged blocks under
//! `<root>/.staging/<escaped name>/<block id>`. Server-side copies run on a
//! background thread so callers see them go through `Pending`. Used for local
//! emulation and tests; failures can be injected per object name.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use url::Url;

use super::{CopyState, ListPage, ListedObject, ObjectProperties, RemoteError, RemoteStore};
use crate::storage;

const OBJECTS_DIR: &str = "objects";
const STAGING_DIR: &str = ".staging";

#[derive(Debug)]
struct Fault {
    /// Remaining failures; `None` fails forever.
    remaining: Option<u32>,
    error: RemoteError,
}

#[derive(Debug)]
struct Inner {
    root: PathBuf,
    copies: Mutex<HashMap<String, CopyState>>,
    faults: Mutex<HashMap<String, Fault>>,
    copy_delay: Mutex<Duration>,
    object_writes: AtomicUsize,
}

/// Blob store emulated on a local directory. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    inner: Arc<Inner>,
}

impl LocalDirStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(OBJECTS_DIR))
            .with_context(|| format!("failed to create store at {}", root.display()))?;
        fs::create_dir_all(root.join(STAGING_DIR))
            .with_context(|| format!("failed to create staging dir in {}", root.display()))?;
        Ok(Self {
            inner: Arc::new(Inner {
                root,
                copies: Mutex::new(HashMap::new()),
                faults: Mutex::new(HashMap::new()),
                copy_delay: Mutex::new(Duration::ZERO),
                object_writes: AtomicUsize::new(0),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Path of object `name` on disk.
    pub fn object_path(&self, name: &str) -> Result<PathBuf, RemoteError> {
        self.inner.object_path(name)
    }

    /// Make every operation on `name` fail with `error`.
    pub fn fail_object(&self, name: &str, error: RemoteError) {
        self.inner.faults.lock().unwrap().insert(
            name.to_string(),
            Fault {
                remaining: None,
                error,
            },
        );
    }

    /// Make the next `times` operations on `name` fail with `error`.
    pub fn fail_object_times(&self, name: &str, times: u32, error: RemoteError) {
        self.inner.faults.lock().unwrap().insert(
            name.to_string(),
            Fault {
                remaining: Some(times),
                error,
            },
        );
    }

    pub fn clear_faults(&self) {
        self.inner.faults.lock().unwrap().clear();
    }

    /// Delay before a started copy completes.
    pub fn set_copy_delay(&self, delay: Duration) {
        *self.inner.copy_delay.lock().unwrap() = delay;
    }

    /// Number of completed object writes (`put_object` and `commit_blocks`).
    pub fn object_writes(&self) -> usize {
        self.inner.object_writes.load(Ordering::Relaxed)
    }

    /// Names of every stored object, sorted.
    pub fn object_names(&self) -> Result<Vec<String>, RemoteError> {
        let mut names = Vec::new();
        collect_names(&self.inner.root.join(OBJECTS_DIR), "", &mut names)?;
        names.sort();
        Ok(names)
    }
}

impl Inner {
    fn object_path(&self, name: &str) -> Result<PathBuf, RemoteError> {
        let rel = Path::new(name);
        let valid = !name.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(RemoteError::Other(format!("invalid object name {name:?}")));
        }
        Ok(self.root.join(OBJECTS_DIR).join(rel))
    }

    fn staging_dir(&self, name: &str) -> PathBuf {
        let escaped = name.replace('%', "%25").replace('/', "%2F");
        self.root.join(STAGING_DIR).join(escaped)
    }

    fn check_fault(&self, name: &str) -> Result<(), RemoteError> {
        let mut faults = self.faults.lock().unwrap();
        let Some(fault) = faults.get_mut(name) else {
            return Ok(());
        };
        let outcome = match fault.remaining {
            None => Err(fault.error.clone()),
            Some(0) => Ok(()),
            Some(n) => {
                fault.remaining = Some(n - 1);
                Err(fault.error.clone())
            }
        };
        if outcome.is_ok() {
            faults.remove(name);
        }
        outcome
    }

    fn write_object(&self, name: &str, data: &[u8]) -> Result<(), RemoteError> {
        let path = self.object_path(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.root.join(STAGING_DIR).join(format!("{}.put", uuid::Uuid::new_v4()));
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        self.object_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn run_copy(&self, copy_id: &str, source: Arc<dyn RemoteStore>, source_name: &str, name: &str) {
        let delay = *self.copy_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let result = source
            .properties(source_name)
            .and_then(|p| source.read_range(source_name, 0, p.size))
            .and_then(|data| self.write_object(name, &data));
        let state = match result {
            Ok(()) => CopyState::Success,
            Err(e) => CopyState::Failed(e.to_string()),
        };
        tracing::debug!(copy_id, name, ?state, "local copy finished");
        self.copies.lock().unwrap().insert(copy_id.to_string(), state);
    }
}

fn collect_names(dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<(), RemoteError> {
    for entry in storage::list_directory(dir).map_err(|e| RemoteError::Io(format!("{e:#}")))? {
        let name = if prefix.is_empty() {
            entry.name.clone()
        } else {
            format!("{prefix}/{}", entry.name)
        };
        if entry.is_dir {
            collect_names(&dir.join(&entry.name), &name, out)?;
        } else {
            out.push(name);
        }
    }
    Ok(())
}

impl RemoteStore for LocalDirStore {
    fn url(&self) -> String {
        Url::from_directory_path(&self.inner.root)
            .map(|u| u.to_string().trim_end_matches('/').to_string())
            .unwrap_or_else(|_| format!("file://{}", self.inner.root.display()))
    }

    fn properties(&self, name: &str) -> Result<ObjectProperties, RemoteError> {
        self.inner.check_fault(name)?;
        let path = self.inner.object_path(name)?;
        let meta = fs::metadata(&path).map_err(|_| RemoteError::NotFound(name.to_string()))?;
        if !meta.is_file() {
            return Err(RemoteError::NotFound(name.to_string()));
        }
        Ok(ObjectProperties { size: meta.len() })
    }

    fn read_range(&self, name: &str, offset: u64, len: u64) -> Result<Vec<u8>, RemoteError> {
        self.inner.check_fault(name)?;
        let path = self.inner.object_path(name)?;
        if !path.is_file() {
            return Err(RemoteError::NotFound(name.to_string()));
        }
        storage::read_file_range(&path, offset, len as usize)
            .map_err(|e| RemoteError::Io(format!("{e:#}")))
    }

    fn put_object(&self, name: &str, data: &[u8]) -> Result<(), RemoteError> {
        self.inner.check_fault(name)?;
        self.inner.write_object(name, data)
    }

    fn stage_block(&self, name: &str, block_id: &str, data: &[u8]) -> Result<(), RemoteError> {
        self.inner.check_fault(name)?;
        self.inner.object_path(name)?;
        let dir = self.inner.staging_dir(name);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(block_id), data)?;
        Ok(())
    }

    fn commit_blocks(&self, name: &str, block_ids: &[String]) -> Result<(), RemoteError> {
        self.inner.check_fault(name)?;
        let dir = self.inner.staging_dir(name);
        let mut data = Vec::new();
        for id in block_ids {
            let block = fs::read(dir.join(id))
                .map_err(|_| RemoteError::Other(format!("block {id} of {name} was never staged")))?;
            data.extend_from_slice(&block);
        }
        self.inner.write_object(name, &data)?;
        let _ = fs::remove_dir_all(&dir);
        Ok(())
    }

    fn list(
        &self,
        prefix: &str,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<ListPage, RemoteError> {
        let names = self.object_names()?;
        let mut matching = names
            .into_iter()
            .filter(|n| n.starts_with(prefix))
            .filter(|n| continuation.map_or(true, |c| n.as_str() > c))
            .peekable();
        let mut objects = Vec::new();
        while objects.len() < page_size.max(1) {
            let Some(name) = matching.next() else {
                break;
            };
            let size = fs::metadata(self.inner.object_path(&name)?)?.len();
            objects.push(ListedObject { name, size });
        }
        let continuation = match (matching.peek(), objects.last()) {
            (Some(_), Some(last)) => Some(last.name.clone()),
            _ => None,
        };
        Ok(ListPage {
            objects,
            continuation,
        })
    }

    fn start_copy(
        &self,
        source: Arc<dyn RemoteStore>,
        source_name: &str,
        name: &str,
    ) -> Result<String, RemoteError> {
        self.inner.check_fault(name)?;
        self.inner.object_path(name)?;
        let copy_id = uuid::Uuid::new_v4().to_string();
        self.inner
            .copies
            .lock()
            .unwrap()
            .insert(copy_id.clone(), CopyState::Pending);

        let inner = Arc::clone(&self.inner);
        let (id, src, dst) = (copy_id.clone(), source_name.to_string(), name.to_string());
        std::thread::Builder::new()
            .name("local-copy".into())
            .spawn(move || inner.run_copy(&id, source, &src, &dst))?;
        Ok(copy_id)
    }

    fn copy_state(&self, _name: &str, copy_id: &str) -> Result<CopyState, RemoteError> {
        self.inner
            .copies
            .lock()
            .unwrap()
            .get(copy_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("copy {copy_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LocalDirStore) {
        let dir = tempfile::tempdir().unwrap();
        let s = LocalDirStore::open(dir.path()).unwrap();
        (dir, s)
    }

    #[test]
    fn put_read_and_properties() {
        let (_d, s) = store();
        s.put_object("a/b.txt", b"hello world").unwrap();
        assert_eq!(s.properties("a/b.txt").unwrap().size, 11);
        assert_eq!(s.read_range("a/b.txt", 6, 5).unwrap(), b"world");
        assert!(matches!(s.properties("missing"), Err(RemoteError::NotFound(_))));
        assert!(s.put_object("../escape", b"x").is_err());
        assert_eq!(s.object_writes(), 1);
    }

    #[test]
    fn staged_blocks_commit_in_order() {
        let (_d, s) = store();
        s.stage_block("big", "0001", b"world").unwrap();
        s.stage_block("big", "0000", b"hello ").unwrap();
        s.commit_blocks("big", &["0000".to_string(), "0001".to_string()])
            .unwrap();
        assert_eq!(s.read_range("big", 0, 11).unwrap(), b"hello world");
        assert!(s
            .commit_blocks("big", &["0000".to_string()])
            .is_err());
    }

    #[test]
    fn listing_pages_by_name() {
        let (_d, s) = store();
        for n in ["p/a", "p/b", "p/c/d", "q/x"] {
            s.put_object(n, n.as_bytes()).unwrap();
        }
        let first = s.list("p/", None, 2).unwrap();
        let names: Vec<_> = first.objects.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["p/a", "p/b"]);
        let token = first.continuation.unwrap();
        let second = s.list("p/", Some(&token), 2).unwrap();
        assert_eq!(second.objects.len(), 1);
        assert_eq!(second.objects[0].name, "p/c/d");
        assert_eq!(second.objects[0].size, 5);
        assert!(second.continuation.is_none());
    }

    #[test]
    fn transient_fault_clears_after_count() {
        let (_d, s) = store();
        s.fail_object_times("x", 2, RemoteError::Throttled);
        assert_eq!(s.put_object("x", b"1"), Err(RemoteError::Throttled));
        assert_eq!(s.put_object("x", b"1"), Err(RemoteError::Throttled));
        assert!(s.put_object("x", b"1").is_ok());
    }

    #[test]
    fn copy_completes_in_background() {
        let (_d, src) = store();
        let (_d2, dst) = store();
        src.put_object("o", b"payload").unwrap();
        let id = dst
            .start_copy(Arc::new(src.clone()), "o", "copied/o")
            .unwrap();
        let mut state = dst.copy_state("copied/o", &id).unwrap();
        for _ in 0..200 {
            if state != CopyState::Pending {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
            state = dst.copy_state("copied/o", &id).unwrap();
        }
        assert_eq!(state, CopyState::Success);
        assert_eq!(dst.read_range("copied/o", 0, 7).unwrap(), b"payload");
    }
}
