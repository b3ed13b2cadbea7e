//! A loaded plan part and the journal slots its tasks carry.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::journal::DoneBitmap;

/// Called with `(job_id, part_id)` when the last unresolved subtask of a
/// part resolves.
pub type PartDoneHook = Arc<dyn Fn(&str, u32) + Send + Sync>;

/// Done bitmap of one part plus the count of subtasks still in flight.
pub struct JobPart {
    job_id: String,
    id: u32,
    path: Option<PathBuf>,
    bitmap: DoneBitmap,
    unresolved: AtomicUsize,
    on_settled: PartDoneHook,
}

impl fmt::Debug for JobPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobPart")
            .field("job_id", &self.job_id)
            .field("id", &self.id)
            .field("bits", &self.bitmap.len())
            .field("done", &self.bitmap.count_set())
            .field("unresolved", &self.unresolved())
            .finish()
    }
}

impl JobPart {
    pub(crate) fn new(
        job_id: &str,
        id: u32,
        path: Option<PathBuf>,
        bitmap: DoneBitmap,
        on_settled: PartDoneHook,
    ) -> Arc<Self> {
        let unresolved = bitmap.len() - bitmap.count_set();
        Arc::new(Self {
            job_id: job_id.to_string(),
            id,
            path,
            bitmap,
            unresolved: AtomicUsize::new(unresolved),
            on_settled,
        })
    }

    /// Part with an anonymous bitmap and no settle hook.
    pub fn anonymous(job_id: &str, id: u32, num_bits: usize) -> io::Result<Arc<Self>> {
        let bitmap = DoneBitmap::anonymous(num_bits)?;
        Ok(Self::new(job_id, id, None, bitmap, Arc::new(|_: &str, _: u32| {})))
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn bitmap(&self) -> &DoneBitmap {
        &self.bitmap
    }

    /// Subtasks not yet resolved in this session.
    pub fn unresolved(&self) -> usize {
        self.unresolved.load(Ordering::Acquire)
    }

    pub fn journal(self: &Arc<Self>, offset: usize) -> JournalContext {
        JournalContext {
            part: Arc::clone(self),
            offset,
        }
    }

    fn resolve_one(&self) {
        let prev = self
            .unresolved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match prev {
            Ok(1) => {
                if let Err(e) = self.bitmap.flush() {
                    tracing::warn!(job_id = %self.job_id, part_id = self.id, error = %e, "failed to flush done bitmap");
                }
                tracing::debug!(job_id = %self.job_id, part_id = self.id, done = self.bitmap.count_set(), bits = self.bitmap.len(), "part settled");
                (self.on_settled)(&self.job_id, self.id);
            }
            Ok(_) => {}
            Err(_) => {
                tracing::trace!(job_id = %self.job_id, part_id = self.id, "subtask resolved after part settled");
            }
        }
    }
}

/// A task's slot in its part: set the bit on success, and resolve exactly
/// once whatever the outcome.
#[derive(Debug)]
pub struct JournalContext {
    part: Arc<JobPart>,
    offset: usize,
}

impl JournalContext {
    pub fn part_id(&self) -> u32 {
        self.part.id
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_done(&self) -> bool {
        self.part.bitmap.is_set(self.offset)
    }

    /// Set the done bit. True only if it was not set before.
    pub fn mark_done(&self) -> bool {
        self.part.bitmap.set(self.offset)
    }

    /// Count this subtask as resolved.
    pub fn resolve(self) {
        self.part.resolve_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn hook_fires_when_last_subtask_resolves() {
        let settled = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&settled);
        let hook: PartDoneHook = Arc::new(move |job: &str, id: u32| {
            sink.lock().unwrap().push((job.to_string(), id));
        });
        let bitmap = DoneBitmap::anonymous(3).unwrap();
        bitmap.set(1);
        let part = JobPart::new("job", 7, None, bitmap, hook);
        assert_eq!(part.unresolved(), 2);

        let a = part.journal(0);
        assert!(a.mark_done());
        assert!(!a.mark_done());
        a.resolve();
        assert!(settled.lock().unwrap().is_empty());

        // Failed: resolved without its bit.
        part.journal(2).resolve();
        assert_eq!(*settled.lock().unwrap(), vec![("job".to_string(), 7)]);
        assert_eq!(part.unresolved(), 0);
        assert!(!part.bitmap().all_set());

        // Extra resolves do not fire again.
        part.journal(2).resolve();
        assert_eq!(settled.lock().unwrap().len(), 1);
    }
}
