//! Pending, timed and ready queues.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::task::{Task, TaskClass};

/// Longest the scheduler or a worker sleeps before re-checking its state.
pub(crate) const WAIT_GRANULARITY: Duration = Duration::from_millis(100);

/// A task held until `deadline`. Ordered so the earliest deadline is the
/// heap's maximum; ties go to the task added first.
pub(crate) struct TimedTask {
    pub deadline: Instant,
    pub seq: u64,
    pub task: Task,
}

impl PartialEq for TimedTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimedTask {}

impl PartialOrd for TimedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Tasks waiting for admission, guarded by the scheduler's mutex.
#[derive(Default)]
pub(crate) struct Pending {
    pub disk: VecDeque<Task>,
    pub upload: VecDeque<Task>,
    pub download: VecDeque<Task>,
    pub timed: BinaryHeap<TimedTask>,
    next_seq: u64,
    /// Set whenever something changed that could let a task be admitted.
    pub dirty: bool,
}

impl Pending {
    pub fn push(&mut self, task: Task) {
        match task.class {
            TaskClass::DiskIo => self.disk.push_back(task),
            TaskClass::NetworkUpload => self.upload.push_back(task),
            TaskClass::NetworkDownload => self.download.push_back(task),
            // The engine admits continuations directly; never queued here.
            TaskClass::Other => self.upload.push_back(task),
        }
        self.dirty = true;
    }

    pub fn push_timed(&mut self, task: Task, deadline: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timed.push(TimedTask {
            deadline,
            seq,
            task,
        });
        self.dirty = true;
    }

    /// Remove every timed task whose deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> Vec<Task> {
        let mut due = Vec::new();
        while self.timed.peek().is_some_and(|t| t.deadline <= now) {
            if let Some(t) = self.timed.pop() {
                due.push(t.task);
            }
        }
        due
    }

    /// How long the scheduler may sleep.
    pub fn wait_timeout(&self, now: Instant) -> Duration {
        match self.timed.peek() {
            Some(t) => t.deadline.saturating_duration_since(now).min(WAIT_GRANULARITY),
            None => WAIT_GRANULARITY,
        }
    }

    pub fn len(&self) -> usize {
        self.disk.len() + self.upload.len() + self.download.len() + self.timed.len()
    }

    /// Empty every queue.
    pub fn drain(&mut self) -> Vec<Task> {
        let mut out: Vec<Task> = Vec::with_capacity(self.len());
        out.extend(self.disk.drain(..));
        out.extend(self.upload.drain(..));
        out.extend(self.download.drain(..));
        out.extend(std::mem::take(&mut self.timed).into_iter().map(|t| t.task));
        out
    }
}

/// FIFO of admitted tasks consumed by one worker pool.
#[derive(Default)]
pub(crate) struct ReadyQueue {
    tasks: Mutex<VecDeque<Task>>,
    cv: Condvar,
}

impl ReadyQueue {
    pub fn push_all(&self, tasks: Vec<Task>) {
        if tasks.is_empty() {
            return;
        }
        let n = tasks.len();
        self.tasks.lock().unwrap().extend(tasks);
        if n == 1 {
            self.cv.notify_one();
        } else {
            self.cv.notify_all();
        }
    }

    pub fn push(&self, task: Task) {
        self.tasks.lock().unwrap().push_back(task);
        self.cv.notify_one();
    }

    /// Block until a task is available. Returns `None` once `stop` is set;
    /// tasks still queued at that point are left for the shutdown drain.
    pub fn pop(&self, stop: &AtomicBool) -> Option<Task> {
        let mut tasks = self.tasks.lock().unwrap();
        loop {
            if stop.load(Ordering::Acquire) {
                return None;
            }
            if let Some(t) = tasks.pop_front() {
                return Some(t);
            }
            tasks = self.cv.wait_timeout(tasks, WAIT_GRANULARITY).unwrap().0;
        }
    }

    pub fn wake_all(&self) {
        self.cv.notify_all();
    }

    pub fn drain(&self) -> Vec<Task> {
        self.tasks.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }
}
