//! Transfer engine: admits tasks against a memory budget and runs them on
//! fixed worker pools.
//!
//! Disk tasks wait in a FIFO pending queue until their memory cost fits the
//! budget; network tasks are admitted as soon as the scheduling thread sees
//! them, alternating uploads and downloads; continuation tasks (`Other`) skip
//! admission entirely. Pause and cancel are observed when a task is admitted
//! and again when a worker picks it up. A task is never interrupted once it
//! has started.

mod budget;
mod context;
mod queues;
mod scheduler;
mod worker;

pub use budget::MemoryBudget;
pub use context::TaskContext;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::task::{JobStatus, Task, TaskClass};
use queues::{Pending, ReadyQueue};

const MIN_THREADS: usize = 5;
const MEMORY_PER_THREAD: u64 = 128 * 1024 * 1024;

/// Thread and memory limits of a [`TransferEngine`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Network and continuation workers. `None` = max(5, available parallelism).
    pub num_threads: Option<usize>,
    /// Memory budget in bytes. `None` = 128 MiB per network worker.
    pub max_memory_size: Option<u64>,
    /// Workers dedicated to disk tasks.
    pub disk_io_threads: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            num_threads: None,
            max_memory_size: None,
            disk_io_threads: 2,
        }
    }
}

impl EngineOptions {
    pub fn resolved_threads(&self) -> usize {
        self.num_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .max(MIN_THREADS)
        })
        .max(1)
    }

    pub fn resolved_memory(&self) -> u64 {
        self.max_memory_size
            .unwrap_or(MEMORY_PER_THREAD * self.resolved_threads() as u64)
    }
}

/// State shared by the engine handle, its threads and running tasks.
pub(crate) struct Shared {
    budget: MemoryBudget,
    stop: AtomicBool,
    pending: Mutex<Pending>,
    pending_cv: Condvar,
    general: ReadyQueue,
    disk: ReadyQueue,
    paused: Mutex<Vec<Task>>,
    /// Tasks queued or running; paused tasks are not counted.
    num_tasks: AtomicUsize,
}

impl Shared {
    pub(crate) fn add_task(&self, mut task: Task) {
        if self.stop.load(Ordering::Acquire) {
            tracing::debug!(class = ?task.class, "engine stopped, dropping task");
            self.release_held(&mut task);
            return;
        }
        self.num_tasks.fetch_add(1, Ordering::AcqRel);
        if task.class == TaskClass::Other {
            self.budget.reserve(task.memory_cost);
            admit(&mut task);
            self.general.push(task);
            return;
        }
        self.pending.lock().unwrap().push(task);
        self.pending_cv.notify_one();
    }

    pub(crate) fn add_timed_task(&self, mut task: Task, delay: Duration) {
        if self.stop.load(Ordering::Acquire) {
            self.release_held(&mut task);
            return;
        }
        self.num_tasks.fetch_add(1, Ordering::AcqRel);
        self.pending
            .lock()
            .unwrap()
            .push_timed(task, Instant::now() + delay);
        self.pending_cv.notify_one();
    }

    /// Wake the scheduling thread so it retries admission.
    fn nudge(&self) {
        self.pending.lock().unwrap().dirty = true;
        self.pending_cv.notify_one();
    }

    /// Return what `task` holds to the budget.
    fn release_held(&self, task: &mut Task) -> u64 {
        let held = std::mem::take(&mut task.memory_give_back);
        self.budget.release(held);
        held
    }

    /// Called once per counted task that leaves the engine.
    fn task_gone(&self, released: u64) {
        self.num_tasks.fetch_sub(1, Ordering::AcqRel);
        if released > 0 {
            self.nudge();
        }
    }

    /// Hold a task of a paused job until [`TransferEngine::resume_paused_tasks`].
    /// Its memory is released now and reserved again when it is re-added.
    ///
    /// The status is checked again under the `paused` lock: a job resumed
    /// after the caller saw `Paused` has already drained the list, so the
    /// task goes straight back into the queues instead.
    fn park(&self, mut task: Task) {
        let held = self.release_held(&mut task);
        task.memory_cost += held;
        let mut paused = self.paused.lock().unwrap();
        if task.status() == JobStatus::Paused {
            tracing::debug!(job_id = %task.shared.job_id(), class = ?task.class, "parking task of paused job");
            paused.push(task);
            drop(paused);
        } else {
            drop(paused);
            tracing::debug!(job_id = %task.shared.job_id(), class = ?task.class, "job resumed while parking, requeueing task");
            self.add_task(task);
        }
        self.task_gone(held);
    }

    /// Drop a task of a cancelled or failed job without running it.
    fn discard(&self, mut task: Task) {
        let held = self.release_held(&mut task);
        tracing::debug!(job_id = %task.shared.job_id(), class = ?task.class, "dropping task of finished job");
        drop(task);
        self.task_gone(held);
    }

    /// Park or discard `task` if its job no longer runs tasks.
    fn divert(&self, task: Task) -> Option<Task> {
        match task.status() {
            JobStatus::Paused => {
                self.park(task);
                None
            }
            s if s.drops_tasks() => {
                self.discard(task);
                None
            }
            _ => Some(task),
        }
    }
}

/// Move the reserved cost into what the task gives back after it runs.
fn admit(task: &mut Task) {
    task.memory_give_back += task.memory_cost;
    task.memory_cost = 0;
}

fn spawn_thread<F>(name: String, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|source| Error::Thread { name, source })
}

/// The scheduler: one scheduling thread, a pool of network/continuation
/// workers and a pool of disk workers sharing one memory budget.
pub struct TransferEngine {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("num_threads", &self.num_threads)
            .field("max_memory_size", &self.max_memory_size())
            .field("memory_left", &self.memory_left())
            .field("outstanding_tasks", &self.outstanding_tasks())
            .finish()
    }
}

impl TransferEngine {
    pub fn new(options: EngineOptions) -> Result<Self> {
        let num_threads = options.resolved_threads();
        let disk_threads = options.disk_io_threads.max(1);
        let max_memory = options.resolved_memory();
        let shared = Arc::new(Shared {
            budget: MemoryBudget::new(max_memory),
            stop: AtomicBool::new(false),
            pending: Mutex::new(Pending::default()),
            pending_cv: Condvar::new(),
            general: ReadyQueue::default(),
            disk: ReadyQueue::default(),
            paused: Mutex::new(Vec::new()),
            num_tasks: AtomicUsize::new(0),
        });
        let engine = Self {
            shared,
            threads: Mutex::new(Vec::with_capacity(num_threads + disk_threads + 1)),
            num_threads,
        };
        engine.start(num_threads, disk_threads)?;
        tracing::info!(
            num_threads,
            disk_threads,
            max_memory_size = max_memory,
            "transfer engine started"
        );
        Ok(engine)
    }

    fn start(&self, num_threads: usize, disk_threads: usize) -> Result<()> {
        let mut threads = self.threads.lock().unwrap();
        let s = Arc::clone(&self.shared);
        threads.push(spawn_thread("dmove-sched".into(), move || {
            scheduler::run(&s)
        })?);
        for i in 0..num_threads {
            let s = Arc::clone(&self.shared);
            threads.push(spawn_thread(format!("dmove-worker-{i}"), move || {
                worker::run(&s, worker::Pool::General)
            })?);
        }
        for i in 0..disk_threads {
            let s = Arc::clone(&self.shared);
            threads.push(spawn_thread(format!("dmove-disk-{i}"), move || {
                worker::run(&s, worker::Pool::Disk)
            })?);
        }
        Ok(())
    }

    pub fn add_task(&self, task: Task) {
        self.shared.add_task(task);
    }

    pub fn add_tasks(&self, tasks: impl IntoIterator<Item = Task>) {
        for t in tasks {
            self.shared.add_task(t);
        }
    }

    /// Hold `task` until `delay` has passed, then queue it like [`Self::add_task`].
    pub fn add_timed_task(&self, task: Task, delay: Duration) {
        self.shared.add_timed_task(task, delay);
    }

    /// Re-queue parked tasks whose job is no longer paused. Tasks of
    /// cancelled or failed jobs are dropped.
    pub fn resume_paused_tasks(&self) {
        let parked = std::mem::take(&mut *self.shared.paused.lock().unwrap());
        let mut still_paused = Vec::new();
        let mut resumed = 0usize;
        for task in parked {
            match task.status() {
                JobStatus::Paused => still_paused.push(task),
                s if s.drops_tasks() => drop(task),
                _ => {
                    resumed += 1;
                    self.shared.add_task(task);
                }
            }
        }
        if !still_paused.is_empty() {
            self.shared.paused.lock().unwrap().extend(still_paused);
        }
        tracing::debug!(resumed, "resumed paused tasks");
    }

    /// Tasks queued or running, not counting parked ones.
    pub fn outstanding_tasks(&self) -> usize {
        self.shared.num_tasks.load(Ordering::Acquire)
    }

    pub fn paused_tasks(&self) -> usize {
        self.shared.paused.lock().unwrap().len()
    }

    pub fn memory_left(&self) -> i64 {
        self.shared.budget.left()
    }

    pub fn max_memory_size(&self) -> i64 {
        self.shared.budget.max()
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Stop every thread, drop whatever is still queued or parked, and check
    /// that all reserved memory came back. Safe to call more than once.
    pub fn shutdown(&self) {
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        if threads.is_empty() {
            return;
        }
        self.shared.stop.store(true, Ordering::Release);
        self.shared.pending_cv.notify_all();
        self.shared.general.wake_all();
        self.shared.disk.wake_all();
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!("engine thread panicked");
            }
        }

        let mut leftover = self.shared.pending.lock().unwrap().drain();
        leftover.extend(self.shared.general.drain());
        leftover.extend(self.shared.disk.drain());
        leftover.extend(std::mem::take(&mut *self.shared.paused.lock().unwrap()));
        let dropped = leftover.len();
        for task in &mut leftover {
            self.shared.release_held(task);
        }
        drop(leftover);
        self.shared.num_tasks.store(0, Ordering::Release);

        let left = self.memory_left();
        let max = self.max_memory_size();
        if left != max {
            tracing::error!(memory_left = left, max_memory_size = max, "memory budget not fully returned at shutdown");
        }
        debug_assert_eq!(left, max, "memory budget not fully returned at shutdown");
        tracing::info!(dropped, "transfer engine stopped");
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests;
