//! Scheduling thread: moves pending tasks to the ready queues.

use std::sync::atomic::Ordering;
use std::sync::MutexGuard;
use std::time::Instant;

use super::queues::Pending;
use super::{admit, Shared};
use crate::task::{JobStatus, Task, TaskClass};

/// Tasks taken out of the pending queues in one pass.
#[derive(Default)]
struct Pass {
    general: Vec<Task>,
    disk: Vec<Task>,
    diverted: Vec<Task>,
}

impl Pass {
    fn is_empty(&self) -> bool {
        self.general.is_empty() && self.disk.is_empty() && self.diverted.is_empty()
    }
}

pub(super) fn run(shared: &Shared) {
    tracing::debug!("scheduler started");
    let mut pending = shared.pending.lock().unwrap();
    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        if !pending.dirty {
            let timeout = pending.wait_timeout(Instant::now());
            pending = shared.pending_cv.wait_timeout(pending, timeout).unwrap().0;
            if shared.stop.load(Ordering::Acquire) {
                break;
            }
        }
        pending.dirty = false;

        let pass = collect(shared, &mut pending);
        if pass.is_empty() {
            continue;
        }
        drop(pending);
        dispatch(shared, pass);
        pending = shared.pending.lock().unwrap();
    }
    tracing::debug!("scheduler stopped");
}

fn collect(shared: &Shared, pending: &mut MutexGuard<'_, Pending>) -> Pass {
    let mut pass = Pass::default();

    for mut task in pending.take_due(Instant::now()) {
        if task.class == TaskClass::Other {
            shared.budget.reserve(task.memory_cost);
            admit(&mut task);
            pass.general.push(task);
        } else {
            pending.push(task);
        }
    }

    admit_disk(shared, pending, &mut pass);
    admit_network(shared, pending, &mut pass);
    pass
}

fn should_divert(task: &Task) -> bool {
    let status = task.status();
    status == JobStatus::Paused || status.drops_tasks()
}

/// FIFO admission against the budget. Once the head no longer fits, only
/// tasks that need no new memory may pass it.
fn admit_disk(shared: &Shared, pending: &mut Pending, pass: &mut Pass) {
    while let Some(task) = pending.disk.front() {
        if should_divert(task) {
            if let Some(t) = pending.disk.pop_front() {
                pass.diverted.push(t);
            }
            continue;
        }
        if !shared.budget.try_admit(task.memory_cost) {
            break;
        }
        if let Some(mut t) = pending.disk.pop_front() {
            admit(&mut t);
            pass.disk.push(t);
        }
    }

    if pending.disk.len() <= 1 {
        return;
    }
    let queued = std::mem::take(&mut pending.disk);
    let mut blocked_head = true;
    for mut task in queued {
        if blocked_head {
            blocked_head = false;
            pending.disk.push_back(task);
        } else if should_divert(&task) {
            pass.diverted.push(task);
        } else if task.memory_cost == 0 {
            admit(&mut task);
            pass.disk.push(task);
        } else {
            pending.disk.push_back(task);
        }
    }
}

/// Unconditional admission, alternating uploads and downloads.
fn admit_network(shared: &Shared, pending: &mut Pending, pass: &mut Pass) {
    loop {
        let mut took = false;
        for class in [TaskClass::NetworkUpload, TaskClass::NetworkDownload] {
            let queue = match class {
                TaskClass::NetworkUpload => &mut pending.upload,
                _ => &mut pending.download,
            };
            let Some(mut task) = queue.pop_front() else {
                continue;
            };
            took = true;
            if should_divert(&task) {
                pass.diverted.push(task);
                continue;
            }
            shared.budget.reserve(task.memory_cost);
            admit(&mut task);
            pass.general.push(task);
        }
        if !took {
            break;
        }
    }
}

fn dispatch(shared: &Shared, pass: Pass) {
    let admitted = pass.general.len() + pass.disk.len();
    shared.general.push_all(pass.general);
    shared.disk.push_all(pass.disk);
    for task in pass.diverted {
        // Re-check: the status may have moved on since collection.
        if let Some(task) = shared.divert(task) {
            shared.pending.lock().unwrap().push(task);
        }
    }
    if admitted > 0 {
        tracing::trace!(admitted, "tasks admitted");
    }
}
