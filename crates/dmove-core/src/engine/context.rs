//! What a running task sees of the engine.

use std::sync::Arc;
use std::time::Duration;

use super::Shared;
use crate::task::{JournalContext, Task, TaskBody, TaskClass, TaskSharedStatus};

/// Handed to a task body while it executes.
///
/// Besides the job status and the task's journal slot it tracks the memory
/// the task holds, part of which may be passed on to a child with
/// [`TaskContext::spawn_with_memory`]. Whatever is still held when the body
/// returns goes back to the budget.
pub struct TaskContext<'a> {
    engine: &'a Arc<Shared>,
    shared: &'a Arc<TaskSharedStatus>,
    journal: &'a mut Option<JournalContext>,
    give_back: &'a mut u64,
}

impl<'a> TaskContext<'a> {
    pub(super) fn new(
        engine: &'a Arc<Shared>,
        shared: &'a Arc<TaskSharedStatus>,
        journal: &'a mut Option<JournalContext>,
        give_back: &'a mut u64,
    ) -> Self {
        Self {
            engine,
            shared,
            journal,
            give_back,
        }
    }

    pub fn shared(&self) -> &Arc<TaskSharedStatus> {
        self.shared
    }

    /// Take the task's journal slot. The caller becomes responsible for
    /// resolving it, directly or through a child task.
    pub fn take_journal(&mut self) -> Option<JournalContext> {
        self.journal.take()
    }

    /// Memory the running task holds.
    pub fn held_memory(&self) -> u64 {
        *self.give_back
    }

    /// New task of the same job.
    pub fn child(&self, class: TaskClass, memory_cost: u64, body: TaskBody) -> Task {
        Task::new(class, memory_cost, Arc::clone(self.shared), body)
    }

    pub fn spawn(&self, task: Task) {
        self.engine.add_task(task);
    }

    /// Move up to `amount` of the memory this task holds to `child`, then
    /// enqueue it. The child releases it when it finishes.
    pub fn spawn_with_memory(&mut self, mut child: Task, amount: u64) {
        let amount = amount.min(*self.give_back);
        *self.give_back -= amount;
        child.memory_give_back += amount;
        self.engine.add_task(child);
    }

    /// Enqueue `task` once `delay` has passed.
    pub fn spawn_after(&self, task: Task, delay: Duration) {
        self.engine.add_timed_task(task, delay);
    }
}
