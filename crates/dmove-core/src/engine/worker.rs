//! Worker loop: run admitted tasks and release their memory.

use std::panic::{catch_unwind, AssertUnwindSafe};

use super::context::TaskContext;
use super::Shared;
use crate::task::Task;

#[derive(Debug, Clone, Copy)]
pub(super) enum Pool {
    General,
    Disk,
}

pub(super) fn run(shared: &std::sync::Arc<Shared>, pool: Pool) {
    let queue = match pool {
        Pool::General => &shared.general,
        Pool::Disk => &shared.disk,
    };
    while let Some(task) = queue.pop(&shared.stop) {
        if let Some(task) = shared.divert(task) {
            execute(shared, task);
        }
    }
}

fn execute(engine: &std::sync::Arc<Shared>, task: Task) {
    let Task {
        class,
        memory_cost,
        memory_give_back,
        shared,
        mut journal,
        body,
    } = task;
    let mut give_back = memory_give_back + memory_cost;
    let name = body.name();

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let mut ctx = TaskContext::new(engine, &shared, &mut journal, &mut give_back);
        body.run(&mut ctx);
    }));

    match outcome {
        Ok(()) => {
            if journal.is_some() {
                tracing::debug!(job_id = %shared.job_id(), task = %name, "task left its journal slot unresolved");
                shared.abandon(journal.take());
            }
        }
        Err(_) => {
            tracing::error!(job_id = %shared.job_id(), task = %name, ?class, "task panicked");
            if journal.is_some() {
                shared.task_failed(journal.take(), "", "", &format!("{name} task panicked"));
            }
        }
    }

    engine.budget.release(give_back);
    drop(shared);
    engine.task_gone(give_back);
}
