//! Server-side copy task bodies.
//!
//! [`StartCopy`] asks the destination store to copy the object and checks
//! the result once. A copy that is still pending is polled by a [`WaitCopy`]
//! task that re-queues itself as a timed task, so no worker sits blocked
//! while the store works.

use std::sync::Arc;
use std::time::Duration;

use super::upload::attach;
use super::{JournalContext, TaskBody, TaskClass};
use crate::engine::TaskContext;
use crate::remote::{CopyState, RemoteStore};
use crate::retry::{run_with_retry, RetryPolicy};

/// One object copy between two stores.
#[derive(Debug)]
pub struct ServerCopy {
    pub(crate) source: Arc<dyn RemoteStore>,
    pub(crate) source_name: String,
    pub(crate) destination: Arc<dyn RemoteStore>,
    pub(crate) destination_name: String,
    pub(crate) size: u64,
    pub(crate) retry: RetryPolicy,
    pub(crate) poll_interval: Duration,
    pub(crate) source_url: String,
    pub(crate) destination_url: String,
}

impl ServerCopy {
    fn settle(
        self: Arc<Self>,
        ctx: &mut TaskContext<'_>,
        journal: Option<JournalContext>,
        copy_id: String,
        state: CopyState,
    ) {
        match state {
            CopyState::Success => {
                tracing::debug!(destination = %self.destination_name, "server copy finished");
                ctx.shared().file_transferred(journal, self.size);
            }
            CopyState::Failed(msg) => {
                ctx.shared()
                    .task_failed(journal, &self.source_url, &self.destination_url, &msg)
            }
            CopyState::Pending => {
                let delay = self.poll_interval;
                let wait = ctx.child(
                    TaskClass::Other,
                    0,
                    TaskBody::WaitCopy(WaitCopy {
                        copy: self,
                        copy_id,
                    }),
                );
                ctx.spawn_after(attach(wait, journal), delay);
            }
        }
    }

    fn fail(&self, ctx: &TaskContext<'_>, journal: Option<JournalContext>, message: &str) {
        ctx.shared()
            .task_failed(journal, &self.source_url, &self.destination_url, message);
    }
}

/// Starts the copy.
#[derive(Debug)]
pub struct StartCopy {
    pub(crate) copy: Arc<ServerCopy>,
}

impl StartCopy {
    pub(crate) fn run(self, ctx: &mut TaskContext<'_>) {
        let journal = ctx.take_journal();
        let copy = self.copy;
        let started = run_with_retry(&copy.retry, || {
            copy.destination.start_copy(
                Arc::clone(&copy.source),
                &copy.source_name,
                &copy.destination_name,
            )
        })
        .and_then(|id| {
            let state = run_with_retry(&copy.retry, || {
                copy.destination.copy_state(&copy.destination_name, &id)
            })?;
            Ok((id, state))
        });
        match started {
            Ok((id, state)) => copy.settle(ctx, journal, id, state),
            Err(e) => copy.fail(ctx, journal, &e.to_string()),
        }
    }
}

/// Polls a pending copy.
#[derive(Debug)]
pub struct WaitCopy {
    pub(crate) copy: Arc<ServerCopy>,
    pub(crate) copy_id: String,
}

impl WaitCopy {
    pub(crate) fn run(self, ctx: &mut TaskContext<'_>) {
        let journal = ctx.take_journal();
        let copy = self.copy;
        let polled = run_with_retry(&copy.retry, || {
            copy.destination.copy_state(&copy.destination_name, &self.copy_id)
        });
        match polled {
            Ok(state) => copy.settle(ctx, journal, self.copy_id, state),
            Err(e) => copy.fail(ctx, journal, &e.to_string()),
        }
    }
}
