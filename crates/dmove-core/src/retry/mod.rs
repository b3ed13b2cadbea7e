//! Retry and backoff policy for remote calls made inside task bodies.
//!
//! Classifies [`crate::remote::RemoteError`]s (timeouts, throttling,
//! connection failures) and decides exponential backoff. The transfer engine
//! never re-issues a failed task; a task may retry its own remote call
//! before reporting failure.

mod classify;
mod policy;
mod run;

pub use classify::classify;
pub use policy::{ErrorKind, RetryDecision, RetryPolicy};
pub use run::run_with_retry;
