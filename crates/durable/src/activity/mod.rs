//! Activity abstractions
//!
//! Activities are the side-effecting steps of a workflow. They:
//! - Run outside workflow determinism, at least once per attempt
//! - Fail with an [`ActivityError`] that says whether a retry may help
//! - Are retried by the [`ActivityExecutor`] according to the recorded retry policy

mod context;
mod definition;
mod executor;
mod registry;

pub use context::ActivityContext;
pub use definition::{Activity, ActivityError};
pub use executor::{
    retry_decision, ActivityExecutor, ActivityExecutorError, ReportOutcome, RetryDecision,
};
pub use registry::{ActivityFuture, ActivityHandler, ActivityRegistry};
