//! Workflow execution engine
//!
//! [`WorkflowExecutor`] starts runs and advances them: each decision task
//! replays the run's history through the registered program and commits the
//! decisions it makes next.

mod executor;
mod registry;
mod replay;

pub use executor::{ExecutorConfig, ExecutorError, ProcessResult, WorkflowExecutor};
pub use registry::{AnyWorkflow, RegistryError, WorkflowFactory, WorkflowRegistry};
pub use replay::{replay, NonDeterminismError, Replayed};
