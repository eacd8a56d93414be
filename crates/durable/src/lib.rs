//! # Durable Execution Engine
//!
//! An event-sourced workflow engine: every run is an append-only history,
//! workflow programs are replayed from it, and work is handed out through
//! leased task queues.
//!
//! ## Features
//!
//! - **Event-sourced runs**: run state is derived from history; appends use optimistic concurrency
//! - **Deterministic replay**: divergence from recorded decisions fails the run as non-deterministic
//! - **Leased task queues**: at-least-once delivery, expired leases are redelivered
//! - **Activity retries**: capped exponential backoff with jitter, bounded by `max_attempts`
//! - **Pluggable stores**: in-memory for tests and demos, PostgreSQL for production
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                            │
//! │  (N poll loops: lease task → dispatch → ack)                │
//! └─────────────────────────────────────────────────────────────┘
//!           │ DecisionTask                      │ ActivityTask
//!           ▼                                   ▼
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │     WorkflowExecutor     │     │     ActivityExecutor     │
//! │ (replay, decide, commit) │     │ (run, retry, report)     │
//! └──────────────────────────┘     └──────────────────────────┘
//!           │                                   │
//!           ▼                                   ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowStore                           │
//! │  (history + task queue, committed together)                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use waypoint_durable::prelude::*;
//!
//! struct Greeter {
//!     name: String,
//! }
//!
//! impl Workflow for Greeter {
//!     const TYPE: &'static str = "Greeter";
//!     type Input = String;
//!     type Output = String;
//!
//!     fn new(name: String) -> Self {
//!         Self { name }
//!     }
//!
//!     fn on_start(&mut self) -> Vec<WorkflowAction> {
//!         vec![Self::finish(format!("Hello from worker, {}!", self.name))]
//!     }
//! }
//!
//! let store = Arc::new(InMemoryWorkflowStore::new());
//! let pool = WorkerPool::builder(store).workflow::<Greeter>().build();
//! let run_id = pool.executor().start::<Greeter>("Ada".into()).await?;
//! pool.run_until_idle(10).await?;
//! ```

pub mod activity;
pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError, ActivityExecutor};
    pub use crate::engine::{
        ExecutorConfig, ExecutorError, NonDeterminismError, WorkflowExecutor, WorkflowRegistry,
    };
    pub use crate::persistence::{
        HistoryStore, InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, TaskDefinition,
        TaskQueue, WorkflowStore,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{PollerConfig, WorkerPool, WorkerPoolConfig, WorkerPoolError};
    pub use crate::workflow::{
        ActivityOptions, HistoryEvent, RunInfo, Workflow, WorkflowAction, WorkflowError,
        WorkflowEvent, WorkflowStatus,
    };
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError, ActivityExecutor};
pub use engine::{
    ExecutorConfig, ExecutorError, NonDeterminismError, WorkflowExecutor, WorkflowRegistry,
};
pub use persistence::{
    HistoryStore, InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, TaskQueue,
    WorkflowStore,
};
pub use reliability::RetryPolicy;
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
pub use workflow::{
    ActivityOptions, RunInfo, Workflow, WorkflowAction, WorkflowError, WorkflowEvent,
    WorkflowStatus,
};
