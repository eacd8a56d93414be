//! Worker pool for task execution
//!
//! This module provides:
//! - [`WorkerPool`] - N poll loops dispatching decision and activity tasks
//! - [`PollerConfig`] - Task polling with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         WorkerPool                           │
//! │  ┌────────────┐ ┌────────────┐       ┌────────────────────┐  │
//! │  │ TaskPoller │ │ TaskPoller │  ...  │ Maintenance (30s)  │  │
//! │  │  loop 0    │ │  loop 1    │       │ reclaim + purge    │  │
//! │  └─────┬──────┘ └─────┬──────┘       └────────────────────┘  │
//! │        └──────┬───────┘                                      │
//! │               ▼                                              │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │                      Dispatcher                        │  │
//! │  │  DecisionTask → WorkflowExecutor::process_decision     │  │
//! │  │  ActivityTask → ActivityExecutor::run_task             │  │
//! │  │  then ack, or leave the lease to expire                │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use waypoint_durable::worker::{WorkerPool, WorkerPoolConfig};
//!
//! let pool = WorkerPool::builder(store)
//!     .task_queue("orders")
//!     .workflow::<OrderWorkflow>()
//!     .activity(ChargeCard)
//!     .config(WorkerPoolConfig::default().with_concurrency(8))
//!     .build();
//!
//! pool.start().await?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```

mod poller;
mod pool;

pub use poller::{PollerConfig, PollerError, TaskPoller};
pub use pool::{
    DispatchOutcome, MaintenanceReport, WorkerPool, WorkerPoolBuilder, WorkerPoolConfig,
    WorkerPoolError, WorkerPoolStatus,
};
