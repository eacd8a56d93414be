//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`HistoryStore`], [`TaskQueue`] and [`WorkflowStore`] traits
//! - [`InMemoryWorkflowStore`] for tests and single-process demos
//! - [`PostgresWorkflowStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowStore;
pub use postgres::PostgresWorkflowStore;
pub(crate) use store::check_append;
pub use store::{
    HistoryStore, LeasedTask, StoreError, TaskDefinition, TaskKind, TaskPayload, TaskQueue,
    WorkflowStore,
};
