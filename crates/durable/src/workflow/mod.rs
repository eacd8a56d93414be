//! Workflow abstractions and types
//!
//! - [`Workflow`] trait for deterministic workflow programs
//! - [`WorkflowAction`] for the decisions a program makes
//! - [`WorkflowEvent`] / [`HistoryEvent`] for the persisted history
//! - [`RunInfo`] for the run state derived from that history

mod action;
mod definition;
mod event;
mod state;

pub use action::{ActivityOptions, WorkflowAction};
pub use definition::{Workflow, WorkflowError};
pub use event::{ActivityInvocation, HistoryEvent, WorkflowEvent};
pub use state::{HistoryError, RunInfo, WorkflowStatus};
