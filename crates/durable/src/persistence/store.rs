//! History store and task queue traits

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{ActivityInvocation, HistoryEvent, WorkflowEvent};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Optimistic concurrency check failed; re-read and retry
    #[error("conflict appending to run {run_id}: expected sequence {expected}, found {actual}")]
    Conflict {
        run_id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// The run already has a terminal event
    #[error("run {0} is closed")]
    RunClosed(Uuid),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// The lease expired and the task was handed to another poller
    #[error("lease on task {0} was lost")]
    LeaseLost(Uuid),

    /// The events would produce a malformed history
    #[error("invalid append to run {run_id}: {reason}")]
    InvalidAppend { run_id: Uuid, reason: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Errors a caller may retry after re-reading
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Database(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Kind of work a task carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Decision,
    Activity,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::Activity => "activity",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a worker has to do for the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Replay the run and make the next decisions
    Decision,

    /// Run one activity attempt
    Activity {
        activity_id: String,
        invocation: ActivityInvocation,
    },
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Decision => TaskKind::Decision,
            Self::Activity { .. } => TaskKind::Activity,
        }
    }
}

/// A task to be enqueued
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefinition {
    pub queue_name: String,
    pub run_id: Uuid,
    pub payload: TaskPayload,

    /// Earliest time the task may be polled; `None` means immediately
    pub visible_at: Option<DateTime<Utc>>,
}

impl TaskDefinition {
    pub fn decision(queue_name: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            queue_name: queue_name.into(),
            run_id,
            payload: TaskPayload::Decision,
            visible_at: None,
        }
    }

    /// Activity task, placed on the invocation's queue
    pub fn activity(run_id: Uuid, activity_id: impl Into<String>, invocation: ActivityInvocation) -> Self {
        Self {
            queue_name: invocation.task_queue.clone(),
            run_id,
            payload: TaskPayload::Activity {
                activity_id: activity_id.into(),
                invocation,
            },
            visible_at: None,
        }
    }

    /// Hide the task for `delay` after enqueue
    pub fn with_delay(mut self, delay: Duration) -> Self {
        if !delay.is_zero() {
            self.visible_at = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| Utc::now().checked_add_signed(d));
        }
        self
    }
}

/// A task leased to one poller
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedTask {
    pub task_id: Uuid,
    pub queue_name: String,
    pub run_id: Uuid,
    pub payload: TaskPayload,

    /// The task becomes visible again at this time unless acked
    pub lease_deadline: DateTime<Utc>,

    /// Number of times the task has been handed out, this one included
    pub delivery_count: u32,
}

impl LeasedTask {
    pub fn kind(&self) -> TaskKind {
        self.payload.kind()
    }
}

/// Append-only per-run event log
///
/// The single source of truth: everything else about a run is derived from
/// what `read` returns.
#[async_trait]
pub trait HistoryStore: Send + Sync + 'static {
    /// Append events after the event numbered `expected_sequence`
    ///
    /// `expected_sequence` is the last sequence number the caller observed,
    /// 0 for a run that does not exist yet. Returns the sequence number of
    /// the last appended event.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Conflict`] when another writer got there first
    /// - [`StoreError::RunClosed`] when the run already ended
    /// - [`StoreError::InvalidAppend`] when a new run does not start with `RunStarted`
    async fn append(
        &self,
        run_id: Uuid,
        expected_sequence: u64,
        events: Vec<WorkflowEvent>,
    ) -> Result<u64, StoreError>;

    /// Full history of the run, in order
    async fn read(&self, run_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError>;

    /// Delete runs that closed before `closed_before`, with their tasks
    async fn purge_closed_runs(&self, closed_before: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError>;
}

/// Named queues of leased tasks
#[async_trait]
pub trait TaskQueue: Send + Sync + 'static {
    async fn enqueue(&self, task: TaskDefinition) -> Result<Uuid, StoreError>;

    /// Lease the next visible task on `queue_name`, if any
    ///
    /// A task whose lease expired is visible again. Concurrent pollers never
    /// receive the same task while its lease is live.
    async fn poll(&self, queue_name: &str, lease_duration: Duration) -> Result<Option<LeasedTask>, StoreError>;

    /// Remove a task for good
    ///
    /// Fails with [`StoreError::LeaseLost`] once the task was leased again,
    /// so only the current holder can settle it.
    async fn ack(&self, lease: &LeasedTask) -> Result<(), StoreError>;

    /// Give a leased task back, visible immediately
    async fn nack(&self, lease: &LeasedTask) -> Result<(), StoreError>;

    /// Return every expired lease to the queue
    async fn reclaim_expired_leases(&self) -> Result<Vec<Uuid>, StoreError>;
}

/// History and queue behind one durability boundary
#[async_trait]
pub trait WorkflowStore: HistoryStore + TaskQueue {
    /// Append events and enqueue the tasks they imply, all or nothing
    ///
    /// Same checks and result as [`HistoryStore::append`]; on error no task is
    /// enqueued.
    async fn commit(
        &self,
        run_id: Uuid,
        expected_sequence: u64,
        events: Vec<WorkflowEvent>,
        tasks: Vec<TaskDefinition>,
    ) -> Result<u64, StoreError>;
}

/// Validate a batch against the current end of a history
///
/// `last` is the last stored event, `None` for an unknown run.
pub(crate) fn check_append(
    run_id: Uuid,
    last: Option<(u64, bool)>,
    expected_sequence: u64,
    events: &[WorkflowEvent],
) -> Result<(), StoreError> {
    match last {
        None if expected_sequence != 0 => return Err(StoreError::RunNotFound(run_id)),
        None => {
            match events.first() {
                Some(WorkflowEvent::RunStarted { .. }) => {}
                Some(other) => {
                    return Err(StoreError::InvalidAppend {
                        run_id,
                        reason: format!("first event must be run_started, got {}", other.kind()),
                    })
                }
                None => {
                    return Err(StoreError::InvalidAppend {
                        run_id,
                        reason: "cannot create a run without events".to_string(),
                    })
                }
            }
        }
        Some((actual, _)) if actual != expected_sequence => {
            return Err(StoreError::Conflict {
                run_id,
                expected: expected_sequence,
                actual,
            })
        }
        Some((_, true)) if !events.is_empty() => return Err(StoreError::RunClosed(run_id)),
        Some(_) => {}
    }

    let start = if last.is_none() { 1 } else { 0 };
    if let Some(extra) = events[start.min(events.len())..]
        .iter()
        .find(|e| matches!(e, WorkflowEvent::RunStarted { .. }))
    {
        return Err(StoreError::InvalidAppend {
            run_id,
            reason: format!("{} may only be the first event", extra.kind()),
        });
    }

    if let Some(pos) = events.iter().position(WorkflowEvent::is_terminal) {
        if pos + 1 != events.len() {
            return Err(StoreError::InvalidAppend {
                run_id,
                reason: "no events may follow a terminal event".to_string(),
            });
        }
    }

    Ok(())
}
