//! Run state derived from history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{HistoryEvent, WorkflowError, WorkflowEvent};

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// The run is waiting for decisions or activities
    Running,

    /// The run completed with a result
    Completed,

    /// The run failed
    Failed,

    /// The run was cancelled
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// History that cannot be folded into a run
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("run {0} has no events")]
    Empty(Uuid),

    #[error("run {run_id} starts with {found} instead of run_started")]
    MissingRunStarted { run_id: Uuid, found: &'static str },
}

/// Everything observable about a run, computed from its history alone
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunInfo {
    pub run_id: Uuid,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: serde_json::Value,
    pub status: WorkflowStatus,

    /// Set once the run completed
    pub result: Option<serde_json::Value>,

    /// Set once the run failed
    pub error: Option<WorkflowError>,

    /// Reason of a pending or honoured cancellation request
    pub cancel_requested: Option<String>,

    pub started_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,

    /// Sequence number of the last event; the expected value for the next append
    pub last_sequence: u64,
}

impl RunInfo {
    /// Fold a run's history into its current state
    pub fn from_history(run_id: Uuid, history: &[HistoryEvent]) -> Result<Self, HistoryError> {
        let first = history.first().ok_or(HistoryError::Empty(run_id))?;
        let WorkflowEvent::RunStarted {
            workflow_type,
            task_queue,
            input,
        } = &first.event
        else {
            return Err(HistoryError::MissingRunStarted {
                run_id,
                found: first.event.kind(),
            });
        };

        let mut info = Self {
            run_id,
            workflow_type: workflow_type.clone(),
            task_queue: task_queue.clone(),
            input: input.clone(),
            status: WorkflowStatus::Running,
            result: None,
            error: None,
            cancel_requested: None,
            started_at: first.recorded_at,
            closed_at: None,
            last_sequence: first.sequence_no,
        };

        for record in &history[1..] {
            info.last_sequence = record.sequence_no;
            match &record.event {
                WorkflowEvent::RunCancelRequested { reason } => {
                    info.cancel_requested.get_or_insert_with(|| reason.clone());
                }
                WorkflowEvent::RunCompleted { result } => {
                    info.status = WorkflowStatus::Completed;
                    info.result = Some(result.clone());
                    info.closed_at = Some(record.recorded_at);
                }
                WorkflowEvent::RunFailed { error } => {
                    info.status = WorkflowStatus::Failed;
                    info.error = Some(error.clone());
                    info.closed_at = Some(record.recorded_at);
                }
                WorkflowEvent::RunCancelled { reason } => {
                    info.status = WorkflowStatus::Cancelled;
                    info.cancel_requested = Some(reason.clone());
                    info.closed_at = Some(record.recorded_at);
                }
                WorkflowEvent::RunStarted { .. }
                | WorkflowEvent::ActivityScheduled { .. }
                | WorkflowEvent::ActivityCompleted { .. }
                | WorkflowEvent::ActivityFailed { .. } => {}
            }
        }

        Ok(info)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
