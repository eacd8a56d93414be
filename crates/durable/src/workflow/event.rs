//! History events
//!
//! A run's history is an append-only list of these events. Nothing else is
//! persisted about a run: its status, result and pending work are all
//! recomputed from the events (see [`RunInfo`](super::RunInfo)).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::WorkflowError;
use crate::activity::ActivityError;
use crate::reliability::RetryPolicy;

/// One execution attempt of an activity call, as recorded in history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityInvocation {
    /// Registered activity type
    pub activity_type: String,

    /// Input handed to the activity
    pub input: serde_json::Value,

    /// Attempt number, starting at 1
    pub attempt: u32,

    /// Retry policy resolved when the call was first scheduled
    pub retry_policy: RetryPolicy,

    /// Queue the activity task is placed on
    pub task_queue: String,

    /// Limit on a single attempt
    #[serde(
        default,
        with = "super::action::option_duration_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub start_to_close_timeout: Option<Duration>,
}

impl ActivityInvocation {
    /// Total number of attempts allowed for this call; never below 1
    pub fn max_attempts(&self) -> u32 {
        self.retry_policy.max_attempts.max(1)
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts()
    }

    /// The same call, one attempt later
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// Events in a run's history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// The run was started; always the first event
    RunStarted {
        workflow_type: String,
        task_queue: String,
        input: serde_json::Value,
    },

    /// An activity attempt was scheduled
    ///
    /// Attempt 1 records a workflow decision; later attempts are retry
    /// bookkeeping written by the activity executor.
    ActivityScheduled {
        activity_id: String,
        invocation: ActivityInvocation,
    },

    /// An activity attempt returned a result
    ActivityCompleted {
        activity_id: String,
        attempt: u32,
        result: serde_json::Value,
    },

    /// An activity attempt failed
    ActivityFailed {
        activity_id: String,
        attempt: u32,
        error: ActivityError,

        /// Another attempt was scheduled; the workflow is not told about this failure
        will_retry: bool,
    },

    /// Someone asked for the run to stop
    RunCancelRequested { reason: String },

    /// The run completed with a result
    RunCompleted { result: serde_json::Value },

    /// The run failed
    RunFailed { error: WorkflowError },

    /// The run stopped after a cancellation request
    RunCancelled { reason: String },
}

impl WorkflowEvent {
    /// Stable name of the event kind (also the `type` tag)
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::ActivityScheduled { .. } => "activity_scheduled",
            Self::ActivityCompleted { .. } => "activity_completed",
            Self::ActivityFailed { .. } => "activity_failed",
            Self::RunCancelRequested { .. } => "run_cancel_requested",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::RunCancelled { .. } => "run_cancelled",
        }
    }

    pub fn activity_id(&self) -> Option<&str> {
        match self {
            Self::ActivityScheduled { activity_id, .. }
            | Self::ActivityCompleted { activity_id, .. }
            | Self::ActivityFailed { activity_id, .. } => Some(activity_id),
            _ => None,
        }
    }

    /// Whether this event closes the run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted { .. } | Self::RunFailed { .. } | Self::RunCancelled { .. }
        )
    }
}

/// A stored event with its position in the run's history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEvent {
    /// Position in the history, starting at 1, without gaps
    pub sequence_no: u64,

    /// When the event was appended
    pub recorded_at: DateTime<Utc>,

    #[serde(flatten)]
    pub event: WorkflowEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invocation() -> ActivityInvocation {
        ActivityInvocation {
            activity_type: "process".to_string(),
            input: json!({"message": "hi"}),
            attempt: 1,
            retry_policy: RetryPolicy::exponential().with_max_attempts(3),
            task_queue: "default".to_string(),
            start_to_close_timeout: None,
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = WorkflowEvent::RunStarted {
            workflow_type: "Greeter".to_string(),
            task_queue: "default".to_string(),
            input: json!("Ada"),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"run_started\""));

        let parsed: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_kind_matches_serde_tag() {
        let events = vec![
            WorkflowEvent::ActivityScheduled {
                activity_id: "a".to_string(),
                invocation: invocation(),
            },
            WorkflowEvent::ActivityFailed {
                activity_id: "a".to_string(),
                attempt: 1,
                error: ActivityError::retryable("boom"),
                will_retry: true,
            },
            WorkflowEvent::RunCancelRequested {
                reason: "user".to_string(),
            },
            WorkflowEvent::RunCancelled {
                reason: "user".to_string(),
            },
        ];

        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], json!(event.kind()));
        }
    }

    #[test]
    fn test_history_event_flattens_event() {
        let record = HistoryEvent {
            sequence_no: 3,
            recorded_at: Utc::now(),
            event: WorkflowEvent::RunCompleted {
                result: json!("done"),
            },
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["sequence_no"], json!(3));
        assert_eq!(json["type"], json!("run_completed"));

        let parsed: HistoryEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_activity_id_extraction() {
        let event = WorkflowEvent::ActivityCompleted {
            activity_id: "my-activity".to_string(),
            attempt: 1,
            result: json!(null),
        };
        assert_eq!(event.activity_id(), Some("my-activity"));

        let event = WorkflowEvent::RunCompleted { result: json!({}) };
        assert_eq!(event.activity_id(), None);
    }

    #[test]
    fn test_is_terminal() {
        assert!(WorkflowEvent::RunCompleted { result: json!({}) }.is_terminal());
        assert!(WorkflowEvent::RunFailed {
            error: WorkflowError::new("error")
        }
        .is_terminal());
        assert!(WorkflowEvent::RunCancelled {
            reason: "cancelled".to_string()
        }
        .is_terminal());

        assert!(!WorkflowEvent::RunCancelRequested {
            reason: "cancelled".to_string()
        }
        .is_terminal());
    }

    #[test]
    fn test_next_attempt() {
        let first = invocation();
        let second = first.next_attempt();
        let third = second.next_attempt();

        assert_eq!(second.attempt, 2);
        assert_eq!(second.activity_type, first.activity_type);
        assert!(!second.is_last_attempt());
        assert!(third.is_last_attempt());
        assert_eq!(third.max_attempts(), 3);
    }
}
