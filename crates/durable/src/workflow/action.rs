//! Workflow decisions and activity options

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::WorkflowError;
use crate::reliability::RetryPolicy;

/// Decisions a workflow program can make
///
/// Callbacks on [`Workflow`](super::Workflow) return these. The engine turns
/// each new decision into a [`WorkflowEvent`](super::WorkflowEvent) and, on
/// replay, checks that recorded events match the decisions made again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowAction {
    /// Schedule an activity for execution
    ScheduleActivity {
        /// Identifier of this call, unique within the run
        activity_id: String,

        /// Registered activity type to run
        activity_type: String,

        /// Input handed to the activity (JSON)
        input: serde_json::Value,

        /// Queue, timeout and retry overrides
        #[serde(default)]
        options: ActivityOptions,
    },

    /// Complete the run with a result
    CompleteWorkflow {
        result: serde_json::Value,
    },

    /// Fail the run; terminal, never retried
    FailWorkflow {
        error: WorkflowError,
    },
}

impl WorkflowAction {
    /// Schedule an activity with default options
    pub fn schedule_activity(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::schedule_activity_with(activity_id, activity_type, input, ActivityOptions::default())
    }

    /// Schedule an activity with explicit options
    pub fn schedule_activity_with(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
        options: ActivityOptions,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options,
        }
    }

    pub fn complete(result: serde_json::Value) -> Self {
        Self::CompleteWorkflow { result }
    }

    pub fn fail(error: WorkflowError) -> Self {
        Self::FailWorkflow { error }
    }

    /// Whether this decision closes the run
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::CompleteWorkflow { .. } | Self::FailWorkflow { .. })
    }

    /// Short human-readable form used in divergence reports
    pub fn describe(&self) -> String {
        match self {
            Self::ScheduleActivity {
                activity_id,
                activity_type,
                ..
            } => format!("ScheduleActivity({activity_id}: {activity_type})"),
            Self::CompleteWorkflow { .. } => "CompleteWorkflow".to_string(),
            Self::FailWorkflow { error } => format!("FailWorkflow({})", error.message),
        }
    }
}

/// Per-call activity options
///
/// Anything left unset falls back to the engine configuration when the
/// activity is scheduled.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    /// Retry policy for this call; overrides the per-type configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,

    /// Queue the activity task is placed on; defaults to the run's queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_queue: Option<String>,

    /// Limit on a single execution attempt
    #[serde(
        default,
        with = "option_duration_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub start_to_close_timeout: Option<Duration>,
}

impl ActivityOptions {
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = Some(task_queue.into());
        self
    }

    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = Some(timeout);
        self
    }
}

/// Serde support for `Option<Duration>` as milliseconds
pub(crate) mod option_duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => (d.as_millis() as u64).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
