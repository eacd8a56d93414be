//! Workflow trait definition

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::WorkflowAction;
use crate::activity::ActivityError;

/// Error carried by a failed run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Machine-readable code, e.g. `non_determinism`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl WorkflowError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Failure raised from an activity that ran out of attempts
    pub fn from_activity(activity_id: &str, error: &ActivityError) -> Self {
        Self {
            message: format!("activity {activity_id} failed: {}", error.message),
            code: Some(
                error
                    .error_type
                    .clone()
                    .unwrap_or_else(|| "activity_failed".to_string()),
            ),
        }
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({code})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for WorkflowError {}

/// A workflow program: a deterministic state machine driven by history
///
/// The engine rebuilds the program from its input on every decision task and
/// feeds it the recorded results in order. Each callback returns the decisions
/// made at that point.
///
/// # Determinism
///
/// Given the same input and the same sequence of results, a program must make
/// the same decisions in the same order. No clocks, randomness or I/O inside
/// callbacks; put those in activities. A divergence fails the run with a
/// `non_determinism` error.
///
/// # Example
///
/// ```ignore
/// use waypoint_durable::prelude::*;
///
/// struct Greeter {
///     name: String,
/// }
///
/// impl Workflow for Greeter {
///     const TYPE: &'static str = "Greeter";
///     type Input = String;
///     type Output = String;
///
///     fn new(name: String) -> Self {
///         Self { name }
///     }
///
///     fn on_start(&mut self) -> Vec<WorkflowAction> {
///         vec![Self::finish(format!("Hello from worker, {}!", self.name))]
///     }
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Type name the program is registered and started under
    const TYPE: &'static str;

    /// Input the run is started with
    type Input: Serialize + DeserializeOwned + Send + Clone;

    /// Result the run completes with
    type Output: Serialize + DeserializeOwned + Send;

    /// Build the program from the run input
    ///
    /// Called on every replay, so it must not have side effects.
    fn new(input: Self::Input) -> Self;

    /// First decisions of the run
    fn on_start(&mut self) -> Vec<WorkflowAction>;

    /// An activity returned a result
    fn on_activity_completed(
        &mut self,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction> {
        let _ = (activity_id, result);
        vec![]
    }

    /// An activity failed for good (non-retryable, or out of attempts)
    ///
    /// Fails the run unless overridden; override to catch and continue.
    fn on_activity_failed(
        &mut self,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction> {
        vec![WorkflowAction::fail(WorkflowError::from_activity(
            activity_id,
            error,
        ))]
    }

    /// Complete the run with a typed output
    fn finish(output: Self::Output) -> WorkflowAction
    where
        Self: Sized,
    {
        match serde_json::to_value(output) {
            Ok(result) => WorkflowAction::complete(result),
            Err(e) => WorkflowAction::fail(
                WorkflowError::new(format!("failed to serialize workflow output: {e}"))
                    .with_code("serialization"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo {
        value: String,
    }

    impl Workflow for Echo {
        const TYPE: &'static str = "echo";
        type Input = String;
        type Output = String;

        fn new(value: String) -> Self {
            Self { value }
        }

        fn on_start(&mut self) -> Vec<WorkflowAction> {
            vec![Self::finish(self.value.clone())]
        }
    }

    #[test]
    fn test_workflow_error_display() {
        let error = WorkflowError::new("something went wrong");
        assert_eq!(error.to_string(), "something went wrong");

        let error = error.with_code("NOT_FOUND");
        assert_eq!(error.to_string(), "something went wrong (NOT_FOUND)");
    }

    #[test]
    fn test_error_from_activity() {
        let error = WorkflowError::from_activity(
            "charge",
            &ActivityError::non_retryable("card declined").with_type("declined"),
        );
        assert_eq!(error.message, "activity charge failed: card declined");
        assert_eq!(error.code.as_deref(), Some("declined"));

        let error = WorkflowError::from_activity("charge", &ActivityError::retryable("flaky"));
        assert_eq!(error.code.as_deref(), Some("activity_failed"));
    }

    #[test]
    fn test_finish_serializes_output() {
        let mut workflow = Echo::new("hi".to_string());
        assert_eq!(workflow.on_start(), vec![WorkflowAction::complete(json!("hi"))]);
    }

    #[test]
    fn test_default_failure_handling_fails_run() {
        let mut workflow = Echo::new("hi".to_string());
        let actions = workflow.on_activity_failed("x", &ActivityError::retryable("boom"));

        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], WorkflowAction::FailWorkflow { .. }));
        assert!(workflow.on_activity_completed("x", json!(1)).is_empty());
    }
}
