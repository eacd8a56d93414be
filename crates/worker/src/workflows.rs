//! Sample workflows

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use waypoint_durable::{Activity, ActivityOptions, Workflow, WorkflowAction, WorkflowError};

use crate::activities::{ProcessActivity, ProcessInput};

/// Start-to-close limit of each `process` call
pub const PROCESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Greets by name without scheduling any activity
pub struct GreeterWorkflow {
    name: String,
}

impl Workflow for GreeterWorkflow {
    const TYPE: &'static str = "Greeter";
    type Input = String;
    type Output = String;

    fn new(name: String) -> Self {
        Self { name }
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        vec![Self::finish(format!("Hello from worker, {}!", self.name))]
    }
}

/// Input of [`CrossLanguageWorkflow`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossLanguageInput {
    pub message: String,
    pub languages: Vec<String>,

    /// Route each call to `{language}{suffix}`, e.g. `-task-queue`;
    /// unset keeps every call on the run's own queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_queue_suffix: Option<String>,
}

/// Runs `process` once per language, one after another, and joins the results
pub struct CrossLanguageWorkflow {
    input: CrossLanguageInput,
    results: Vec<String>,
}

impl CrossLanguageWorkflow {
    fn schedule(&self, index: usize) -> WorkflowAction {
        let language = &self.input.languages[index];
        let mut options = ActivityOptions::default().with_start_to_close_timeout(PROCESS_TIMEOUT);
        if let Some(suffix) = &self.input.task_queue_suffix {
            options = options.with_task_queue(format!("{language}{suffix}"));
        }

        let input = ProcessInput {
            message: self.input.message.clone(),
            language: language.clone(),
        };
        WorkflowAction::schedule_activity_with(
            format!("process-{index}-{language}"),
            ProcessActivity::TYPE,
            json!(input),
            options,
        )
    }

    fn next(&self) -> WorkflowAction {
        if self.results.len() < self.input.languages.len() {
            return self.schedule(self.results.len());
        }

        let mut summary = format!(
            "Original message: {}\n\nResults from each language:",
            self.input.message
        );
        for line in &self.results {
            summary.push('\n');
            summary.push_str(line);
        }
        Self::finish(summary)
    }
}

impl Workflow for CrossLanguageWorkflow {
    const TYPE: &'static str = "CrossLanguage";
    type Input = CrossLanguageInput;
    type Output = String;

    fn new(input: CrossLanguageInput) -> Self {
        Self {
            input,
            results: Vec::new(),
        }
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        vec![self.next()]
    }

    fn on_activity_completed(&mut self, activity_id: &str, result: Value) -> Vec<WorkflowAction> {
        match result {
            Value::String(line) => {
                self.results.push(line);
                vec![self.next()]
            }
            other => vec![WorkflowAction::fail(
                WorkflowError::new(format!(
                    "activity {activity_id} returned a non-string result: {other}"
                ))
                .with_code("unexpected_result"),
            )],
        }
    }
}
