//! Deterministic replay of a workflow program against its history
//!
//! The program is rebuilt from scratch and fed the recorded results in order.
//! Every decision event in the history must match the next decision the
//! program makes; whatever the program decides beyond the recorded history is
//! new work for the caller to commit.

use std::collections::{HashSet, VecDeque};

use super::registry::AnyWorkflow;
use crate::workflow::{HistoryEvent, WorkflowAction, WorkflowEvent};

/// Failure codes the engine writes itself; a `RunFailed` carrying one of them
/// is not a program decision.
pub(crate) const ENGINE_FAILURE_CODES: &[&str] = &[
    "non_determinism",
    "too_many_events",
    "invalid_input",
    "invalid_decision",
];

/// The program no longer makes the decisions its history records
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("non-deterministic workflow at event {sequence_no}: {detail}")]
pub struct NonDeterminismError {
    /// Event at which replay diverged
    pub sequence_no: u64,
    pub detail: String,
}

/// Result of a successful replay
#[derive(Debug, Default)]
pub struct Replayed {
    /// Decisions made after the last recorded one, in order
    pub new_decisions: Vec<WorkflowAction>,

    /// Activity ids the history already scheduled
    pub scheduled: HashSet<String>,

    /// The history ends with a terminal event
    pub closed: bool,
}

/// Replay `history` through a fresh `workflow`
pub fn replay(
    workflow: &mut dyn AnyWorkflow,
    history: &[HistoryEvent],
) -> Result<Replayed, NonDeterminismError> {
    let mut pending: VecDeque<WorkflowAction> = VecDeque::new();
    let mut scheduled = HashSet::new();
    let mut resolved = HashSet::new();

    for record in history {
        let diverged = |detail: String| NonDeterminismError {
            sequence_no: record.sequence_no,
            detail,
        };

        match &record.event {
            WorkflowEvent::RunStarted { .. } => {
                if record.sequence_no != 1 {
                    return Err(diverged("run_started after the first event".to_string()));
                }
                pending.extend(workflow.on_start());
            }

            // Retry bookkeeping written by the activity executor
            WorkflowEvent::ActivityScheduled {
                activity_id,
                invocation,
            } if invocation.attempt > 1 => {
                if !scheduled.contains(activity_id) {
                    return Err(diverged(format!(
                        "retry of activity {activity_id} that was never scheduled"
                    )));
                }
            }
            WorkflowEvent::ActivityFailed {
                will_retry: true, ..
            } => {}

            WorkflowEvent::ActivityScheduled {
                activity_id,
                invocation,
            } => match pending.pop_front() {
                Some(WorkflowAction::ScheduleActivity {
                    activity_id: decided_id,
                    activity_type,
                    input,
                    ..
                }) if decided_id == *activity_id
                    && activity_type == invocation.activity_type
                    && input == invocation.input =>
                {
                    scheduled.insert(activity_id.clone());
                }
                Some(other) => {
                    return Err(diverged(format!(
                        "history scheduled activity {activity_id} ({}) but the workflow decided {}",
                        invocation.activity_type,
                        other.describe()
                    )))
                }
                None => {
                    return Err(diverged(format!(
                        "history scheduled activity {activity_id} ({}) but the workflow made no decision",
                        invocation.activity_type
                    )))
                }
            },

            WorkflowEvent::ActivityCompleted {
                activity_id, result, ..
            } => {
                check_result(activity_id, &scheduled, &mut resolved).map_err(diverged)?;
                pending.extend(workflow.on_activity_completed(activity_id, result.clone()));
            }

            WorkflowEvent::ActivityFailed {
                activity_id, error, ..
            } => {
                check_result(activity_id, &scheduled, &mut resolved).map_err(diverged)?;
                pending.extend(workflow.on_activity_failed(activity_id, error));
            }

            WorkflowEvent::RunCancelRequested { .. } => {}

            WorkflowEvent::RunCompleted { result } => match pending.pop_front() {
                Some(WorkflowAction::CompleteWorkflow { result: decided }) if decided == *result => {
                    return Ok(closed(scheduled));
                }
                other => {
                    return Err(diverged(format!(
                        "history completed the run but the workflow decided {}",
                        describe(other.as_ref())
                    )))
                }
            },

            WorkflowEvent::RunFailed { error } => {
                let engine_failure = error
                    .code
                    .as_deref()
                    .is_some_and(|code| ENGINE_FAILURE_CODES.contains(&code));
                if engine_failure {
                    return Ok(closed(scheduled));
                }
                return match pending.pop_front() {
                    Some(WorkflowAction::FailWorkflow { error: decided }) if decided == *error => {
                        Ok(closed(scheduled))
                    }
                    other => Err(diverged(format!(
                        "history failed the run but the workflow decided {}",
                        describe(other.as_ref())
                    ))),
                };
            }

            WorkflowEvent::RunCancelled { .. } => return Ok(closed(scheduled)),
        }
    }

    Ok(Replayed {
        new_decisions: pending.into(),
        scheduled,
        closed: false,
    })
}

fn check_result(
    activity_id: &str,
    scheduled: &HashSet<String>,
    resolved: &mut HashSet<String>,
) -> Result<(), String> {
    if !scheduled.contains(activity_id) {
        return Err(format!("result for activity {activity_id} that was never scheduled"));
    }
    if !resolved.insert(activity_id.to_string()) {
        return Err(format!("second result for activity {activity_id}"));
    }
    Ok(())
}

fn closed(scheduled: HashSet<String>) -> Replayed {
    Replayed {
        new_decisions: Vec::new(),
        scheduled,
        closed: true,
    }
}

fn describe(action: Option<&WorkflowAction>) -> String {
    action.map_or_else(|| "nothing".to_string(), WorkflowAction::describe)
}
