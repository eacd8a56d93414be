//! Activity executor
//!
//! Runs one activity attempt and records its outcome in the run's history.
//! Retries are history too: a retryable failure is committed together with
//! the next attempt's `ActivityScheduled` event and a delayed activity task.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{ActivityContext, ActivityError, ActivityRegistry};
use crate::persistence::{StoreError, TaskDefinition, WorkflowStore};
use crate::workflow::{ActivityInvocation, HistoryEvent, WorkflowEvent};

/// Commits lost to concurrent writers before giving the task back
const REPORT_CONFLICT_RETRIES: usize = 5;

/// What happens after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry { next_attempt: u32, delay: Duration },
    GiveUp,
}

/// Decide whether `error` on this attempt earns another one
pub fn retry_decision(invocation: &ActivityInvocation, error: &ActivityError) -> RetryDecision {
    let policy = &invocation.retry_policy;
    if error.retryable
        && policy.should_retry(error.error_type.as_deref())
        && invocation.attempt < invocation.max_attempts()
    {
        let next_attempt = invocation.attempt + 1;
        RetryDecision::Retry {
            next_attempt,
            delay: policy.delay_for_attempt(next_attempt),
        }
    } else {
        RetryDecision::GiveUp
    }
}

/// How an attempt's outcome ended up in history
#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    /// Result recorded, the workflow will see it
    Recorded,

    /// Failure recorded and the next attempt scheduled
    RetryScheduled { next_attempt: u32, delay: Duration },

    /// Final failure recorded, the workflow will see it
    Exhausted,

    /// The attempt is no longer wanted; nothing was written
    Discarded,
}

/// Errors from activity execution
#[derive(Debug, thiserror::Error)]
pub enum ActivityExecutorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// No handler registered for this activity type in this process
    #[error("activity type not registered: {0}")]
    UnregisteredActivity(String),
}

impl ActivityExecutorError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::UnregisteredActivity(_) => false,
        }
    }
}

/// Why an attempt should not run or be recorded
fn stale_reason(history: &[HistoryEvent], activity_id: &str, attempt: u32) -> Option<&'static str> {
    let mut latest_attempt = None;

    for record in history {
        match &record.event {
            event if event.is_terminal() => return Some("run is closed"),
            WorkflowEvent::ActivityScheduled {
                activity_id: id,
                invocation,
            } if id == activity_id => latest_attempt = Some(invocation.attempt),
            WorkflowEvent::ActivityCompleted {
                activity_id: id,
                attempt: a,
                ..
            }
            | WorkflowEvent::ActivityFailed {
                activity_id: id,
                attempt: a,
                ..
            } if id == activity_id && *a == attempt => return Some("attempt already has a result"),
            _ => {}
        }
    }

    match latest_attempt {
        None => Some("activity was never scheduled"),
        Some(latest) if latest != attempt => Some("a later attempt is scheduled"),
        Some(_) => None,
    }
}

/// A cancel was requested but the run has not closed yet
fn cancel_pending(history: &[HistoryEvent]) -> bool {
    history
        .iter()
        .any(|record| matches!(record.event, WorkflowEvent::RunCancelRequested { .. }))
}

fn run_task_queue(history: &[HistoryEvent]) -> Option<&str> {
    history.first().and_then(|record| match &record.event {
        WorkflowEvent::RunStarted { task_queue, .. } => Some(task_queue.as_str()),
        _ => None,
    })
}

/// Runs activity attempts and reports their outcome
#[derive(Clone)]
pub struct ActivityExecutor {
    store: Arc<dyn WorkflowStore>,
    registry: ActivityRegistry,
}

impl ActivityExecutor {
    pub fn new(store: Arc<dyn WorkflowStore>, registry: ActivityRegistry) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &ActivityRegistry {
        &self.registry
    }

    pub fn can_execute(&self, activity_type: &str) -> bool {
        self.registry.contains(activity_type)
    }

    /// Run one attempt: stale check, execute, report
    ///
    /// # Errors
    ///
    /// [`ActivityExecutorError::UnregisteredActivity`] when this process has
    /// no handler; the caller should leave the task for another worker. A
    /// store error from `report` is returned after the handler ran, so
    /// callers that retry should retry [`report`](Self::report) alone.
    #[instrument(skip(self, invocation), fields(activity_type = %invocation.activity_type, attempt = invocation.attempt))]
    pub async fn run_task(
        &self,
        run_id: Uuid,
        activity_id: &str,
        invocation: &ActivityInvocation,
    ) -> Result<ReportOutcome, ActivityExecutorError> {
        if !self.is_runnable(run_id, activity_id, invocation).await? {
            return Ok(ReportOutcome::Discarded);
        }

        let outcome = self.execute(run_id, activity_id, invocation).await;
        self.report(run_id, activity_id, invocation, outcome).await
    }

    /// Whether this attempt should start
    ///
    /// False once the run is closed or cancelling, the attempt already has a
    /// result, or a later attempt replaced it.
    pub async fn is_runnable(
        &self,
        run_id: Uuid,
        activity_id: &str,
        invocation: &ActivityInvocation,
    ) -> Result<bool, ActivityExecutorError> {
        if !self.can_execute(&invocation.activity_type) {
            return Err(ActivityExecutorError::UnregisteredActivity(
                invocation.activity_type.clone(),
            ));
        }

        let history = match self.store.read(run_id).await {
            Ok(history) => history,
            Err(StoreError::RunNotFound(_)) => {
                warn!(%run_id, activity_id, "run no longer exists, discarding activity");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let reason = stale_reason(&history, activity_id, invocation.attempt)
            .or_else(|| cancel_pending(&history).then_some("run is being cancelled"));
        if let Some(reason) = reason {
            warn!(%run_id, activity_id, reason, "discarding stale activity task");
            return Ok(false);
        }
        Ok(true)
    }

    /// Execute the handler for one attempt
    ///
    /// The handler runs on its own task so a panic is caught as a retryable
    /// `panic` error; `start_to_close_timeout` yields a retryable `timeout`.
    pub async fn execute(
        &self,
        run_id: Uuid,
        activity_id: &str,
        invocation: &ActivityInvocation,
    ) -> Result<Value, ActivityError> {
        let Some(handler) = self.registry.get(&invocation.activity_type) else {
            return Err(ActivityError::non_retryable(format!(
                "activity type not registered: {}",
                invocation.activity_type
            ))
            .with_type("unregistered_activity"));
        };

        let ctx = ActivityContext::new(run_id, activity_id, invocation);
        debug!(%run_id, activity_id, attempt = ctx.attempt, "executing activity");

        let handle = tokio::spawn(handler(ctx, invocation.input.clone()));
        let abort = handle.abort_handle();

        let joined = match invocation.start_to_close_timeout {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    abort.abort();
                    return Err(ActivityError::retryable(format!(
                        "activity {activity_id} timed out after {limit:?}"
                    ))
                    .with_type("timeout"));
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Err(ActivityError::retryable(format!(
                "activity {activity_id} panicked"
            ))
            .with_type("panic")),
            Err(e) => Err(ActivityError::retryable(format!(
                "activity {activity_id} was aborted: {e}"
            ))
            .with_type("cancelled")),
        }
    }

    /// Record an attempt's outcome and schedule what follows
    ///
    /// Re-reads the history first, so a result arriving after the run closed,
    /// or after another worker already reported this attempt, is discarded.
    #[instrument(skip(self, invocation, outcome), fields(attempt = invocation.attempt))]
    pub async fn report(
        &self,
        run_id: Uuid,
        activity_id: &str,
        invocation: &ActivityInvocation,
        outcome: Result<Value, ActivityError>,
    ) -> Result<ReportOutcome, ActivityExecutorError> {
        let mut conflicts = 0;

        loop {
            let history = match self.store.read(run_id).await {
                Ok(history) => history,
                Err(StoreError::RunNotFound(_)) => return Ok(ReportOutcome::Discarded),
                Err(e) => return Err(e.into()),
            };
            if let Some(reason) = stale_reason(&history, activity_id, invocation.attempt) {
                warn!(%run_id, activity_id, reason, "discarding activity result");
                return Ok(ReportOutcome::Discarded);
            }

            let last_sequence = history.last().map_or(0, |record| record.sequence_no);
            let decision_queue = run_task_queue(&history)
                .unwrap_or(&invocation.task_queue)
                .to_string();
            let (events, tasks, report) = self.plan(run_id, activity_id, invocation, &outcome, decision_queue);

            match self.store.commit(run_id, last_sequence, events, tasks).await {
                Ok(_) => {
                    match &report {
                        ReportOutcome::Recorded => {
                            debug!(%run_id, activity_id, "activity completed")
                        }
                        ReportOutcome::RetryScheduled { next_attempt, delay } => {
                            info!(%run_id, activity_id, next_attempt, ?delay, "activity failed, retrying")
                        }
                        _ => warn!(%run_id, activity_id, "activity failed for good"),
                    }
                    return Ok(report);
                }
                Err(e) if e.is_conflict() && conflicts < REPORT_CONFLICT_RETRIES => {
                    conflicts += 1;
                    debug!(%run_id, activity_id, conflicts, "conflict recording activity result, re-reading");
                }
                Err(StoreError::RunClosed(_)) => return Ok(ReportOutcome::Discarded),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn plan(
        &self,
        run_id: Uuid,
        activity_id: &str,
        invocation: &ActivityInvocation,
        outcome: &Result<Value, ActivityError>,
        decision_queue: String,
    ) -> (Vec<WorkflowEvent>, Vec<TaskDefinition>, ReportOutcome) {
        let error = match outcome {
            Ok(result) => {
                return (
                    vec![WorkflowEvent::ActivityCompleted {
                        activity_id: activity_id.to_string(),
                        attempt: invocation.attempt,
                        result: result.clone(),
                    }],
                    vec![TaskDefinition::decision(decision_queue, run_id)],
                    ReportOutcome::Recorded,
                );
            }
            Err(error) => error,
        };

        match retry_decision(invocation, error) {
            RetryDecision::Retry { next_attempt, delay } => {
                let next = invocation.next_attempt();
                (
                    vec![
                        WorkflowEvent::ActivityFailed {
                            activity_id: activity_id.to_string(),
                            attempt: invocation.attempt,
                            error: error.clone(),
                            will_retry: true,
                        },
                        WorkflowEvent::ActivityScheduled {
                            activity_id: activity_id.to_string(),
                            invocation: next.clone(),
                        },
                    ],
                    vec![TaskDefinition::activity(run_id, activity_id, next).with_delay(delay)],
                    ReportOutcome::RetryScheduled { next_attempt, delay },
                )
            }
            RetryDecision::GiveUp => (
                vec![WorkflowEvent::ActivityFailed {
                    activity_id: activity_id.to_string(),
                    attempt: invocation.attempt,
                    error: error.clone(),
                    will_retry: false,
                }],
                vec![TaskDefinition::decision(decision_queue, run_id)],
                ReportOutcome::Exhausted,
            ),
        }
    }
}

impl std::fmt::Debug for ActivityExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityExecutor")
            .field("registry", &self.registry)
            .finish()
    }
}
