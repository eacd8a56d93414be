//! Workflow executor with replay support
//!
//! The `WorkflowExecutor` is responsible for:
//! - Starting runs
//! - Replaying runs from their history and committing new decisions
//! - Cancellation and inspection

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::persistence::{StoreError, TaskDefinition, WorkflowStore};
use crate::reliability::RetryPolicy;
use crate::workflow::{
    ActivityInvocation, HistoryError, HistoryEvent, RunInfo, Workflow, WorkflowAction,
    WorkflowError, WorkflowEvent, WorkflowStatus,
};

use super::registry::{RegistryError, WorkflowRegistry};
use super::replay::{replay, Replayed};

/// Attempts at a cancel request before giving up on a busy run
const CANCEL_CONFLICT_RETRIES: usize = 5;

/// Configuration for the workflow executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Queue for runs started without an explicit one
    pub default_task_queue: String,

    /// A run whose history grows past this fails with `too_many_events`
    pub max_events_per_run: usize,

    /// Retry policy for activity types without an override
    pub retry_policy: RetryPolicy,

    /// Per activity type retry policies
    pub activity_retry_policies: HashMap<String, RetryPolicy>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_task_queue: "default".to_string(),
            max_events_per_run: 10_000,
            retry_policy: RetryPolicy::default(),
            activity_retry_policies: HashMap::new(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_default_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.default_task_queue = task_queue.into();
        self
    }

    pub fn with_max_events_per_run(mut self, max: usize) -> Self {
        self.max_events_per_run = max;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Override the retry policy of one activity type
    pub fn with_activity_retry_policy(mut self, activity_type: impl Into<String>, policy: RetryPolicy) -> Self {
        self.activity_retry_policies.insert(activity_type.into(), policy);
        self
    }

    /// Policy applied to `activity_type` when a call sets none
    pub fn retry_policy_for(&self, activity_type: &str) -> &RetryPolicy {
        self.activity_retry_policies
            .get(activity_type)
            .unwrap_or(&self.retry_policy)
    }
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("corrupt history: {0}")]
    History(#[from] HistoryError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("run {run_id} did not finish within {waited:?}")]
    Timeout { run_id: Uuid, waited: Duration },
}

impl ExecutorError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Result of processing a decision task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    /// Run status after the commit
    pub status: WorkflowStatus,

    /// Number of new events written
    pub events_written: usize,

    /// Number of tasks enqueued
    pub tasks_enqueued: usize,
}

impl ProcessResult {
    fn unchanged(status: WorkflowStatus) -> Self {
        Self {
            status,
            events_written: 0,
            tasks_enqueued: 0,
        }
    }
}

/// Workflow executor
///
/// Drives runs by replaying their history through the registered program and
/// committing whatever the program decides next. Every write goes through the
/// store's optimistic concurrency check, so two executors racing on one run
/// cannot both commit.
///
/// # Example
///
/// ```ignore
/// use waypoint_durable::prelude::*;
///
/// let store = Arc::new(InMemoryWorkflowStore::new());
/// let mut executor = WorkflowExecutor::new(store);
/// executor.register::<GreeterWorkflow>();
///
/// let run_id = executor.start_workflow("Greeter", json!("Ada")).await?;
/// executor.process_decision(run_id).await?;
/// ```
#[derive(Clone)]
pub struct WorkflowExecutor {
    store: Arc<dyn WorkflowStore>,
    registry: WorkflowRegistry,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self::with_config(store, ExecutorConfig::default())
    }

    pub fn with_config(store: Arc<dyn WorkflowStore>, config: ExecutorConfig) -> Self {
        Self::with_registry(store, WorkflowRegistry::new(), config)
    }

    /// Build an executor around an already populated registry
    pub fn with_registry(
        store: Arc<dyn WorkflowStore>,
        registry: WorkflowRegistry,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Register a workflow type
    pub fn register<W: Workflow>(&mut self) {
        self.registry.register::<W>();
        info!(workflow_type = W::TYPE, "registered workflow type");
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    /// Start a run on the default task queue
    ///
    /// The type does not need to be registered here; any worker polling the
    /// queue with the type registered will pick the run up.
    pub async fn start_workflow(&self, workflow_type: &str, input: Value) -> Result<Uuid, ExecutorError> {
        let task_queue = self.config.default_task_queue.clone();
        self.start_workflow_on(&task_queue, workflow_type, input).await
    }

    /// Start a run whose decisions go to `task_queue`
    #[instrument(skip(self, input))]
    pub async fn start_workflow_on(
        &self,
        task_queue: &str,
        workflow_type: &str,
        input: Value,
    ) -> Result<Uuid, ExecutorError> {
        let run_id = Uuid::now_v7();

        self.store
            .commit(
                run_id,
                0,
                vec![WorkflowEvent::RunStarted {
                    workflow_type: workflow_type.to_string(),
                    task_queue: task_queue.to_string(),
                    input,
                }],
                vec![TaskDefinition::decision(task_queue, run_id)],
            )
            .await?;

        info!(%run_id, workflow_type, task_queue, "started run");
        Ok(run_id)
    }

    /// Start a run of `W` with typed input
    pub async fn start<W: Workflow>(&self, input: W::Input) -> Result<Uuid, ExecutorError> {
        let input = serde_json::to_value(input)?;
        self.start_workflow(W::TYPE, input).await
    }

    /// Replay a run and commit its next decisions
    ///
    /// Idempotent: a terminal run is left untouched, and a stale caller loses
    /// the commit with [`StoreError::Conflict`].
    ///
    /// # Errors
    ///
    /// - [`ExecutorError::Registry`] with `UnknownWorkflowType` when this
    ///   executor cannot run the program; nothing is written
    /// - [`ExecutorError::Store`] on conflicts and storage failures
    #[instrument(skip(self))]
    pub async fn process_decision(&self, run_id: Uuid) -> Result<ProcessResult, ExecutorError> {
        let history = self.store.read(run_id).await?;
        let info = RunInfo::from_history(run_id, &history)?;

        if info.is_terminal() {
            debug!(%run_id, status = %info.status, "run already closed");
            return Ok(ProcessResult::unchanged(info.status));
        }

        if let Some(reason) = info.cancel_requested.clone() {
            self.store
                .commit(
                    run_id,
                    info.last_sequence,
                    vec![WorkflowEvent::RunCancelled {
                        reason: reason.clone(),
                    }],
                    vec![],
                )
                .await?;
            info!(%run_id, %reason, "run cancelled");
            return Ok(ProcessResult {
                status: WorkflowStatus::Cancelled,
                events_written: 1,
                tasks_enqueued: 0,
            });
        }

        if history.len() > self.config.max_events_per_run {
            let error = WorkflowError::new(format!(
                "history has {} events, limit is {}",
                history.len(),
                self.config.max_events_per_run
            ))
            .with_code("too_many_events");
            return self.fail_run(&info, error).await;
        }

        let mut workflow = match self.registry.create(&info.workflow_type, info.input.clone()) {
            Ok(workflow) => workflow,
            Err(e @ RegistryError::Deserialization { .. }) => {
                return self
                    .fail_run(&info, WorkflowError::new(e.to_string()).with_code("invalid_input"))
                    .await;
            }
            Err(e) => return Err(e.into()),
        };

        let replayed = match replay(workflow.as_mut(), &history) {
            Ok(replayed) => replayed,
            Err(e) => {
                error!(%run_id, sequence_no = e.sequence_no, detail = %e.detail, "non-determinism detected");
                return self
                    .fail_run(&info, WorkflowError::new(e.to_string()).with_code("non_determinism"))
                    .await;
            }
        };

        let (events, tasks) = self.plan(&info, replayed);
        if events.is_empty() {
            debug!(%run_id, "no new decisions");
            return Ok(ProcessResult::unchanged(WorkflowStatus::Running));
        }

        let status = match events.last() {
            Some(WorkflowEvent::RunCompleted { .. }) => WorkflowStatus::Completed,
            Some(WorkflowEvent::RunFailed { .. }) => WorkflowStatus::Failed,
            _ => WorkflowStatus::Running,
        };
        let result = ProcessResult {
            status,
            events_written: events.len(),
            tasks_enqueued: tasks.len(),
        };

        self.store
            .commit(run_id, info.last_sequence, events, tasks)
            .await?;

        match status {
            WorkflowStatus::Completed => info!(%run_id, "run completed"),
            WorkflowStatus::Failed => warn!(%run_id, "run failed"),
            _ => debug!(%run_id, events = result.events_written, "committed decisions"),
        }
        Ok(result)
    }

    /// Turn new decisions into events and tasks
    fn plan(&self, info: &RunInfo, replayed: Replayed) -> (Vec<WorkflowEvent>, Vec<TaskDefinition>) {
        let Replayed {
            new_decisions,
            mut scheduled,
            ..
        } = replayed;

        let mut events = Vec::new();
        let mut tasks = Vec::new();

        for decision in new_decisions {
            match decision {
                WorkflowAction::ScheduleActivity {
                    activity_id,
                    activity_type,
                    input,
                    options,
                } => {
                    if !scheduled.insert(activity_id.clone()) {
                        let error = WorkflowError::new(format!(
                            "activity id {activity_id} scheduled more than once"
                        ))
                        .with_code("invalid_decision");
                        return (vec![WorkflowEvent::RunFailed { error }], vec![]);
                    }

                    let retry_policy = options
                        .retry_policy
                        .unwrap_or_else(|| self.config.retry_policy_for(&activity_type).clone());
                    let invocation = ActivityInvocation {
                        activity_type,
                        input,
                        attempt: 1,
                        retry_policy,
                        task_queue: options.task_queue.unwrap_or_else(|| info.task_queue.clone()),
                        start_to_close_timeout: options.start_to_close_timeout,
                    };

                    tasks.push(TaskDefinition::activity(info.run_id, activity_id.clone(), invocation.clone()));
                    events.push(WorkflowEvent::ActivityScheduled {
                        activity_id,
                        invocation,
                    });
                }
                WorkflowAction::CompleteWorkflow { result } => {
                    events.push(WorkflowEvent::RunCompleted { result });
                    tasks.clear();
                    break;
                }
                WorkflowAction::FailWorkflow { error } => {
                    events.push(WorkflowEvent::RunFailed { error });
                    tasks.clear();
                    break;
                }
            }
        }

        (events, tasks)
    }

    async fn fail_run(&self, info: &RunInfo, error: WorkflowError) -> Result<ProcessResult, ExecutorError> {
        warn!(run_id = %info.run_id, %error, "failing run");
        self.store
            .commit(
                info.run_id,
                info.last_sequence,
                vec![WorkflowEvent::RunFailed { error }],
                vec![],
            )
            .await?;

        Ok(ProcessResult {
            status: WorkflowStatus::Failed,
            events_written: 1,
            tasks_enqueued: 0,
        })
    }

    /// Ask a run to stop
    ///
    /// Returns `false` when the run is already closed or a cancel is already
    /// pending. Activities in flight keep running; their results are
    /// discarded.
    #[instrument(skip(self))]
    pub async fn cancel_workflow(&self, run_id: Uuid, reason: &str) -> Result<bool, ExecutorError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let info = self.describe(run_id).await?;
            if info.is_terminal() || info.cancel_requested.is_some() {
                debug!(%run_id, status = %info.status, "nothing to cancel");
                return Ok(false);
            }

            let result = self
                .store
                .commit(
                    run_id,
                    info.last_sequence,
                    vec![WorkflowEvent::RunCancelRequested {
                        reason: reason.to_string(),
                    }],
                    vec![TaskDefinition::decision(&info.task_queue, run_id)],
                )
                .await;

            match result {
                Ok(_) => {
                    info!(%run_id, reason, "cancel requested");
                    return Ok(true);
                }
                Err(e) if e.is_conflict() && attempt < CANCEL_CONFLICT_RETRIES => continue,
                Err(StoreError::RunClosed(_)) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Current state of a run, derived from its history
    pub async fn describe(&self, run_id: Uuid) -> Result<RunInfo, ExecutorError> {
        let history = self.store.read(run_id).await?;
        Ok(RunInfo::from_history(run_id, &history)?)
    }

    pub async fn history(&self, run_id: Uuid) -> Result<Vec<HistoryEvent>, ExecutorError> {
        Ok(self.store.read(run_id).await?)
    }

    /// Poll a run until it reaches a terminal status
    pub async fn wait_for_completion(
        &self,
        run_id: Uuid,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<RunInfo, ExecutorError> {
        let wait = async {
            loop {
                let info = self.describe(run_id).await?;
                if info.is_terminal() {
                    return Ok::<_, ExecutorError>(info);
                }
                tokio::time::sleep(poll_interval).await;
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ExecutorError::Timeout {
                run_id,
                waited: timeout,
            })?
    }
}

impl std::fmt::Debug for WorkflowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowExecutor")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}
