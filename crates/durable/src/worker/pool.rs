//! Worker pool for task execution
//!
//! Runs N independent poll loops against one task queue plus a maintenance
//! loop, and routes each leased task to the engine or the activity executor.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::{duration_millis, PollerConfig, PollerError, TaskPoller};
use crate::activity::{
    Activity, ActivityContext, ActivityError, ActivityExecutor, ActivityExecutorError,
    ActivityRegistry,
};
use crate::engine::{ExecutorConfig, ExecutorError, RegistryError, WorkflowExecutor, WorkflowRegistry};
use crate::persistence::{LeasedTask, StoreError, TaskPayload, WorkflowStore};
use crate::workflow::{ActivityInvocation, Workflow};

/// Pause between dispatch retries after a transient failure
const DISPATCH_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Queue every poll loop reads from
    pub task_queue: String,

    /// Number of independent poll loops
    pub concurrency: usize,

    /// How long a leased task stays invisible to other pollers
    #[serde(with = "duration_millis")]
    pub lease_duration: Duration,

    /// Retries of a dispatch that failed with a transient store error
    pub max_dispatch_retries: u32,

    /// How often expired leases are reclaimed and old runs purged
    #[serde(with = "duration_millis")]
    pub maintenance_interval: Duration,

    /// Closed runs older than this are purged; `None` keeps them forever
    #[serde(default, with = "option_duration_millis")]
    pub retention: Option<Duration>,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Poller configuration
    pub poller: PollerConfig,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let poller = PollerConfig::default();
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            task_queue: "default".to_string(),
            concurrency: 4,
            lease_duration: poller.poll_timeout,
            max_dispatch_retries: 3,
            maintenance_interval: Duration::from_secs(30),
            retention: Some(Duration::from_secs(7 * 24 * 60 * 60)),
            shutdown_timeout: Duration::from_secs(30),
            poller,
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration for one task queue
    pub fn new(task_queue: impl Into<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            ..Default::default()
        }
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = task_queue.into();
        self
    }

    /// Set the number of poll loops
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_max_dispatch_retries(mut self, retries: u32) -> Self {
        self.max_dispatch_retries = retries;
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set poller configuration
    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Worker is starting up
    Starting,
    /// Worker is running and accepting tasks
    Running,
    /// Worker is draining (completing current tasks, not accepting new ones)
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Poller error
    #[error("poller error: {0}")]
    Poller(#[from] PollerError),

    /// Worker already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// What happened to a leased task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handled and removed from the queue
    Acked,
    /// Left leased; it becomes visible again when the lease expires
    Abandoned,
    /// Handed back to the queue without being handled
    Released,
}

/// Result of one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub reclaimed: usize,
    pub purged: usize,
}

enum Step {
    Ack,
    Abandon,
}

/// Routes leased tasks; shared by every poll loop
#[derive(Clone)]
struct Dispatcher {
    store: Arc<dyn WorkflowStore>,
    executor: WorkflowExecutor,
    activities: ActivityExecutor,
    max_dispatch_retries: u32,
}

impl Dispatcher {
    #[instrument(skip(self, task), fields(task_id = %task.task_id, run_id = %task.run_id, kind = %task.kind()))]
    async fn dispatch(&self, task: LeasedTask) -> DispatchOutcome {
        let step = match &task.payload {
            TaskPayload::Decision => self.decide(task.run_id).await,
            TaskPayload::Activity {
                activity_id,
                invocation,
            } => self.run_activity(task.run_id, activity_id, invocation).await,
        };

        match step {
            Step::Ack => self.ack(&task).await,
            Step::Abandon => {
                warn!(
                    delivery_count = task.delivery_count,
                    "abandoning task to lease expiry"
                );
                DispatchOutcome::Abandoned
            }
        }
    }

    /// Count one more transient failure; false once the budget is spent
    async fn retry_later(&self, retries: &mut u32, reason: &(dyn std::fmt::Display + Sync)) -> bool {
        if *retries >= self.max_dispatch_retries {
            warn!(retries = *retries, %reason, "dispatch retries exhausted");
            return false;
        }
        *retries += 1;
        debug!(retries = *retries, %reason, "transient failure, retrying");
        tokio::time::sleep(DISPATCH_RETRY_DELAY).await;
        true
    }

    async fn decide(&self, run_id: Uuid) -> Step {
        let mut retries = 0;
        loop {
            match self.executor.process_decision(run_id).await {
                Ok(result) => {
                    debug!(
                        status = %result.status,
                        events_written = result.events_written,
                        tasks_enqueued = result.tasks_enqueued,
                        "decision processed"
                    );
                    return Step::Ack;
                }
                Err(ExecutorError::Store(StoreError::RunNotFound(_))) => {
                    warn!("decision task for unknown run, dropping");
                    return Step::Ack;
                }
                Err(ExecutorError::Registry(RegistryError::UnknownWorkflowType(workflow_type))) => {
                    warn!(%workflow_type, "workflow type not registered on this worker");
                    return Step::Abandon;
                }
                Err(e) if e.is_transient() => {
                    if !self.retry_later(&mut retries, &e).await {
                        return Step::Abandon;
                    }
                }
                Err(e) => {
                    error!(error = %e, "decision processing failed");
                    return Step::Abandon;
                }
            }
        }
    }

    /// Check, execute once, then report; only the store calls are retried
    async fn run_activity(
        &self,
        run_id: Uuid,
        activity_id: &str,
        invocation: &ActivityInvocation,
    ) -> Step {
        let mut retries = 0;
        loop {
            match self.activities.is_runnable(run_id, activity_id, invocation).await {
                Ok(true) => break,
                Ok(false) => return Step::Ack,
                Err(ActivityExecutorError::UnregisteredActivity(activity_type)) => {
                    warn!(%activity_type, "activity type not registered on this worker");
                    return Step::Abandon;
                }
                Err(e) if e.is_transient() => {
                    if !self.retry_later(&mut retries, &e).await {
                        return Step::Abandon;
                    }
                }
                Err(e) => {
                    error!(error = %e, "activity task failed");
                    return Step::Abandon;
                }
            }
        }

        let outcome = self.activities.execute(run_id, activity_id, invocation).await;
        loop {
            match self
                .activities
                .report(run_id, activity_id, invocation, outcome.clone())
                .await
            {
                Ok(report) => {
                    debug!(activity_id, ?report, "activity task handled");
                    return Step::Ack;
                }
                Err(e) if e.is_transient() => {
                    if !self.retry_later(&mut retries, &e).await {
                        return Step::Abandon;
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to record activity outcome");
                    return Step::Abandon;
                }
            }
        }
    }

    async fn ack(&self, task: &LeasedTask) -> DispatchOutcome {
        match self.store.ack(task).await {
            Ok(()) => DispatchOutcome::Acked,
            Err(StoreError::TaskNotFound(_)) => {
                // Lease expired and another worker already finished it
                warn!("task was acked elsewhere");
                DispatchOutcome::Acked
            }
            Err(StoreError::LeaseLost(_)) => {
                // The current holder settles it; its replay sees our writes
                warn!("lease expired before ack, task belongs to another worker");
                DispatchOutcome::Abandoned
            }
            Err(e) => {
                error!(error = %e, "failed to ack task");
                DispatchOutcome::Abandoned
            }
        }
    }

    async fn release(&self, task: &LeasedTask) -> DispatchOutcome {
        match self.store.nack(task).await {
            Ok(()) => DispatchOutcome::Released,
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "failed to release task");
                DispatchOutcome::Abandoned
            }
        }
    }
}

/// Builder for [`WorkerPool`]
pub struct WorkerPoolBuilder {
    store: Arc<dyn WorkflowStore>,
    config: WorkerPoolConfig,
    executor_config: ExecutorConfig,
    task_queue: Option<String>,
    workflows: WorkflowRegistry,
    activities: ActivityRegistry,
}

impl WorkerPoolBuilder {
    /// Queue to poll; also the default queue for runs started through the pool
    pub fn task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = Some(task_queue.into());
        self
    }

    pub fn workflow<W: Workflow>(mut self) -> Self {
        self.workflows.register::<W>();
        self
    }

    pub fn activity<A: Activity>(mut self, activity: A) -> Self {
        self.activities.register(activity);
        self
    }

    pub fn activity_fn<F, Fut>(mut self, activity_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        self.activities.register_fn(activity_type, handler);
        self
    }

    pub fn config(mut self, config: WorkerPoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    pub fn build(self) -> WorkerPool {
        let mut config = self.config;
        let mut executor_config = self.executor_config;
        if let Some(task_queue) = self.task_queue {
            config.task_queue = task_queue.clone();
            executor_config.default_task_queue = task_queue;
        }

        let executor =
            WorkflowExecutor::with_registry(Arc::clone(&self.store), self.workflows, executor_config);
        let activities = ActivityExecutor::new(Arc::clone(&self.store), self.activities);

        WorkerPool::new(self.store, executor, activities, config)
    }
}

/// Worker pool polling one task queue
///
/// Decisions are idempotent under redelivery: a second delivery either
/// replays to the same commit and loses the sequence check, or finds nothing
/// new to write. Activities are at-least-once; a crash after the handler
/// returns and before its result is committed runs the activity again.
///
/// # Example
///
/// ```ignore
/// use waypoint_durable::prelude::*;
///
/// let pool = WorkerPool::builder(store)
///     .task_queue("default")
///     .workflow::<GreeterWorkflow>()
///     .activity(ProcessActivity)
///     .build();
///
/// pool.start().await?;
/// let run_id = pool.executor().start_workflow("Greeter", json!("Ada")).await?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    dispatcher: Dispatcher,
    config: WorkerPoolConfig,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerPoolStatus>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn builder(store: Arc<dyn WorkflowStore>) -> WorkerPoolBuilder {
        WorkerPoolBuilder {
            store,
            config: WorkerPoolConfig::default(),
            executor_config: ExecutorConfig::default(),
            task_queue: None,
            workflows: WorkflowRegistry::new(),
            activities: ActivityRegistry::new(),
        }
    }

    /// Create a worker pool from prepared executors
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        executor: WorkflowExecutor,
        activities: ActivityExecutor,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            dispatcher: Dispatcher {
                store,
                executor,
                activities,
                max_dispatch_retries: config.max_dispatch_retries,
            },
            config,
            shutdown_tx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start the poll loops and the maintenance loop
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Stopped {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Starting;
        }

        info!(
            worker_id = %self.config.worker_id,
            task_queue = %self.config.task_queue,
            concurrency = self.config.concurrency,
            workflow_types = ?self.executor().registry().workflow_types().collect::<Vec<_>>(),
            activity_types = ?self.activity_executor().registry().activity_types().collect::<Vec<_>>(),
            "starting worker pool"
        );

        self.shutdown_tx.send_replace(false);

        let mut handles = Vec::with_capacity(self.config.concurrency + 1);
        for loop_index in 0..self.config.concurrency.max(1) {
            handles.push(self.spawn_poll_loop(loop_index));
        }
        handles.push(self.spawn_maintenance_loop());
        *self.handles.lock() = handles;

        *self.status.write() = WorkerPoolStatus::Running;
        Ok(())
    }

    /// Shutdown the worker pool gracefully
    ///
    /// In-flight tasks finish; loops stop polling. Loops still busy after
    /// `shutdown_timeout` are aborted and their tasks recovered by lease expiry.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        if self.status() == WorkerPoolStatus::Stopped {
            return Ok(());
        }

        info!(worker_id = %self.config.worker_id, "initiating graceful shutdown");
        *self.status.write() = WorkerPoolStatus::Draining;
        self.shutdown_tx.send_replace(true);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        let abort_handles: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        let result = tokio::time::timeout(self.config.shutdown_timeout, join_all(handles)).await;
        *self.status.write() = WorkerPoolStatus::Stopped;

        match result {
            Ok(_) => {
                info!(worker_id = %self.config.worker_id, "worker pool stopped");
                Ok(())
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                    "shutdown timeout reached, aborting loops"
                );
                for handle in abort_handles {
                    handle.abort();
                }
                Err(WorkerPoolError::ShutdownTimeout)
            }
        }
    }

    /// Poll and dispatch a single task
    ///
    /// Returns `None` when no task is visible right now.
    pub async fn run_once(&self) -> Result<Option<DispatchOutcome>, WorkerPoolError> {
        let task = self
            .dispatcher
            .store
            .poll(&self.config.task_queue, self.config.lease_duration)
            .await?;

        match task {
            Some(task) => Ok(Some(self.dispatcher.dispatch(task).await)),
            None => Ok(None),
        }
    }

    /// Dispatch visible tasks until the queue is empty or `max_tasks` ran
    ///
    /// Tasks delayed by a retry backoff are not waited for.
    pub async fn run_until_idle(&self, max_tasks: usize) -> Result<usize, WorkerPoolError> {
        let mut handled = 0;
        while handled < max_tasks {
            match self.run_once().await? {
                Some(_) => handled += 1,
                None => break,
            }
        }
        Ok(handled)
    }

    /// Reclaim expired leases and purge runs past retention
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, WorkerPoolError> {
        run_maintenance(self.dispatcher.store.as_ref(), self.config.retention).await
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Engine handle, also used to start and inspect runs
    pub fn executor(&self) -> &WorkflowExecutor {
        &self.dispatcher.executor
    }

    pub fn activity_executor(&self) -> &ActivityExecutor {
        &self.dispatcher.activities
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.dispatcher.store
    }

    fn spawn_poll_loop(&self, loop_index: usize) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let mut poller = TaskPoller::new(
            Arc::clone(&self.dispatcher.store),
            self.config.task_queue.clone(),
            self.config.lease_duration,
            self.config.poller.clone(),
            self.shutdown_tx.subscribe(),
        );

        tokio::spawn(async move {
            debug!(loop_index, "poll loop started");
            loop {
                match poller.next_task().await {
                    Ok(Some(task)) => {
                        if poller.is_shutdown() {
                            debug!(task_id = %task.task_id, "shutdown requested, releasing task");
                            dispatcher.release(&task).await;
                            break;
                        }
                        dispatcher.dispatch(task).await;
                    }
                    Ok(None) => {
                        if poller.is_shutdown() {
                            break;
                        }
                    }
                    Err(PollerError::Shutdown) => break,
                    Err(e) => {
                        error!(loop_index, error = %e, "poll failed");
                        if poller.wait().await {
                            break;
                        }
                    }
                }
            }
            debug!(loop_index, "poll loop exited");
        })
    }

    fn spawn_maintenance_loop(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.dispatcher.store);
        let interval = self.config.maintenance_interval;
        let retention = self.config.retention;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = run_maintenance(store.as_ref(), retention).await {
                            error!(error = %e, "maintenance pass failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("maintenance loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("maintenance loop exited");
        })
    }
}

async fn run_maintenance(
    store: &dyn WorkflowStore,
    retention: Option<Duration>,
) -> Result<MaintenanceReport, WorkerPoolError> {
    let reclaimed = store.reclaim_expired_leases().await?;
    if !reclaimed.is_empty() {
        info!(count = reclaimed.len(), "reclaimed expired leases");
    }

    let mut purged = 0;
    if let Some(retention) = retention {
        match chrono::Duration::from_std(retention) {
            Ok(retention) => {
                let runs = store.purge_closed_runs(Utc::now() - retention).await?;
                if !runs.is_empty() {
                    info!(count = runs.len(), "purged closed runs past retention");
                }
                purged = runs.len();
            }
            Err(_) => warn!(?retention, "retention window out of range, skipping purge"),
        }
    }

    Ok(MaintenanceReport {
        reclaimed: reclaimed.len(),
        purged,
    })
}

/// Serde support for `Option<Duration>` as milliseconds
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{HistoryStore, InMemoryWorkflowStore, TaskDefinition, TaskQueue};
    use crate::workflow::{WorkflowAction, WorkflowEvent, WorkflowStatus};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    const LEASE: Duration = Duration::from_secs(30);

    struct Echo {
        text: String,
    }

    impl Workflow for Echo {
        const TYPE: &'static str = "Echo";
        type Input = String;
        type Output = String;

        fn new(text: String) -> Self {
            Self { text }
        }

        fn on_start(&mut self) -> Vec<WorkflowAction> {
            vec![WorkflowAction::schedule_activity(
                "echo-1",
                "echo",
                json!(self.text),
            )]
        }

        fn on_activity_completed(&mut self, _activity_id: &str, result: Value) -> Vec<WorkflowAction> {
            vec![WorkflowAction::complete(result)]
        }
    }

    fn pool(store: Arc<InMemoryWorkflowStore>) -> WorkerPool {
        WorkerPool::builder(store)
            .workflow::<Echo>()
            .activity_fn("echo", |_ctx, input| async move { Ok(input) })
            .config(
                WorkerPoolConfig::default()
                    .with_concurrency(2)
                    .with_lease_duration(Duration::from_secs(5))
                    .with_poller(
                        PollerConfig::default()
                            .with_min_interval(Duration::from_millis(5))
                            .with_max_interval(Duration::from_millis(20)),
                    ),
            )
            .build()
    }

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.task_queue, "default");
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.lease_duration, Duration::from_secs(30));
        assert_eq!(config.max_dispatch_retries, 3);
        assert_eq!(config.maintenance_interval, Duration::from_secs(30));
        assert_eq!(config.retention, Some(Duration::from_secs(604_800)));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerPoolConfig::new("orders")
            .with_worker_id("test-worker")
            .with_concurrency(0)
            .with_lease_duration(Duration::from_secs(10))
            .with_max_dispatch_retries(5)
            .with_retention(None);

        assert_eq!(config.worker_id, "test-worker");
        assert_eq!(config.task_queue, "orders");
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.lease_duration, Duration::from_secs(10));
        assert_eq!(config.max_dispatch_retries, 5);
        assert_eq!(config.retention, None);
    }

    #[test]
    fn test_config_serde() {
        let config = WorkerPoolConfig::new("orders").with_retention(None);
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["lease_duration"], json!(30_000));
        assert_eq!(value["retention"], Value::Null);

        let back: WorkerPoolConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back.retention, None);
        assert_eq!(back.task_queue, "orders");
    }

    #[test]
    fn test_builder_task_queue_sets_executor_default() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let pool = WorkerPool::builder(store).task_queue("orders").build();

        assert_eq!(pool.config().task_queue, "orders");
        assert_eq!(pool.executor().config().default_task_queue, "orders");
    }

    #[test_log::test(tokio::test)]
    async fn test_run_until_idle_completes_run() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let pool = pool(store.clone());

        let run_id = pool.executor().start::<Echo>("ping".into()).await.unwrap();
        let handled = pool.run_until_idle(10).await.unwrap();
        assert_eq!(handled, 3);

        let info = pool.executor().describe(run_id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Completed);
        assert_eq!(info.result, Some(json!("ping")));
        assert_eq!(store.task_count(), 0);
    }

    #[tokio::test]
    async fn test_run_once_on_empty_queue() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let pool = pool(store);
        assert_eq!(pool.run_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_decision_for_unknown_run_is_acked() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let pool = pool(store.clone());
        store
            .enqueue(TaskDefinition::decision("default", Uuid::now_v7()))
            .await
            .unwrap();

        assert_eq!(pool.run_once().await.unwrap(), Some(DispatchOutcome::Acked));
        assert_eq!(store.task_count(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_workflow_is_abandoned() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let pool = pool(store.clone());
        pool.executor()
            .start_workflow("Elsewhere", json!(null))
            .await
            .unwrap();

        assert_eq!(
            pool.run_once().await.unwrap(),
            Some(DispatchOutcome::Abandoned)
        );
        assert_eq!(store.leased_task_count(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_activity_is_abandoned() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let pool = WorkerPool::builder(store.clone()).workflow::<Echo>().build();

        let run_id = pool.executor().start::<Echo>("ping".into()).await.unwrap();
        assert_eq!(pool.run_once().await.unwrap(), Some(DispatchOutcome::Acked));
        assert_eq!(
            pool.run_once().await.unwrap(),
            Some(DispatchOutcome::Abandoned)
        );

        let history = store.read(run_id).await.unwrap();
        assert!(!history
            .iter()
            .any(|r| matches!(r.event, WorkflowEvent::ActivityCompleted { .. })));
    }

    #[tokio::test]
    async fn test_maintenance_reclaims_and_purges() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let pool = WorkerPool::builder(store.clone())
            .workflow::<Echo>()
            .activity_fn("echo", |_ctx, input| async move { Ok(input) })
            .config(WorkerPoolConfig::default().with_retention(Some(Duration::ZERO)))
            .build();

        let run_id = pool.executor().start::<Echo>("ping".into()).await.unwrap();
        pool.run_until_idle(10).await.unwrap();

        store
            .enqueue(TaskDefinition::decision("default", Uuid::now_v7()))
            .await
            .unwrap();
        store.poll("default", Duration::ZERO).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = pool.run_maintenance().await.unwrap();
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.purged, 1);
        assert!(matches!(
            store.read(run_id).await,
            Err(StoreError::RunNotFound(_))
        ));
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn test_start_and_shutdown() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let pool = pool(store);
        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);

        pool.start().await.unwrap();
        assert_eq!(pool.status(), WorkerPoolStatus::Running);
        assert!(matches!(
            pool.start().await,
            Err(WorkerPoolError::AlreadyRunning)
        ));

        let run_id = pool.executor().start::<Echo>("hello".into()).await.unwrap();
        let info = pool
            .executor()
            .wait_for_completion(run_id, Duration::from_millis(10), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(info.result, Some(json!("hello")));

        pool.shutdown().await.unwrap();
        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_redelivered_activity_is_not_rerun() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let pool = WorkerPool::builder(store.clone())
            .workflow::<Echo>()
            .activity_fn("echo", move |_ctx, input| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(input)
                }
            })
            .build();

        let run_id = pool.executor().start::<Echo>("once".into()).await.unwrap();
        pool.run_until_idle(10).await.unwrap();

        // Redelivering the already-reported activity must not run it again
        let history = store.read(run_id).await.unwrap();
        let invocation = history
            .iter()
            .find_map(|r| match &r.event {
                WorkflowEvent::ActivityScheduled { invocation, .. } => Some(invocation.clone()),
                _ => None,
            })
            .unwrap();
        store
            .enqueue(TaskDefinition::activity(run_id, "echo-1", invocation))
            .await
            .unwrap();
        assert_eq!(pool.run_once().await.unwrap(), Some(DispatchOutcome::Acked));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// Wraps the in-memory store and fails chosen calls with a database error
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryWorkflowStore,
        failing_reads: AtomicBool,
        reads: AtomicU32,
        failing_completions: AtomicU32,
    }

    #[async_trait::async_trait]
    impl HistoryStore for FlakyStore {
        async fn append(&self, run_id: Uuid, expected: u64, events: Vec<WorkflowEvent>) -> Result<u64, StoreError> {
            self.inner.append(run_id, expected, events).await
        }

        async fn read(&self, run_id: Uuid) -> Result<Vec<crate::workflow::HistoryEvent>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.failing_reads.load(Ordering::SeqCst) {
                return Err(StoreError::Database("connection reset".to_string()));
            }
            self.inner.read(run_id).await
        }

        async fn purge_closed_runs(&self, closed_before: chrono::DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
            self.inner.purge_closed_runs(closed_before).await
        }
    }

    #[async_trait::async_trait]
    impl TaskQueue for FlakyStore {
        async fn enqueue(&self, task: TaskDefinition) -> Result<Uuid, StoreError> {
            self.inner.enqueue(task).await
        }

        async fn poll(&self, queue_name: &str, lease: Duration) -> Result<Option<LeasedTask>, StoreError> {
            self.inner.poll(queue_name, lease).await
        }

        async fn ack(&self, lease: &LeasedTask) -> Result<(), StoreError> {
            self.inner.ack(lease).await
        }

        async fn nack(&self, lease: &LeasedTask) -> Result<(), StoreError> {
            self.inner.nack(lease).await
        }

        async fn reclaim_expired_leases(&self) -> Result<Vec<Uuid>, StoreError> {
            self.inner.reclaim_expired_leases().await
        }
    }

    #[async_trait::async_trait]
    impl WorkflowStore for FlakyStore {
        async fn commit(
            &self,
            run_id: Uuid,
            expected: u64,
            events: Vec<WorkflowEvent>,
            tasks: Vec<TaskDefinition>,
        ) -> Result<u64, StoreError> {
            let completes = events
                .iter()
                .any(|e| matches!(e, WorkflowEvent::ActivityCompleted { .. }));
            if completes
                && self
                    .failing_completions
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(StoreError::Database("connection reset".to_string()));
            }
            self.inner.commit(run_id, expected, events, tasks).await
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_report_is_retried_without_rerunning_activity() {
        let store = Arc::new(FlakyStore::default());
        store.failing_completions.store(1, Ordering::SeqCst);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let pool = WorkerPool::builder(store.clone())
            .workflow::<Echo>()
            .activity_fn("echo", move |_ctx, input| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(input)
                }
            })
            .build();

        let run_id = pool.executor().start::<Echo>("once".into()).await.unwrap();
        pool.run_until_idle(10).await.unwrap();

        let info = pool.executor().describe(run_id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Completed);
        assert_eq!(info.result, Some(json!("once")));
        assert_eq!(store.failing_completions.load(Ordering::SeqCst), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_store_failures_abandon_task_after_retry_ceiling() {
        let store = Arc::new(FlakyStore::default());
        let pool = WorkerPool::builder(store.clone())
            .workflow::<Echo>()
            .activity_fn("echo", |_ctx, input| async move { Ok(input) })
            .config(
                WorkerPoolConfig::default()
                    .with_max_dispatch_retries(2)
                    .with_lease_duration(Duration::from_millis(100)),
            )
            .build();

        let run_id = pool.executor().start::<Echo>("later".into()).await.unwrap();
        store.failing_reads.store(true, Ordering::SeqCst);

        assert_eq!(pool.run_once().await.unwrap(), Some(DispatchOutcome::Abandoned));
        assert_eq!(store.reads.load(Ordering::SeqCst), 3);

        // Still leased: nothing visible until the lease runs out
        assert_eq!(pool.run_once().await.unwrap(), None);
        store.failing_reads.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;

        let redelivered = store.inner.poll("default", LEASE).await.unwrap().unwrap();
        assert_eq!(redelivered.run_id, run_id);
        assert_eq!(redelivered.delivery_count, 2);
        store.inner.nack(&redelivered).await.unwrap();

        pool.run_until_idle(10).await.unwrap();
        let info = pool.executor().describe(run_id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_ack_after_lost_lease_leaves_task_to_new_holder() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let pool = pool(store.clone());
        let run_id = pool.executor().start::<Echo>("hi".into()).await.unwrap();

        let stale = store
            .poll("default", Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let current = store.poll("default", LEASE).await.unwrap().unwrap();
        assert_eq!(current.run_id, run_id);

        assert_eq!(pool.dispatcher.ack(&stale).await, DispatchOutcome::Abandoned);
        assert_eq!(store.task_count(), 1);
        assert_eq!(pool.dispatcher.ack(&current).await, DispatchOutcome::Acked);
        assert_eq!(store.task_count(), 0);
    }
}
