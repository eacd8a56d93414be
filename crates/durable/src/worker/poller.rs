//! Task polling with exponential backoff
//!
//! Long-polls one queue: empty polls back off from `min_interval` towards
//! `max_interval`, a leased task resets the interval.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, instrument, trace};

use crate::persistence::{LeasedTask, StoreError, WorkflowStore};

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Poll interval right after a task was found
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Poll interval ceiling when idle
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when no tasks found
    pub backoff_multiplier: f64,

    /// A long poll gives up and returns empty after this long
    #[serde(with = "duration_millis")]
    pub poll_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            poll_timeout: Duration::from_secs(30),
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }
}

/// Task poller with adaptive backoff
pub struct TaskPoller {
    store: Arc<dyn WorkflowStore>,
    queue_name: String,
    lease_duration: Duration,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskPoller {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        queue_name: impl Into<String>,
        lease_duration: Duration,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            queue_name: queue_name.into(),
            lease_duration,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Try to lease one task, updating the backoff state
    #[instrument(skip(self), fields(queue = %self.queue_name))]
    pub async fn poll_once(&mut self) -> Result<Option<LeasedTask>, PollerError> {
        if self.is_shutdown() {
            return Err(PollerError::Shutdown);
        }

        let task = self
            .store
            .poll(&self.queue_name, self.lease_duration)
            .await?;

        match &task {
            Some(task) => {
                self.reset_backoff();
                debug!(task_id = %task.task_id, kind = %task.kind(), "leased task");
            }
            None => {
                self.increase_backoff();
                trace!(
                    interval_ms = self.current_interval.as_millis() as u64,
                    "no tasks found, backing off"
                );
            }
        }

        Ok(task)
    }

    /// Long poll: wait up to `poll_timeout` for a task
    ///
    /// Returns `Ok(None)` on timeout or when shutdown is signalled while
    /// waiting.
    pub async fn next_task(&mut self) -> Result<Option<LeasedTask>, PollerError> {
        let deadline = Instant::now() + self.config.poll_timeout;

        loop {
            match self.poll_once().await {
                Ok(Some(task)) => return Ok(Some(task)),
                Ok(None) => {}
                Err(PollerError::Shutdown) => return Ok(None),
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline || self.wait().await {
                return Ok(None);
            }
        }
    }

    /// Wait for the current backoff interval
    ///
    /// Returns `true` if shutdown was signalled during the wait.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("shutdown signal received during wait");
                true
            }
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let new_interval = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = new_interval.min(self.config.max_interval);
    }
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("worker is shutting down")]
    Shutdown,
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
