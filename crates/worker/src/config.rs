//! Worker settings from the environment

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use waypoint_durable::worker::WorkerPoolConfig;
use waypoint_durable::{ExecutorConfig, RetryPolicy};

/// Process settings
///
/// Every variable is optional:
/// - `DATABASE_URL`: PostgreSQL store; without it only `demo` runs
/// - `WAYPOINT_TASK_QUEUE`: queue to poll and start runs on (default: `default`)
/// - `WAYPOINT_WORKER_ID`: worker id (default: generated)
/// - `WAYPOINT_CONCURRENCY`: number of poll loops (default: 4)
/// - `WAYPOINT_LEASE_MS`: task lease (default: the 30s poll timeout)
/// - `WAYPOINT_MAX_ATTEMPTS`: attempts per activity call (default: 3)
/// - `WAYPOINT_BACKOFF_BASE_MS` / `WAYPOINT_BACKOFF_CAP_MS`: retry backoff (default: 1s / 60s)
/// - `WAYPOINT_RETENTION_HOURS`: keep closed runs this long, 0 keeps them forever (default: 168)
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub database_url: Option<String>,
    pub task_queue: String,
    pub worker_id: Option<String>,
    pub concurrency: usize,
    pub lease_duration: Option<Duration>,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub retention: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            task_queue: "default".to_string(),
            worker_id: None,
            concurrency: 4,
            lease_duration: None,
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            retention: Some(Duration::from_secs(168 * 3600)),
        }
    }
}

impl Settings {
    /// Read settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`, so tests need not touch the environment
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        Ok(Self {
            database_url: var("DATABASE_URL"),
            task_queue: var("WAYPOINT_TASK_QUEUE").unwrap_or(defaults.task_queue),
            worker_id: var("WAYPOINT_WORKER_ID"),
            concurrency: parse(&var, "WAYPOINT_CONCURRENCY")?.unwrap_or(defaults.concurrency),
            lease_duration: parse(&var, "WAYPOINT_LEASE_MS")?.map(Duration::from_millis),
            max_attempts: parse(&var, "WAYPOINT_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts),
            backoff_base: parse(&var, "WAYPOINT_BACKOFF_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_base),
            backoff_cap: parse(&var, "WAYPOINT_BACKOFF_CAP_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_cap),
            retention: match parse::<u64>(&var, "WAYPOINT_RETENTION_HOURS")? {
                Some(0) => None,
                Some(hours) => Some(Duration::from_secs(hours * 3600)),
                None => defaults.retention,
            },
        })
    }

    /// Default activity retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_backoff(self.backoff_base, self.backoff_cap, self.max_attempts)
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::default()
            .with_default_task_queue(&self.task_queue)
            .with_retry_policy(self.retry_policy())
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        let mut config = WorkerPoolConfig::new(&self.task_queue)
            .with_concurrency(self.concurrency)
            .with_retention(self.retention);
        if let Some(worker_id) = &self.worker_id {
            config = config.with_worker_id(worker_id);
        }
        if let Some(lease) = self.lease_duration {
            config = config.with_lease_duration(lease);
        }
        config
    }
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("invalid {key}: {value:?}"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = settings(&[]).unwrap();
        assert_eq!(settings, Settings::default());

        let pool = settings.pool_config();
        assert_eq!(pool.task_queue, "default");
        assert_eq!(pool.concurrency, 4);
        assert_eq!(pool.lease_duration, Duration::from_secs(30));
        assert_eq!(pool.retention, Some(Duration::from_secs(604_800)));

        let policy = settings.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(policy.max_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_all_variables() {
        let settings = settings(&[
            ("DATABASE_URL", "postgres://localhost/waypoint"),
            ("WAYPOINT_TASK_QUEUE", "python-task-queue"),
            ("WAYPOINT_WORKER_ID", "worker-a"),
            ("WAYPOINT_CONCURRENCY", "8"),
            ("WAYPOINT_LEASE_MS", "5000"),
            ("WAYPOINT_MAX_ATTEMPTS", "5"),
            ("WAYPOINT_BACKOFF_BASE_MS", "200"),
            ("WAYPOINT_BACKOFF_CAP_MS", "2000"),
            ("WAYPOINT_RETENTION_HOURS", "0"),
        ])
        .unwrap();

        assert_eq!(settings.database_url.as_deref(), Some("postgres://localhost/waypoint"));
        assert_eq!(settings.retention, None);

        let pool = settings.pool_config();
        assert_eq!(pool.worker_id, "worker-a");
        assert_eq!(pool.task_queue, "python-task-queue");
        assert_eq!(pool.concurrency, 8);
        assert_eq!(pool.lease_duration, Duration::from_millis(5000));

        let executor = settings.executor_config();
        assert_eq!(executor.default_task_queue, "python-task-queue");
        assert_eq!(executor.retry_policy.max_attempts, 5);
        assert_eq!(executor.retry_policy.initial_interval, Duration::from_millis(200));
        assert_eq!(executor.retry_policy.max_interval, Duration::from_millis(2000));
    }

    #[test]
    fn test_blank_values_are_unset() {
        let settings = settings(&[("DATABASE_URL", "  "), ("WAYPOINT_CONCURRENCY", "")]).unwrap();
        assert_eq!(settings.database_url, None);
        assert_eq!(settings.concurrency, 4);
    }

    #[test]
    fn test_invalid_number_is_an_error() {
        let err = settings(&[("WAYPOINT_CONCURRENCY", "many")]).unwrap_err();
        assert!(err.to_string().contains("WAYPOINT_CONCURRENCY"));
    }
}
