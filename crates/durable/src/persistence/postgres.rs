//! PostgreSQL implementation of WorkflowStore
//!
//! - Optimistic concurrency via the `last_sequence` column of the locked run row
//! - Task leasing with `FOR UPDATE SKIP LOCKED`
//! - Events and follow-up tasks written in one transaction

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::store::*;
use crate::workflow::{HistoryEvent, WorkflowEvent};

/// PostgreSQL implementation of [`WorkflowStore`]
///
/// # Example
///
/// ```ignore
/// use waypoint_durable::PostgresWorkflowStore;
///
/// let store = PostgresWorkflowStore::connect("postgres://localhost/waypoint", 10).await?;
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| {
                error!("Failed to connect to database: {}", e);
                StoreError::Database(e.to_string())
            })?;

        Ok(Self::new(pool))
    }

    /// Create or upgrade the schema
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })?;

        info!("database schema up to date");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Why an ack or nack touched no row
    async fn unsettled(&self, lease: &LeasedTask) -> Result<StoreError, StoreError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM waypoint_tasks WHERE task_id = $1)")
            .bind(lease.task_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("look up task"))?;

        Ok(if exists {
            StoreError::LeaseLost(lease.task_id)
        } else {
            StoreError::TaskNotFound(lease.task_id)
        })
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool.begin().await.map_err(db_error("begin transaction"))
    }

    /// Append inside `tx`, locking the run row for the rest of the transaction
    async fn append_in(
        tx: &mut Transaction<'static, Postgres>,
        run_id: Uuid,
        expected_sequence: u64,
        events: &[WorkflowEvent],
    ) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT last_sequence, closed_at IS NOT NULL AS closed
            FROM waypoint_runs
            WHERE run_id = $1
            FOR UPDATE
            "#,
        )
        .bind(run_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_error("lock run"))?;

        let last = row.map(|r| (r.get::<i64, _>("last_sequence") as u64, r.get::<bool, _>("closed")));
        check_append(run_id, last, expected_sequence, events)?;

        if last.is_none() {
            let workflow_type = match events.first() {
                Some(WorkflowEvent::RunStarted { workflow_type, .. }) => workflow_type.as_str(),
                _ => "",
            };

            let inserted = sqlx::query(
                r#"
                INSERT INTO waypoint_runs (run_id, workflow_type)
                VALUES ($1, $2)
                ON CONFLICT (run_id) DO NOTHING
                "#,
            )
            .bind(run_id)
            .bind(workflow_type)
            .execute(&mut **tx)
            .await
            .map_err(db_error("create run"))?;

            // Another writer created the run between our lookup and insert
            if inserted.rows_affected() == 0 {
                let actual: i64 = sqlx::query_scalar("SELECT last_sequence FROM waypoint_runs WHERE run_id = $1")
                    .bind(run_id)
                    .fetch_one(&mut **tx)
                    .await
                    .map_err(db_error("read run"))?;
                return Err(StoreError::Conflict {
                    run_id,
                    expected: expected_sequence,
                    actual: actual.max(1) as u64,
                });
            }
        }

        let mut sequence_no = expected_sequence;
        let mut closes = false;
        for event in events {
            sequence_no += 1;
            closes |= event.is_terminal();

            let event_data =
                serde_json::to_value(event).map_err(|e| StoreError::Serialization(e.to_string()))?;

            sqlx::query(
                r#"
                INSERT INTO waypoint_history (run_id, sequence_no, event_type, event_data)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(run_id)
            .bind(sequence_no as i64)
            .bind(event.kind())
            .bind(&event_data)
            .execute(&mut **tx)
            .await
            .map_err(db_error("insert event"))?;
        }

        sqlx::query(
            r#"
            UPDATE waypoint_runs
            SET last_sequence = $2,
                closed_at = CASE WHEN $3 THEN NOW() ELSE closed_at END
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .bind(sequence_no as i64)
        .bind(closes)
        .execute(&mut **tx)
        .await
        .map_err(db_error("update run"))?;

        Ok(sequence_no)
    }

    async fn insert_task<'e, E>(executor: E, task: &TaskDefinition) -> Result<Uuid, StoreError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let task_id = Uuid::now_v7();
        let payload = serde_json::to_value(&task.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO waypoint_tasks (task_id, queue_name, kind, run_id, payload, visible_at)
            VALUES ($1, $2, $3, $4, $5, COALESCE($6, NOW()))
            "#,
        )
        .bind(task_id)
        .bind(&task.queue_name)
        .bind(task.payload.kind().as_str())
        .bind(task.run_id)
        .bind(&payload)
        .bind(task.visible_at)
        .execute(executor)
        .await
        .map_err(db_error("enqueue task"))?;

        Ok(task_id)
    }
}

fn db_error(context: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| {
        error!("Failed to {}: {}", context, e);
        StoreError::Database(e.to_string())
    }
}

#[async_trait]
impl HistoryStore for PostgresWorkflowStore {
    #[instrument(skip(self, events))]
    async fn append(
        &self,
        run_id: Uuid,
        expected_sequence: u64,
        events: Vec<WorkflowEvent>,
    ) -> Result<u64, StoreError> {
        let mut tx = self.begin().await?;
        let last = Self::append_in(&mut tx, run_id, expected_sequence, &events).await?;
        tx.commit().await.map_err(db_error("commit append"))?;

        debug!(%run_id, last, "appended events");
        Ok(last)
    }

    #[instrument(skip(self))]
    async fn read(&self, run_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence_no, event_data, recorded_at
            FROM waypoint_history
            WHERE run_id = $1
            ORDER BY sequence_no
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("load history"))?;

        if rows.is_empty() {
            return Err(StoreError::RunNotFound(run_id));
        }

        let mut history = Vec::with_capacity(rows.len());
        for row in rows {
            let data: serde_json::Value = row.get("event_data");
            let event: WorkflowEvent =
                serde_json::from_value(data).map_err(|e| StoreError::Serialization(e.to_string()))?;
            history.push(HistoryEvent {
                sequence_no: row.get::<i64, _>("sequence_no") as u64,
                recorded_at: row.get("recorded_at"),
                event,
            });
        }

        Ok(history)
    }

    #[instrument(skip(self))]
    async fn purge_closed_runs(&self, closed_before: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let mut tx = self.begin().await?;

        let purged: Vec<Uuid> = sqlx::query_scalar(
            r#"
            DELETE FROM waypoint_runs
            WHERE closed_at IS NOT NULL AND closed_at < $1
            RETURNING run_id
            "#,
        )
        .bind(closed_before)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error("purge runs"))?;

        if !purged.is_empty() {
            sqlx::query("DELETE FROM waypoint_tasks WHERE run_id = ANY($1)")
                .bind(&purged)
                .execute(&mut *tx)
                .await
                .map_err(db_error("purge tasks"))?;
        }

        tx.commit().await.map_err(db_error("commit purge"))?;

        if !purged.is_empty() {
            info!(count = purged.len(), "purged closed runs");
        }
        Ok(purged)
    }
}

#[async_trait]
impl TaskQueue for PostgresWorkflowStore {
    #[instrument(skip(self, task), fields(queue = %task.queue_name, kind = %task.payload.kind()))]
    async fn enqueue(&self, task: TaskDefinition) -> Result<Uuid, StoreError> {
        let task_id = Self::insert_task(&self.pool, &task).await?;
        debug!(%task_id, run_id = %task.run_id, "enqueued task");
        Ok(task_id)
    }

    #[instrument(skip(self))]
    async fn poll(&self, queue_name: &str, lease_duration: Duration) -> Result<Option<LeasedTask>, StoreError> {
        // SKIP LOCKED lets concurrent pollers pass over each other's candidate
        // rows; the lease set in the same statement hides the task afterwards.
        let row = sqlx::query(
            r#"
            WITH next AS (
                SELECT task_id
                FROM waypoint_tasks
                WHERE queue_name = $1
                  AND visible_at <= NOW()
                  AND (lease_deadline IS NULL OR lease_deadline <= NOW())
                ORDER BY visible_at, enqueued_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE waypoint_tasks t
            SET lease_deadline = NOW() + INTERVAL '1 millisecond' * $2::float8,
                delivery_count = t.delivery_count + 1
            FROM next
            WHERE t.task_id = next.task_id
            RETURNING t.task_id, t.queue_name, t.run_id, t.payload, t.lease_deadline, t.delivery_count
            "#,
        )
        .bind(queue_name)
        .bind(lease_duration.as_secs_f64() * 1000.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("poll task"))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payload: serde_json::Value = row.get("payload");
        let task = LeasedTask {
            task_id: row.get("task_id"),
            queue_name: row.get("queue_name"),
            run_id: row.get("run_id"),
            payload: serde_json::from_value(payload)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            lease_deadline: row.get("lease_deadline"),
            delivery_count: row.get::<i32, _>("delivery_count") as u32,
        };

        debug!(task_id = %task.task_id, delivery_count = task.delivery_count, "leased task");
        Ok(Some(task))
    }

    #[instrument(skip(self, lease), fields(task_id = %lease.task_id))]
    async fn ack(&self, lease: &LeasedTask) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM waypoint_tasks WHERE task_id = $1 AND delivery_count = $2")
            .bind(lease.task_id)
            .bind(lease.delivery_count as i32)
            .execute(&self.pool)
            .await
            .map_err(db_error("ack task"))?;

        if result.rows_affected() == 0 {
            return Err(self.unsettled(lease).await?);
        }
        Ok(())
    }

    #[instrument(skip(self, lease), fields(task_id = %lease.task_id))]
    async fn nack(&self, lease: &LeasedTask) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE waypoint_tasks SET lease_deadline = NULL WHERE task_id = $1 AND delivery_count = $2",
        )
        .bind(lease.task_id)
        .bind(lease.delivery_count as i32)
        .execute(&self.pool)
        .await
        .map_err(db_error("nack task"))?;

        if result.rows_affected() == 0 {
            return Err(self.unsettled(lease).await?);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reclaim_expired_leases(&self) -> Result<Vec<Uuid>, StoreError> {
        let reclaimed: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE waypoint_tasks
            SET lease_deadline = NULL
            WHERE lease_deadline IS NOT NULL AND lease_deadline <= NOW()
            RETURNING task_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("reclaim leases"))?;

        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "reclaimed expired leases");
        }
        Ok(reclaimed)
    }
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    #[instrument(skip(self, events, tasks), fields(events = events.len(), tasks = tasks.len()))]
    async fn commit(
        &self,
        run_id: Uuid,
        expected_sequence: u64,
        events: Vec<WorkflowEvent>,
        tasks: Vec<TaskDefinition>,
    ) -> Result<u64, StoreError> {
        let mut tx = self.begin().await?;
        let last = Self::append_in(&mut tx, run_id, expected_sequence, &events).await?;
        for task in &tasks {
            Self::insert_task(&mut *tx, task).await?;
        }
        tx.commit().await.map_err(db_error("commit"))?;

        debug!(%run_id, last, "committed events and tasks");
        Ok(last)
    }
}
