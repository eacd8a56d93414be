//! In-memory workflow store for tests and demos

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::workflow::{HistoryEvent, WorkflowEvent};

struct RunState {
    history: Vec<HistoryEvent>,
    closed_at: Option<DateTime<Utc>>,
}

impl RunState {
    fn last(&self) -> (u64, bool) {
        let sequence = self.history.last().map_or(0, |e| e.sequence_no);
        (sequence, self.closed_at.is_some())
    }
}

struct TaskState {
    definition: TaskDefinition,
    enqueued_at: DateTime<Utc>,

    /// Tie-breaker for tasks enqueued within the same clock tick
    order: u64,

    lease_deadline: Option<DateTime<Utc>>,
    delivery_count: u32,
}

impl TaskState {
    fn visible_from(&self) -> DateTime<Utc> {
        self.definition.visible_at.unwrap_or(self.enqueued_at)
    }

    fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.visible_from() <= now && self.lease_deadline.map_or(true, |deadline| deadline <= now)
    }
}

/// In-memory implementation of [`WorkflowStore`]
///
/// Same semantics as the PostgreSQL store within a single process. Expired
/// leases are honoured lazily by `poll`, so redelivery works without a
/// maintenance loop.
///
/// # Example
///
/// ```
/// use waypoint_durable::InMemoryWorkflowStore;
///
/// let store = InMemoryWorkflowStore::new();
/// assert_eq!(store.run_count(), 0);
/// ```
pub struct InMemoryWorkflowStore {
    // Lock order: runs before tasks
    runs: RwLock<HashMap<Uuid, RunState>>,
    tasks: RwLock<HashMap<Uuid, TaskState>>,
    next_order: AtomicU64,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            next_order: AtomicU64::new(0),
        }
    }

    pub fn run_count(&self) -> usize {
        self.runs.read().len()
    }

    /// Tasks in the store, leased or not
    pub fn task_count(&self) -> usize {
        self.tasks.read().len()
    }

    /// Tasks a poller could lease right now
    pub fn pending_task_count(&self) -> usize {
        let now = Utc::now();
        self.tasks
            .read()
            .values()
            .filter(|t| t.is_available(now))
            .count()
    }

    /// Tasks currently held under a live lease
    pub fn leased_task_count(&self) -> usize {
        let now = Utc::now();
        self.tasks
            .read()
            .values()
            .filter(|t| t.lease_deadline.is_some_and(|deadline| deadline > now))
            .count()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut runs = self.runs.write();
        let mut tasks = self.tasks.write();
        runs.clear();
        tasks.clear();
    }

    fn append_locked(
        runs: &mut HashMap<Uuid, RunState>,
        run_id: Uuid,
        expected_sequence: u64,
        events: Vec<WorkflowEvent>,
    ) -> Result<u64, StoreError> {
        check_append(
            run_id,
            runs.get(&run_id).map(RunState::last),
            expected_sequence,
            &events,
        )?;

        let run = runs.entry(run_id).or_insert_with(|| RunState {
            history: Vec::new(),
            closed_at: None,
        });

        let recorded_at = Utc::now();
        let mut sequence_no = expected_sequence;
        for event in events {
            sequence_no += 1;
            if event.is_terminal() {
                run.closed_at = Some(recorded_at);
            }
            run.history.push(HistoryEvent {
                sequence_no,
                recorded_at,
                event,
            });
        }

        Ok(sequence_no)
    }

    fn insert_task(&self, tasks: &mut HashMap<Uuid, TaskState>, definition: TaskDefinition) -> Uuid {
        let task_id = Uuid::now_v7();
        tasks.insert(
            task_id,
            TaskState {
                definition,
                enqueued_at: Utc::now(),
                order: self.next_order.fetch_add(1, Ordering::Relaxed),
                lease_deadline: None,
                delivery_count: 0,
            },
        );
        task_id
    }

    fn check_lease(tasks: &HashMap<Uuid, TaskState>, lease: &LeasedTask) -> Result<(), StoreError> {
        match tasks.get(&lease.task_id) {
            None => Err(StoreError::TaskNotFound(lease.task_id)),
            Some(task) if task.delivery_count != lease.delivery_count => {
                Err(StoreError::LeaseLost(lease.task_id))
            }
            Some(_) => Ok(()),
        }
    }
}

impl Default for InMemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lease_deadline(now: DateTime<Utc>, lease_duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease_duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl HistoryStore for InMemoryWorkflowStore {
    async fn append(
        &self,
        run_id: Uuid,
        expected_sequence: u64,
        events: Vec<WorkflowEvent>,
    ) -> Result<u64, StoreError> {
        let mut runs = self.runs.write();
        Self::append_locked(&mut runs, run_id, expected_sequence, events)
    }

    async fn read(&self, run_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError> {
        self.runs
            .read()
            .get(&run_id)
            .map(|run| run.history.clone())
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn purge_closed_runs(&self, closed_before: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let mut runs = self.runs.write();
        let mut tasks = self.tasks.write();

        let purged: HashSet<Uuid> = runs
            .iter()
            .filter(|(_, run)| run.closed_at.is_some_and(|at| at < closed_before))
            .map(|(id, _)| *id)
            .collect();

        runs.retain(|id, _| !purged.contains(id));
        tasks.retain(|_, task| !purged.contains(&task.definition.run_id));

        Ok(purged.into_iter().collect())
    }
}

#[async_trait]
impl TaskQueue for InMemoryWorkflowStore {
    async fn enqueue(&self, task: TaskDefinition) -> Result<Uuid, StoreError> {
        let mut tasks = self.tasks.write();
        Ok(self.insert_task(&mut tasks, task))
    }

    async fn poll(&self, queue_name: &str, lease_duration: Duration) -> Result<Option<LeasedTask>, StoreError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write();

        let next = tasks
            .iter()
            .filter(|(_, t)| t.definition.queue_name == queue_name && t.is_available(now))
            .min_by_key(|(_, t)| (t.visible_from(), t.order))
            .map(|(id, _)| *id);

        let Some(task_id) = next else {
            return Ok(None);
        };
        let Some(task) = tasks.get_mut(&task_id) else {
            return Ok(None);
        };

        let deadline = lease_deadline(now, lease_duration);
        task.lease_deadline = Some(deadline);
        task.delivery_count += 1;

        Ok(Some(LeasedTask {
            task_id,
            queue_name: task.definition.queue_name.clone(),
            run_id: task.definition.run_id,
            payload: task.definition.payload.clone(),
            lease_deadline: deadline,
            delivery_count: task.delivery_count,
        }))
    }

    async fn ack(&self, lease: &LeasedTask) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        Self::check_lease(&tasks, lease)?;
        tasks.remove(&lease.task_id);
        Ok(())
    }

    async fn nack(&self, lease: &LeasedTask) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        Self::check_lease(&tasks, lease)?;
        if let Some(task) = tasks.get_mut(&lease.task_id) {
            task.lease_deadline = None;
        }
        Ok(())
    }

    async fn reclaim_expired_leases(&self) -> Result<Vec<Uuid>, StoreError> {
        let now = Utc::now();
        let mut reclaimed = Vec::new();

        for (task_id, task) in self.tasks.write().iter_mut() {
            if task.lease_deadline.is_some_and(|deadline| deadline <= now) {
                task.lease_deadline = None;
                reclaimed.push(*task_id);
            }
        }

        Ok(reclaimed)
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn commit(
        &self,
        run_id: Uuid,
        expected_sequence: u64,
        events: Vec<WorkflowEvent>,
        tasks: Vec<TaskDefinition>,
    ) -> Result<u64, StoreError> {
        let mut runs = self.runs.write();
        let mut queued = self.tasks.write();

        let last = Self::append_locked(&mut runs, run_id, expected_sequence, events)?;
        for task in tasks {
            self.insert_task(&mut queued, task);
        }

        Ok(last)
    }
}
