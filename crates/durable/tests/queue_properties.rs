//! Task queue and history store properties under concurrency and crashes
//!
//! Run with: cargo test -p waypoint-durable --test queue_properties

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::{json, Value};
use uuid::Uuid;

use waypoint_durable::persistence::{LeasedTask, TaskPayload};
use waypoint_durable::prelude::*;

const SHORT_LEASE: Duration = Duration::from_millis(100);

struct ProcessOnce {
    message: String,
}

impl Workflow for ProcessOnce {
    const TYPE: &'static str = "ProcessOnce";
    type Input = String;
    type Output = Value;

    fn new(message: String) -> Self {
        Self { message }
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        vec![WorkflowAction::schedule_activity(
            "process-1",
            "process",
            json!(self.message),
        )]
    }

    fn on_activity_completed(&mut self, _activity_id: &str, result: Value) -> Vec<WorkflowAction> {
        vec![WorkflowAction::complete(result)]
    }
}

fn counting_pool(store: Arc<InMemoryWorkflowStore>, executions: Arc<AtomicU32>) -> WorkerPool {
    WorkerPool::builder(store)
        .workflow::<ProcessOnce>()
        .activity_fn("process", move |_ctx, input| {
            let executions = executions.clone();
            async move {
                executions.fetch_add(1, Ordering::SeqCst);
                Ok(json!(format!("done: {}", input.as_str().unwrap_or_default())))
            }
        })
        .build()
}

fn started(queue: &str) -> WorkflowEvent {
    WorkflowEvent::RunStarted {
        workflow_type: "Any".to_string(),
        task_queue: queue.to_string(),
        input: json!(null),
    }
}

async fn lease_expired_then(store: &InMemoryWorkflowStore) -> LeasedTask {
    tokio::time::sleep(SHORT_LEASE * 2).await;
    store
        .poll("default", Duration::from_secs(30))
        .await
        .unwrap()
        .expect("expired lease should be redelivered")
}

// ============================================
// Single winner among concurrent pollers
// ============================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pollers_single_winner() {
    for _ in 0..20 {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let task_id = store
            .enqueue(TaskDefinition::decision("default", Uuid::now_v7()))
            .await
            .unwrap();

        let polls = (0..8).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.poll("default", Duration::from_secs(30)).await })
        });
        let winners: Vec<LeasedTask> = join_all(polls)
            .await
            .into_iter()
            .filter_map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].task_id, task_id);
        assert_eq!(winners[0].delivery_count, 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pollers_each_task_delivered_once() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let mut expected = HashSet::new();
    for _ in 0..50 {
        expected.insert(
            store
                .enqueue(TaskDefinition::decision("default", Uuid::now_v7()))
                .await
                .unwrap(),
        );
    }

    let pollers = (0..6).map(|_| {
        let store = store.clone();
        tokio::spawn(async move {
            let mut leased = Vec::new();
            while let Some(task) = store.poll("default", Duration::from_secs(30)).await.unwrap() {
                leased.push(task.task_id);
            }
            leased
        })
    });

    let mut seen = HashSet::new();
    for joined in join_all(pollers).await {
        for task_id in joined.unwrap() {
            assert!(seen.insert(task_id), "task {task_id} leased twice");
        }
    }
    assert_eq!(seen, expected);
}

// ============================================
// Redelivery after lease expiry
// ============================================

#[tokio::test]
async fn test_redelivery_after_crash_before_processing() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let executions = Arc::new(AtomicU32::new(0));
    let pool = counting_pool(store.clone(), executions.clone());

    let run_id = pool.executor().start::<ProcessOnce>("a".into()).await.unwrap();
    let lost = store.poll("default", SHORT_LEASE).await.unwrap().unwrap();
    assert!(store.poll("default", SHORT_LEASE).await.unwrap().is_none());

    let again = lease_expired_then(&store).await;
    assert_eq!(again.task_id, lost.task_id);
    assert_eq!(again.delivery_count, 2);
    store.nack(&again).await.unwrap();

    pool.run_until_idle(10).await.unwrap();
    let info = pool.executor().describe(run_id).await.unwrap();
    assert_eq!(info.status, WorkflowStatus::Completed);
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_redelivery_after_crash_after_decision_commit() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let executions = Arc::new(AtomicU32::new(0));
    let pool = counting_pool(store.clone(), executions.clone());

    let run_id = pool.executor().start::<ProcessOnce>("b".into()).await.unwrap();
    let task = store.poll("default", SHORT_LEASE).await.unwrap().unwrap();
    pool.executor().process_decision(task.run_id).await.unwrap();
    // Crash: no ack, the decision task comes back after the lease

    tokio::time::sleep(SHORT_LEASE * 2).await;
    pool.run_until_idle(10).await.unwrap();
    let info = pool.executor().describe(run_id).await.unwrap();
    assert_eq!(info.status, WorkflowStatus::Completed);
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    let history = pool.executor().history(run_id).await.unwrap();
    let scheduled = history
        .iter()
        .filter(|r| matches!(r.event, WorkflowEvent::ActivityScheduled { .. }))
        .count();
    assert_eq!(scheduled, 1);
}

#[tokio::test]
async fn test_redelivery_after_crash_during_activity() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let executions = Arc::new(AtomicU32::new(0));
    let pool = counting_pool(store.clone(), executions.clone());

    let run_id = pool.executor().start::<ProcessOnce>("c".into()).await.unwrap();
    pool.run_once().await.unwrap();

    // Execute but crash before reporting
    let task = store.poll("default", SHORT_LEASE).await.unwrap().unwrap();
    let TaskPayload::Activity { activity_id, invocation } = &task.payload else {
        panic!("expected an activity task");
    };
    pool.activity_executor()
        .execute(run_id, activity_id, invocation)
        .await
        .unwrap();

    let again = lease_expired_then(&store).await;
    assert_eq!(again.task_id, task.task_id);
    store.nack(&again).await.unwrap();

    pool.run_until_idle(10).await.unwrap();
    let info = pool.executor().describe(run_id).await.unwrap();
    assert_eq!(info.status, WorkflowStatus::Completed);
    assert_eq!(info.result, Some(json!("done: c")));
    // At-least-once: the crashed attempt ran, then the redelivered one
    assert_eq!(executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_redelivery_after_crash_after_report() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let executions = Arc::new(AtomicU32::new(0));
    let pool = counting_pool(store.clone(), executions.clone());

    let run_id = pool.executor().start::<ProcessOnce>("d".into()).await.unwrap();
    pool.run_once().await.unwrap();

    // Execute and report but crash before ack
    let task = store.poll("default", SHORT_LEASE).await.unwrap().unwrap();
    let TaskPayload::Activity { activity_id, invocation } = &task.payload else {
        panic!("expected an activity task");
    };
    pool.activity_executor()
        .run_task(run_id, activity_id, invocation)
        .await
        .unwrap();

    // The stale activity task comes back and is dropped without running
    tokio::time::sleep(SHORT_LEASE * 2).await;
    pool.run_until_idle(10).await.unwrap();
    assert_eq!(
        pool.executor().describe(run_id).await.unwrap().status,
        WorkflowStatus::Completed
    );

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(store.task_count(), 0);
}

#[tokio::test]
async fn test_reclaim_makes_expired_leases_visible() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let task_id = store
        .enqueue(TaskDefinition::decision("default", Uuid::now_v7()))
        .await
        .unwrap();
    store.poll("default", SHORT_LEASE).await.unwrap().unwrap();
    assert_eq!(store.pending_task_count(), 0);

    tokio::time::sleep(SHORT_LEASE * 2).await;
    assert_eq!(store.reclaim_expired_leases().await.unwrap(), vec![task_id]);
    assert_eq!(store.pending_task_count(), 1);
}

// ============================================
// History append linearizability
// ============================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_single_success() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let run_id = Uuid::now_v7();
    store.append(run_id, 0, vec![started("default")]).await.unwrap();

    let writers = (0..10).map(|i| {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .append(
                    run_id,
                    1,
                    vec![WorkflowEvent::RunCancelRequested {
                        reason: format!("writer {i}"),
                    }],
                )
                .await
        })
    });
    let results: Vec<_> = join_all(writers)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, StoreError::Conflict { expected: 1, actual: 2, .. })));

    let history = store.read(run_id).await.unwrap();
    assert_eq!(history.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_run_creation_single_success() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let run_id = Uuid::now_v7();

    let creators = (0..8).map(|_| {
        let store = store.clone();
        tokio::spawn(async move { store.append(run_id, 0, vec![started("default")]).await })
    });
    let successes = join_all(creators)
        .await
        .into_iter()
        .filter(|joined| matches!(joined, Ok(Ok(1))))
        .count();

    assert_eq!(successes, 1);
    assert_eq!(store.read(run_id).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_history_stays_contiguous_under_retrying_writers() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let run_id = Uuid::now_v7();
    store.append(run_id, 0, vec![started("default")]).await.unwrap();

    let writers = (0..8).map(|writer| {
        let store = store.clone();
        tokio::spawn(async move {
            for round in 0..5 {
                loop {
                    let last = store.read(run_id).await.unwrap().len() as u64;
                    let event = WorkflowEvent::RunCancelRequested {
                        reason: format!("{writer}-{round}"),
                    };
                    match store.append(run_id, last, vec![event]).await {
                        Ok(_) => break,
                        Err(e) if e.is_conflict() => tokio::task::yield_now().await,
                        Err(e) => panic!("unexpected store error: {e}"),
                    }
                }
            }
        })
    });
    for joined in join_all(writers).await {
        joined.unwrap();
    }

    let history = store.read(run_id).await.unwrap();
    assert_eq!(history.len(), 41);
    for (index, record) in history.iter().enumerate() {
        assert_eq!(record.sequence_no, index as u64 + 1);
    }
    let reasons: HashSet<_> = history
        .iter()
        .filter_map(|r| match &r.event {
            WorkflowEvent::RunCancelRequested { reason } => Some(reason.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(reasons.len(), 40);
}
