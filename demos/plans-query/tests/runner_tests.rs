//! The `plans_query` projection driven by the runner over in-memory backends.
//!
//! These cover ordering, exactly-once application, crash resumption and the
//! operator controls (rebuild, retry, skip).

#![allow(clippy::expect_used)] // Test code uses expect for clear failure messages
#![allow(clippy::unwrap_used)]

mod common;

use common::{InMemoryPlanTable, plan_created};
use plans_query::{NAME, PLAN_CREATED, PlanTable, PlansQuery};
use projector_core::{CheckpointStore, Event, EventSource, ProjectionError, ProjectionStatus};
use projector_projections::{ProjectionRunner, RetryPolicy, RunnerConfig, RunnerHandle};
use projector_testing::{InMemoryCheckpointStore, InMemoryEventLog, init_tracing};
use std::sync::Arc;
use std::time::Duration;

fn config() -> RunnerConfig {
    RunnerConfig::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_replay_batch_size(2)
        .with_retry(
            RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(1))
                .max_delay(Duration::from_millis(5))
                .build(),
        )
}

async fn start(
    log: &Arc<InMemoryEventLog>,
    store: &Arc<InMemoryCheckpointStore>,
    table: &InMemoryPlanTable,
) -> RunnerHandle<InMemoryCheckpointStore> {
    let mut runner = ProjectionRunner::new(
        Arc::clone(log) as Arc<dyn EventSource>,
        Arc::clone(store),
        config(),
    )
    .unwrap();
    runner
        .register(Arc::new(PlansQuery::new(table.clone())))
        .unwrap();
    runner.start().await
}

fn append_plan(log: &InMemoryEventLog, id: &str, quantum: i32) -> u64 {
    log.append_event(id, &plan_created(&["BTC"], quantum, 0.1, 30))
        .unwrap()
}

async fn caught_up(handle: &RunnerHandle<InMemoryCheckpointStore>, sequence: u64) -> u64 {
    tokio::time::timeout(
        Duration::from_secs(5),
        handle.wait_until_caught_up(NAME, sequence),
    )
    .await
    .expect("projection did not catch up within 5s")
    .unwrap()
}

#[tokio::test]
async fn catches_up_on_start_and_follows_new_events() {
    init_tracing();
    let log = Arc::new(InMemoryEventLog::new());
    let store = Arc::new(InMemoryCheckpointStore::new());
    let table = InMemoryPlanTable::new();
    for i in 0..5 {
        append_plan(&log, &format!("p{i}"), i);
    }

    let handle = start(&log, &store, &table).await;
    assert_eq!(caught_up(&handle, 5).await, 5);

    append_plan(&log, "p5", 5);
    assert_eq!(caught_up(&handle, 6).await, 6);

    assert_eq!(table.ids().len(), 6);
    assert_eq!(table.committed_inserts(), 6);
    assert_eq!(store.get(NAME).await.unwrap(), 6);
    handle.shutdown().await;
}

#[tokio::test]
async fn waits_at_a_gap_until_the_missing_event_commits() {
    init_tracing();
    let log = Arc::new(InMemoryEventLog::new());
    let store = Arc::new(InMemoryCheckpointStore::new());
    let table = InMemoryPlanTable::new();

    let payload = plan_created(&["ETH"], 1, 0.0, 7).to_bytes().unwrap();
    log.insert_at(1, "p1", PLAN_CREATED, payload.clone());
    log.insert_at(3, "p3", PLAN_CREATED, payload.clone());

    let handle = start(&log, &store, &table).await;
    handle
        .wait_for(NAME, |s| matches!(s, ProjectionStatus::Behind { checkpoint: 1, .. }))
        .await
        .unwrap();

    // Sequence 3 is visible but 2 is not: nothing past 1 may be applied.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.get(NAME).await.unwrap(), 1);
    assert_eq!(table.ids(), vec!["p1".to_string()]);

    log.insert_at(2, "p2", PLAN_CREATED, payload);
    assert_eq!(caught_up(&handle, 3).await, 3);
    assert_eq!(
        table.ids(),
        vec!["p1".to_string(), "p2".to_string(), "p3".to_string()]
    );
    handle.shutdown().await;
}

#[tokio::test]
async fn competing_runners_apply_each_event_once() {
    init_tracing();
    let log = Arc::new(InMemoryEventLog::new());
    let store = Arc::new(InMemoryCheckpointStore::new());
    let table = InMemoryPlanTable::new();
    for i in 0..20 {
        append_plan(&log, &format!("p{i:02}"), i);
    }

    let first = start(&log, &store, &table).await;
    let second = start(&log, &store, &table).await;

    caught_up(&first, 20).await;
    caught_up(&second, 20).await;

    assert_eq!(table.committed_inserts(), 20);
    assert_eq!(table.ids().len(), 20);
    assert_eq!(store.get(NAME).await.unwrap(), 20);

    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn restart_resumes_after_the_last_committed_event() {
    init_tracing();
    let log = Arc::new(InMemoryEventLog::new());
    let store = Arc::new(InMemoryCheckpointStore::new());
    let table = InMemoryPlanTable::new();
    append_plan(&log, "p1", 1);
    append_plan(&log, "p2", 2);

    let handle = start(&log, &store, &table).await;
    caught_up(&handle, 2).await;
    handle.shutdown().await;

    append_plan(&log, "p3", 3);
    append_plan(&log, "p4", 4);

    let handle = start(&log, &store, &table).await;
    assert_eq!(caught_up(&handle, 4).await, 4);
    assert_eq!(table.committed_inserts(), 4);
    handle.shutdown().await;
}

#[tokio::test]
async fn transient_commit_failures_are_retried_without_duplicates() {
    init_tracing();
    let log = Arc::new(InMemoryEventLog::new());
    let store = Arc::new(InMemoryCheckpointStore::new());
    let table = InMemoryPlanTable::new();
    append_plan(&log, "p1", 1);
    append_plan(&log, "p2", 2);
    store.fail_next_commits(2);

    let handle = start(&log, &store, &table).await;
    assert_eq!(caught_up(&handle, 2).await, 2);
    assert_eq!(table.committed_inserts(), 2);
    handle.shutdown().await;
}

#[tokio::test]
async fn malformed_event_halts_until_skipped() {
    init_tracing();
    let log = Arc::new(InMemoryEventLog::new());
    let store = Arc::new(InMemoryCheckpointStore::new());
    let table = InMemoryPlanTable::new();
    append_plan(&log, "p1", 1);
    log.append("p2", PLAN_CREATED, vec![0xba, 0xd0]);
    append_plan(&log, "p3", 3);

    let handle = start(&log, &store, &table).await;
    let error = handle.wait_until_caught_up(NAME, 3).await.unwrap_err();
    assert!(
        matches!(error, ProjectionError::Apply { sequence: 2, .. }),
        "got {error:?}"
    );
    assert!(matches!(
        handle.status(NAME).unwrap(),
        ProjectionStatus::Halted { checkpoint: 1, failed_sequence: 2, .. }
    ));

    // Halted projections do not move on their own.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.get(NAME).await.unwrap(), 1);

    assert_eq!(handle.skip(NAME).await.unwrap(), 2);
    assert_eq!(caught_up(&handle, 3).await, 3);
    assert_eq!(table.ids(), vec!["p1".to_string(), "p3".to_string()]);
    handle.shutdown().await;
}

#[tokio::test]
async fn retry_applies_the_failed_event_once_fixed() {
    init_tracing();
    let log = Arc::new(InMemoryEventLog::new());
    let store = Arc::new(InMemoryCheckpointStore::new());
    let table = InMemoryPlanTable::new();
    table.reject(Some("p2"));
    append_plan(&log, "p1", 1);
    append_plan(&log, "p2", 2);

    let handle = start(&log, &store, &table).await;
    assert!(matches!(
        handle.wait_until_caught_up(NAME, 2).await,
        Err(ProjectionError::Apply { sequence: 2, .. })
    ));

    // Still rejected: the retry halts again on the same event.
    handle.retry(NAME).await.unwrap();
    handle
        .wait_for(NAME, ProjectionStatus::is_halted)
        .await
        .unwrap();

    table.reject(None);
    handle.retry(NAME).await.unwrap();
    assert_eq!(caught_up(&handle, 2).await, 2);
    assert_eq!(table.ids(), vec!["p1".to_string(), "p2".to_string()]);
    handle.shutdown().await;
}

#[tokio::test]
async fn skip_and_retry_require_a_halted_projection() {
    init_tracing();
    let log = Arc::new(InMemoryEventLog::new());
    let store = Arc::new(InMemoryCheckpointStore::new());
    let table = InMemoryPlanTable::new();
    append_plan(&log, "p1", 1);

    let handle = start(&log, &store, &table).await;
    caught_up(&handle, 1).await;

    assert!(matches!(
        handle.skip(NAME).await,
        Err(ProjectionError::NotHalted(_))
    ));
    assert!(matches!(
        handle.retry(NAME).await,
        Err(ProjectionError::NotHalted(_))
    ));
    assert_eq!(store.get(NAME).await.unwrap(), 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn rebuild_discards_stray_rows_and_replays_the_log() {
    init_tracing();
    let log = Arc::new(InMemoryEventLog::new());
    let store = Arc::new(InMemoryCheckpointStore::new());
    let table = InMemoryPlanTable::new();
    for i in 0..4 {
        append_plan(&log, &format!("p{i}"), i);
    }

    let handle = start(&log, &store, &table).await;
    caught_up(&handle, 4).await;

    let mut stray = plans_query::Plan::from_created("ghost", plan_created(&[], 0, 0.0, 0));
    stray.strategy = "hand-edited".to_string();
    table.put_directly(stray);
    assert_eq!(table.ids().len(), 5);

    handle.rebuild(NAME).await.unwrap();
    assert_eq!(caught_up(&handle, 4).await, 4);

    assert_eq!(
        table.ids(),
        vec![
            "p0".to_string(),
            "p1".to_string(),
            "p2".to_string(),
            "p3".to_string()
        ]
    );
    assert_eq!(table.committed_inserts(), 8);
    handle.shutdown().await;
}

#[tokio::test]
async fn interrupted_rebuild_resumes_where_it_stopped() {
    init_tracing();
    let log = Arc::new(InMemoryEventLog::new());
    let store = Arc::new(InMemoryCheckpointStore::new());
    let table = InMemoryPlanTable::new();
    for i in 0..6 {
        append_plan(&log, &format!("p{i}"), i);
    }

    let handle = start(&log, &store, &table).await;
    caught_up(&handle, 6).await;

    // The rebuild stops on p3 (sequence 4) and the runner goes down there.
    table.reject(Some("p3"));
    handle.rebuild(NAME).await.unwrap();
    handle
        .wait_for(NAME, ProjectionStatus::is_halted)
        .await
        .unwrap();
    handle.shutdown().await;

    assert_eq!(store.get(NAME).await.unwrap(), 3);
    assert_eq!(
        table.ids(),
        vec!["p0".to_string(), "p1".to_string(), "p2".to_string()]
    );

    table.reject(None);
    let handle = start(&log, &store, &table).await;
    assert_eq!(caught_up(&handle, 6).await, 6);
    handle.shutdown().await;

    // 6 on the first pass, then 6 for the rebuild across both runs.
    assert_eq!(table.committed_inserts(), 12);

    let fresh = InMemoryPlanTable::new();
    let handle = start(&log, &Arc::new(InMemoryCheckpointStore::new()), &fresh).await;
    caught_up(&handle, 6).await;
    handle.shutdown().await;
    assert_eq!(table.all().await.unwrap(), fresh.all().await.unwrap());
}

#[tokio::test]
async fn failed_initialization_reports_and_does_not_advance() {
    init_tracing();
    let log = Arc::new(InMemoryEventLog::new());
    let store = Arc::new(InMemoryCheckpointStore::new());
    append_plan(&log, "p1", 1);

    let handle = start(&log, &store, &InMemoryPlanTable::broken()).await;

    assert!(matches!(
        handle.status(NAME).unwrap(),
        ProjectionStatus::Failed { .. }
    ));
    assert!(matches!(
        handle.wait_until_caught_up(NAME, 1).await,
        Err(ProjectionError::Initialization { .. })
    ));
    assert!(matches!(
        handle.rebuild(NAME).await,
        Err(ProjectionError::Initialization { .. })
    ));
    assert_eq!(store.get(NAME).await.unwrap(), 0);
    handle.shutdown().await;
}

#[tokio::test]
async fn checkpoint_report_shows_lag_while_halted() {
    init_tracing();
    let log = Arc::new(InMemoryEventLog::new());
    let store = Arc::new(InMemoryCheckpointStore::new());
    let table = InMemoryPlanTable::new();
    log.append("p1", PLAN_CREATED, Vec::new());
    append_plan(&log, "p2", 2);
    append_plan(&log, "p3", 3);

    let handle = start(&log, &store, &table).await;
    handle
        .wait_for(NAME, ProjectionStatus::is_halted)
        .await
        .unwrap();

    let reports = handle.checkpoints().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].checkpoint.projection_name, NAME);
    assert_eq!(reports[0].checkpoint.last_applied_sequence, 0);
    assert_eq!(reports[0].head, 3);
    assert_eq!(reports[0].lag, 3);
    assert_eq!(handle.lag(NAME).await.unwrap(), 3);
    handle.shutdown().await;
}
