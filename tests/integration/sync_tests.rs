//! Integration tests for outbox draining.
//!
//! Validates:
//! - Commands issued offline replay in issue order once connected
//! - The first failure halts the pass and leaves later commands queued
//! - A failed action blocks everything issued after it until resolved
//! - Retried actions replay ahead of newer commands
//! - Dispatch timeouts count as transient failures
//! - Only one drain pass runs at a time
//! - The background engine drains on reconnect and auto-retries transients

use std::sync::Arc;
use std::time::Duration;

use agent_lifeline::errors::{DispatchError, FailureKind};
use agent_lifeline::models::status::{ConnectionStatus, SyncStatus};
use agent_lifeline::outbox::Outbox;
use agent_lifeline::sync::connectivity::ConnectivityMonitor;
use agent_lifeline::sync::dispatcher::CommandDispatcher;
use agent_lifeline::sync::engine::{DrainOutcome, RetryPolicy, SkipReason, SyncEngine};
use agent_lifeline::AppError;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::test_helpers::{
    harness, memory_db, terminal, transient, ScriptedDispatcher, NO_SCAN,
};

/// Outbox and engine over a fresh in-memory database, connected, with
/// `backoff` as both the initial and maximum automatic retry delay.
async fn engine_fixture(
    backoff: Duration,
) -> (
    Arc<Outbox>,
    Arc<ScriptedDispatcher>,
    ConnectivityMonitor,
    Arc<SyncEngine>,
) {
    let db = memory_db().await;
    let outbox = Arc::new(Outbox::open(db).await.expect("outbox"));
    let dispatcher = ScriptedDispatcher::new();
    let connectivity = ConnectivityMonitor::new(ConnectionStatus::Connected);
    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&outbox),
        Arc::clone(&dispatcher) as Arc<dyn CommandDispatcher>,
        connectivity.subscribe(),
        RetryPolicy {
            max_auto_retries: 3,
            initial_backoff: backoff,
            max_backoff: backoff,
        },
        Duration::from_secs(5),
    ));
    (outbox, dispatcher, connectivity, engine)
}

#[tokio::test]
async fn offline_commands_replay_in_issue_order() {
    let h = harness(ConnectionStatus::Offline, NO_SCAN).await;

    h.service
        .enqueue_command("createSession", json!({ "name": "S" }))
        .await
        .expect("enqueue");
    h.service
        .enqueue_command("addTask", json!({ "session": "S", "title": "T1" }))
        .await
        .expect("enqueue");
    assert_eq!(h.service.outbox_snapshot().queue_length, 2);

    let skipped = h.service.sync_now().await.expect("drain");
    assert_eq!(
        skipped,
        DrainOutcome::Skipped {
            reason: SkipReason::NotConnected
        }
    );
    assert!(h.dispatcher.dispatched().is_empty());

    h.connectivity.set(ConnectionStatus::Connected);
    let outcome = h.service.sync_now().await.expect("drain");
    assert_eq!(outcome, DrainOutcome::Completed { dispatched: 2 });
    assert_eq!(h.dispatcher.dispatched(), vec!["createSession", "addTask"]);

    let snapshot = h.service.outbox_snapshot();
    assert_eq!(snapshot.queue_length, 0);
    assert!(snapshot.failed_actions.is_empty());
    assert_eq!(snapshot.sync_status, SyncStatus::Idle);
}

#[tokio::test]
async fn transient_failure_at_head_stops_the_pass() {
    let h = harness(ConnectionStatus::Connected, NO_SCAN).await;
    h.dispatcher.push(transient("connection reset"));

    let first = h.service.enqueue_command("first", json!({})).await.expect("enqueue");
    h.service.enqueue_command("second", json!({})).await.expect("enqueue");

    let outcome = h.service.sync_now().await.expect("drain");
    assert_eq!(
        outcome,
        DrainOutcome::Halted {
            dispatched: 0,
            action_id: first.id.clone(),
            kind: FailureKind::Transient,
            retry_count: 1,
        }
    );
    assert_eq!(h.dispatcher.dispatched(), vec!["first"]);

    let snapshot = h.service.outbox_snapshot();
    assert_eq!(snapshot.queue_length, 1);
    assert_eq!(snapshot.failed_actions.len(), 1);
    assert_eq!(snapshot.failed_actions[0].id(), first.id);
    assert_eq!(snapshot.failed_actions[0].last_error, "connection reset");
    assert!(snapshot.failed_actions[0].is_retryable());
    assert_eq!(snapshot.sync_status, SyncStatus::Idle);
}

#[tokio::test]
async fn terminal_failure_is_not_retryable() {
    let h = harness(ConnectionStatus::Connected, NO_SCAN).await;
    h.dispatcher.push(terminal("unknown session"));
    h.service.enqueue_command("addTask", json!({})).await.expect("enqueue");

    h.service.sync_now().await.expect("drain");
    let failed = h.service.failed_actions().await.expect("failed");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].kind, FailureKind::Terminal);
    assert!(!failed[0].is_retryable());
}

#[tokio::test]
async fn retried_action_replays_before_newer_commands() {
    let h = harness(ConnectionStatus::Connected, NO_SCAN).await;
    h.dispatcher.push(transient("503"));

    let a = h.service.enqueue_command("a", json!({})).await.expect("enqueue");
    h.service.enqueue_command("b", json!({})).await.expect("enqueue");
    h.service.sync_now().await.expect("drain");
    h.service.enqueue_command("c", json!({})).await.expect("enqueue");

    let requeued = h.service.retry_failed(&a.id).await.expect("retry");
    assert_eq!(requeued.id, a.id);
    assert_eq!(requeued.retry_count, 1);

    let outcome = h.service.sync_now().await.expect("drain");
    assert_eq!(outcome, DrainOutcome::Completed { dispatched: 3 });
    assert_eq!(h.dispatcher.dispatched(), vec!["a", "a", "b", "c"]);

    let snapshot = h.service.outbox_snapshot();
    assert_eq!(snapshot.queue_length, 0);
    assert!(snapshot.failed_actions.is_empty());
}

#[tokio::test]
async fn failed_head_blocks_later_commands() {
    let h = harness(ConnectionStatus::Connected, NO_SCAN).await;
    h.dispatcher.push(transient("connection reset"));

    let create = h
        .service
        .enqueue_command("createSession", json!({ "name": "S" }))
        .await
        .expect("enqueue");
    h.service
        .enqueue_command("addTask", json!({ "session": "S", "title": "T1" }))
        .await
        .expect("enqueue");

    let first = h.service.sync_now().await.expect("first drain");
    assert!(matches!(first, DrainOutcome::Halted { .. }));

    let second = h.service.sync_now().await.expect("second drain");
    assert_eq!(
        second,
        DrainOutcome::Blocked {
            dispatched: 0,
            action_id: create.id.clone(),
        }
    );
    assert_eq!(h.dispatcher.dispatched(), vec!["createSession"]);
    assert_eq!(h.service.outbox_snapshot().queue_length, 1);

    h.service.retry_failed(&create.id).await.expect("retry");
    let outcome = h.service.sync_now().await.expect("drain after retry");
    assert_eq!(outcome, DrainOutcome::Completed { dispatched: 2 });
    assert_eq!(
        h.dispatcher.dispatched(),
        vec!["createSession", "createSession", "addTask"]
    );
}

#[tokio::test]
async fn retry_all_requeues_in_original_order() {
    let (outbox, dispatcher, _connectivity, engine) = engine_fixture(Duration::ZERO).await;

    let a = outbox.enqueue("a", json!({})).await.expect("enqueue");
    let b = outbox.enqueue("b", json!({})).await.expect("enqueue");
    outbox.enqueue("c", json!({})).await.expect("enqueue");
    outbox.fail(&a.id, &DispatchError::transient("boom")).await.expect("fail a");
    outbox.fail(&b.id, &DispatchError::transient("boom")).await.expect("fail b");

    let blocked = engine.drain().await.expect("drain");
    assert_eq!(
        blocked,
        DrainOutcome::Blocked {
            dispatched: 0,
            action_id: a.id.clone(),
        }
    );
    assert!(dispatcher.dispatched().is_empty());

    let outcome = engine.retry_all().await.expect("retry all");
    assert_eq!(outcome, DrainOutcome::Completed { dispatched: 3 });
    assert_eq!(dispatcher.dispatched(), vec!["a", "b", "c"]);
    assert!(outbox.failed().await.expect("failed").is_empty());
}

#[tokio::test]
async fn dismiss_and_clear_remove_failed_actions() {
    let (outbox, dispatcher, _connectivity, engine) = engine_fixture(Duration::ZERO).await;
    let mut ids = Vec::new();
    for cmd in ["a", "b", "c"] {
        ids.push(outbox.enqueue(cmd, json!({})).await.expect("enqueue").id);
    }
    for id in &ids {
        outbox
            .fail(id, &DispatchError::terminal("rejected"))
            .await
            .expect("fail");
    }
    assert_eq!(outbox.failed().await.expect("failed").len(), 3);

    outbox.dismiss(&ids[0]).await.expect("dismiss");
    assert_eq!(outbox.snapshot().failed_actions.len(), 2);

    let err = outbox.dismiss(&ids[0]).await;
    assert!(matches!(err, Err(AppError::NotFound(_))));

    assert_eq!(outbox.clear_failed().await.expect("clear"), 2);
    assert!(outbox.snapshot().failed_actions.is_empty());

    outbox.enqueue("d", json!({})).await.expect("enqueue");
    let outcome = engine.drain().await.expect("drain");
    assert_eq!(outcome, DrainOutcome::Completed { dispatched: 1 });
    assert_eq!(dispatcher.dispatched(), vec!["d"]);
}

#[tokio::test]
async fn dismissing_the_blocking_action_releases_the_queue() {
    let (outbox, dispatcher, _connectivity, engine) = engine_fixture(Duration::ZERO).await;
    let a = outbox.enqueue("a", json!({})).await.expect("enqueue");
    outbox.enqueue("b", json!({})).await.expect("enqueue");
    outbox
        .fail(&a.id, &DispatchError::terminal("rejected"))
        .await
        .expect("fail");

    assert!(matches!(
        engine.drain().await.expect("drain"),
        DrainOutcome::Blocked { .. }
    ));

    outbox.dismiss(&a.id).await.expect("dismiss");
    let outcome = engine.drain().await.expect("drain");
    assert_eq!(outcome, DrainOutcome::Completed { dispatched: 1 });
    assert_eq!(dispatcher.dispatched(), vec!["b"]);
}

#[tokio::test]
async fn slow_dispatch_times_out_as_transient() {
    let h = harness(ConnectionStatus::Connected, NO_SCAN).await;
    h.dispatcher.set_delay(Duration::from_millis(1500));
    h.service.enqueue_command("slow", json!({})).await.expect("enqueue");

    let outcome = h.service.sync_now().await.expect("drain");
    match outcome {
        DrainOutcome::Halted { kind, .. } => assert_eq!(kind, FailureKind::Transient),
        other => panic!("expected halt, got {other:?}"),
    }
    let failed = h.service.failed_actions().await.expect("failed");
    assert!(failed[0].last_error.contains("timed out"));
}

#[tokio::test]
async fn concurrent_drain_is_skipped() {
    let db = memory_db().await;
    let outbox = Arc::new(Outbox::open(Arc::clone(&db)).await.expect("outbox"));
    let dispatcher = ScriptedDispatcher::new();
    dispatcher.set_delay(Duration::from_millis(100));
    let connectivity = ConnectivityMonitor::new(ConnectionStatus::Connected);
    let engine = SyncEngine::new(
        Arc::clone(&outbox),
        Arc::clone(&dispatcher) as Arc<dyn CommandDispatcher>,
        connectivity.subscribe(),
        RetryPolicy {
            max_auto_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        },
        Duration::from_secs(5),
    );
    outbox.enqueue("only", json!({})).await.expect("enqueue");

    let (a, b) = tokio::join!(engine.drain(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.drain().await
    });

    assert_eq!(a.expect("first"), DrainOutcome::Completed { dispatched: 1 });
    assert_eq!(
        b.expect("second"),
        DrainOutcome::Skipped {
            reason: SkipReason::AlreadySyncing
        }
    );
    assert_eq!(dispatcher.dispatched(), vec!["only"]);
    assert_eq!(engine.status(), SyncStatus::Idle);
}

#[tokio::test]
async fn background_engine_drains_when_connectivity_returns() {
    let h = harness(ConnectionStatus::Offline, NO_SCAN).await;
    let ct = CancellationToken::new();
    let runtime = h.service.start(ct.clone()).await.expect("start");

    h.service.enqueue_command("queued-offline", json!({})).await.expect("enqueue");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.dispatcher.dispatched().is_empty());

    let mut outbox = h.service.subscribe_outbox();
    h.connectivity.set(ConnectionStatus::Connected);
    tokio::time::timeout(
        Duration::from_secs(5),
        outbox.wait_for(|s| s.queue_length == 0 && s.sync_status == SyncStatus::Idle),
    )
    .await
    .expect("drained in time")
    .expect("channel open");

    assert_eq!(h.dispatcher.dispatched(), vec!["queued-offline"]);
    ct.cancel();
    runtime.join().await;
}

#[tokio::test]
async fn background_engine_auto_retries_transient_failures() {
    let h = harness(ConnectionStatus::Connected, NO_SCAN).await;
    h.dispatcher.push(transient("flaky"));
    let ct = CancellationToken::new();
    let runtime = h.service.start(ct.clone()).await.expect("start");

    h.service.enqueue_command("flaky-cmd", json!({})).await.expect("enqueue");

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.dispatcher.dispatched().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("second attempt in time");

    let mut outbox = h.service.subscribe_outbox();
    tokio::time::timeout(
        Duration::from_secs(5),
        outbox.wait_for(|s| {
            s.queue_length == 0 && s.failed_actions.is_empty() && s.sync_status == SyncStatus::Idle
        }),
    )
    .await
    .expect("auto retry in time")
    .expect("channel open");

    assert_eq!(h.dispatcher.dispatched(), vec!["flaky-cmd", "flaky-cmd"]);
    ct.cancel();
    runtime.join().await;
}

#[tokio::test]
async fn terminal_failures_wait_for_the_user() {
    let h = harness(ConnectionStatus::Connected, NO_SCAN).await;
    h.dispatcher.push(terminal("invalid"));
    let ct = CancellationToken::new();
    let runtime = h.service.start(ct.clone()).await.expect("start");

    h.service.enqueue_command("bad", json!({})).await.expect("enqueue");
    let mut outbox = h.service.subscribe_outbox();
    tokio::time::timeout(
        Duration::from_secs(5),
        outbox.wait_for(|s| s.failed_actions.len() == 1),
    )
    .await
    .expect("failed in time")
    .expect("channel open");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.dispatcher.dispatched(), vec!["bad"]);
    ct.cancel();
    runtime.join().await;
}

#[tokio::test]
async fn background_engine_holds_new_commands_behind_scheduled_retry() {
    let (outbox, dispatcher, _connectivity, engine) =
        engine_fixture(Duration::from_millis(400)).await;
    dispatcher.push(transient("flaky"));
    let ct = CancellationToken::new();
    let handle = engine.spawn(ct.clone());

    outbox.enqueue("createSession", json!({})).await.expect("enqueue");
    engine.request_drain();
    tokio::time::timeout(Duration::from_secs(5), async {
        while outbox.snapshot().failed_actions.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("first attempt failed in time");

    outbox.enqueue("addTask", json!({})).await.expect("enqueue");
    engine.request_drain();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(dispatcher.dispatched(), vec!["createSession"]);

    let mut rx = outbox.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| {
            s.queue_length == 0 && s.failed_actions.is_empty() && s.sync_status == SyncStatus::Idle
        }),
    )
    .await
    .expect("drained after retry")
    .expect("channel open");

    assert_eq!(
        dispatcher.dispatched(),
        vec!["createSession", "createSession", "addTask"]
    );
    ct.cancel();
    handle.await.expect("engine join");
}

#[tokio::test]
async fn background_engine_retries_failure_restored_from_earlier_run() {
    let (outbox, dispatcher, _connectivity, engine) = engine_fixture(Duration::ZERO).await;
    let a = outbox.enqueue("a", json!({})).await.expect("enqueue");
    outbox.enqueue("b", json!({})).await.expect("enqueue");
    outbox
        .fail(&a.id, &DispatchError::transient("offline"))
        .await
        .expect("fail");

    let mut rx = outbox.subscribe();
    let ct = CancellationToken::new();
    let handle = engine.spawn(ct.clone());

    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| {
            s.queue_length == 0 && s.failed_actions.is_empty() && s.sync_status == SyncStatus::Idle
        }),
    )
    .await
    .expect("drained in time")
    .expect("channel open");

    assert_eq!(dispatcher.dispatched(), vec!["a", "b"]);
    ct.cancel();
    handle.await.expect("engine join");
}
