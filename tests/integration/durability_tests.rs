//! Integration tests for crash durability of the file-backed store.
//!
//! Validates:
//! - Locks and outbox state written before a restart are visible after it
//! - FIFO order and failed entries survive reopening the database
//! - A restarted service reports the surviving stale session

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use agent_lifeline::errors::DispatchError;
use agent_lifeline::liveness::{Liveness, LivenessChecker};
use agent_lifeline::models::status::ConnectionStatus;
use agent_lifeline::outbox::Outbox;
use agent_lifeline::persistence::db;
use agent_lifeline::persistence::lock_repo::LockRepo;
use agent_lifeline::persistence::task_repo::{SqliteTaskRepo, TaskRepository};
use agent_lifeline::recovery::StaleSessionDetector;
use agent_lifeline::sync::connectivity::ConnectivityMonitor;
use agent_lifeline::sync::dispatcher::CommandDispatcher;
use agent_lifeline::ResilienceService;

use super::test_helpers::{lock_for, test_config, FakeLiveness, ScriptedDispatcher, NO_SCAN};

#[tokio::test]
async fn outbox_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("lifeline.db");
    let path = path.to_str().expect("utf8 path");

    let failed_id = {
        let pool = Arc::new(db::connect(path).await.expect("connect"));
        let outbox = Outbox::open(Arc::clone(&pool)).await.expect("outbox");
        let a = outbox.enqueue("a", json!({ "n": 1 })).await.expect("enqueue");
        outbox.enqueue("b", json!({ "n": 2 })).await.expect("enqueue");
        outbox.enqueue("c", json!({ "n": 3 })).await.expect("enqueue");
        outbox
            .fail(&a.id, &DispatchError::transient("offline"))
            .await
            .expect("fail");
        pool.close().await;
        a.id
    };

    let pool = Arc::new(db::connect(path).await.expect("reconnect"));
    let outbox = Outbox::open(pool).await.expect("reopen");

    let snapshot = outbox.snapshot();
    assert_eq!(snapshot.queue_length, 2);
    assert_eq!(snapshot.failed_actions.len(), 1);
    assert_eq!(snapshot.failed_actions[0].id(), failed_id);
    assert_eq!(snapshot.failed_actions[0].action.retry_count, 1);
    assert_eq!(snapshot.failed_actions[0].action.args, json!({ "n": 1 }));

    let order: Vec<String> = outbox
        .queued()
        .await
        .expect("queued")
        .into_iter()
        .map(|action| action.cmd)
        .collect();
    assert_eq!(order, vec!["b", "c"]);

    let retried = outbox.retry(&failed_id).await.expect("retry");
    assert_eq!(retried.cmd, "a");
    let head = outbox.dequeue_head().await.expect("head").expect("some");
    assert_eq!(head.id, failed_id);
}

#[tokio::test]
async fn locks_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("lifeline.db");
    let path = path.to_str().expect("utf8 path");

    let lock = lock_for("S-durable", 4242);
    {
        let pool = Arc::new(db::connect(path).await.expect("connect"));
        LockRepo::new(Arc::clone(&pool)).put(&lock).await.expect("put");
        pool.close().await;
    }

    let pool = Arc::new(db::connect(path).await.expect("reconnect"));
    let locks = LockRepo::new(pool);
    let restored = locks.get("S-durable").await.expect("get").expect("present");
    assert_eq!(restored, lock);

    let liveness = FakeLiveness::new();
    liveness.set(4242, Liveness::Dead);
    let detector = StaleSessionDetector::new(
        locks,
        liveness as Arc<dyn LivenessChecker>,
        Duration::from_secs(1),
    );
    let stale = detector.scan().await.expect("scan");
    assert_eq!(stale, vec![lock.to_stale()]);
}

#[tokio::test]
async fn restarted_service_resumes_where_it_stopped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(test_config(dir.path().to_str().expect("utf8 path"), NO_SCAN));
    let path = config.db_path();
    let path = path.to_str().expect("utf8 path");

    {
        let pool = Arc::new(db::connect(path).await.expect("connect"));
        let service = build(Arc::clone(&config), Arc::clone(&pool), ConnectionStatus::Offline).await;
        service
            .enqueue_command("createSession", json!({ "name": "S" }))
            .await
            .expect("enqueue");
        service.locks().put(&lock_for("S1", 4242)).await.expect("put");
        pool.close().await;
    }

    let pool = Arc::new(db::connect(path).await.expect("reconnect"));
    let service = build(config, pool, ConnectionStatus::Connected).await;
    assert_eq!(service.outbox_snapshot().queue_length, 1);
    assert_eq!(service.scan_stale_sessions().await.expect("scan").len(), 1);

    service.sync_now().await.expect("drain");
    assert_eq!(service.outbox_snapshot().queue_length, 0);
}

async fn build(
    config: Arc<agent_lifeline::GlobalConfig>,
    pool: Arc<db::Database>,
    status: ConnectionStatus,
) -> ResilienceService {
    let tasks = Arc::new(SqliteTaskRepo::new(Arc::clone(&pool)));
    ResilienceService::new(
        config,
        pool,
        ScriptedDispatcher::new() as Arc<dyn CommandDispatcher>,
        tasks as Arc<dyn TaskRepository>,
        FakeLiveness::new() as Arc<dyn LivenessChecker>,
        Arc::new(ConnectivityMonitor::new(status)),
    )
    .await
    .expect("service")
}
