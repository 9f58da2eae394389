//! Unit tests for the offline outbox state machine.
//!
//! Validates that:
//! - The queue is strict FIFO
//! - `fail` moves an entry aside and bumps its retry count
//! - `retry` puts an entry back at the head with its error cleared
//! - Snapshots are published after every mutation
//! - Unknown ids surface as `NotFound`

use std::sync::Arc;

use serde_json::json;

use agent_lifeline::errors::{DispatchError, FailureKind};
use agent_lifeline::outbox::Outbox;
use agent_lifeline::persistence::db;
use agent_lifeline::AppError;

async fn outbox() -> Outbox {
    let db = Arc::new(db::connect_memory().await.expect("in-memory db"));
    Outbox::open(db).await.expect("open outbox")
}

async fn queued_cmds(outbox: &Outbox) -> Vec<String> {
    outbox
        .queued()
        .await
        .expect("queued")
        .into_iter()
        .map(|action| action.cmd)
        .collect()
}

#[tokio::test]
async fn enqueue_preserves_fifo_order() {
    let outbox = outbox().await;
    for cmd in ["one", "two", "three"] {
        outbox.enqueue(cmd, json!({})).await.expect("enqueue");
    }

    assert_eq!(queued_cmds(&outbox).await, vec!["one", "two", "three"]);
    let head = outbox.dequeue_head().await.expect("head").expect("some");
    assert_eq!(head.cmd, "one");
    // Peeking does not remove.
    assert_eq!(outbox.snapshot().queue_length, 3);
}

#[tokio::test]
async fn empty_command_is_rejected() {
    let outbox = outbox().await;
    let result = outbox.enqueue("  ", json!({})).await;
    match result {
        Err(AppError::Dispatch(err)) => assert_eq!(err.kind, FailureKind::Terminal),
        other => panic!("expected terminal dispatch error, got {other:?}"),
    }
    assert_eq!(outbox.snapshot().queue_length, 0);
}

#[tokio::test]
async fn confirm_removes_entry() {
    let outbox = outbox().await;
    let action = outbox.enqueue("createSession", json!({})).await.expect("enqueue");

    outbox.confirm(&action.id).await.expect("confirm");
    assert!(outbox.dequeue_head().await.expect("head").is_none());
    assert_eq!(outbox.snapshot().queue_length, 0);

    let again = outbox.confirm(&action.id).await;
    assert!(matches!(again, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn fail_moves_entry_to_failed_list() {
    let outbox = outbox().await;
    let action = outbox.enqueue("addTask", json!({ "t": 1 })).await.expect("enqueue");

    let failed = outbox
        .fail(&action.id, &DispatchError::transient("HTTP 503"))
        .await
        .expect("fail");
    assert_eq!(failed.id(), action.id);
    assert_eq!(failed.action.retry_count, 1);
    assert_eq!(failed.last_error, "HTTP 503");
    assert_eq!(failed.kind, FailureKind::Transient);
    assert_eq!(failed.action.args, json!({ "t": 1 }));

    let snapshot = outbox.snapshot();
    assert_eq!(snapshot.queue_length, 0);
    assert_eq!(snapshot.failed_actions, vec![failed]);
}

#[tokio::test]
async fn retry_requeues_at_head_and_clears_error() {
    let outbox = outbox().await;
    let a = outbox.enqueue("a", json!({})).await.expect("enqueue");
    outbox.enqueue("b", json!({})).await.expect("enqueue");
    outbox
        .fail(&a.id, &DispatchError::transient("timeout"))
        .await
        .expect("fail");
    outbox.enqueue("c", json!({})).await.expect("enqueue");

    let retried = outbox.retry(&a.id).await.expect("retry");
    assert_eq!(retried.id, a.id);
    assert_eq!(retried.retry_count, 1);

    assert_eq!(queued_cmds(&outbox).await, vec!["a", "b", "c"]);
    assert!(outbox.failed().await.expect("failed").is_empty());
}

#[tokio::test]
async fn retry_count_accumulates_across_failures() {
    let outbox = outbox().await;
    let a = outbox.enqueue("a", json!({})).await.expect("enqueue");
    for expected in 1..=3 {
        let failed = outbox
            .fail(&a.id, &DispatchError::transient("again"))
            .await
            .expect("fail");
        assert_eq!(failed.action.retry_count, expected);
        outbox.retry(&a.id).await.expect("retry");
    }
}

#[tokio::test]
async fn dismiss_and_clear_failed() {
    let outbox = outbox().await;
    let mut ids = Vec::new();
    for cmd in ["a", "b", "c"] {
        let action = outbox.enqueue(cmd, json!({})).await.expect("enqueue");
        outbox
            .fail(&action.id, &DispatchError::terminal("rejected"))
            .await
            .expect("fail");
        ids.push(action.id);
    }

    outbox.dismiss(&ids[1]).await.expect("dismiss");
    let remaining: Vec<String> = outbox
        .failed()
        .await
        .expect("failed")
        .iter()
        .map(|f| f.action.cmd.clone())
        .collect();
    assert_eq!(remaining, vec!["a", "c"]);

    assert_eq!(outbox.clear_failed().await.expect("clear"), 2);
    assert!(outbox.snapshot().failed_actions.is_empty());
    assert_eq!(outbox.clear_failed().await.expect("clear empty"), 0);
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let outbox = outbox().await;
    assert!(matches!(
        outbox.retry("act:missing").await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        outbox.dismiss("act:missing").await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        outbox
            .fail("act:missing", &DispatchError::transient("x"))
            .await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn queued_entry_cannot_be_retried_or_dismissed() {
    let outbox = outbox().await;
    let action = outbox.enqueue("a", json!({})).await.expect("enqueue");
    assert!(matches!(
        outbox.retry(&action.id).await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        outbox.dismiss(&action.id).await,
        Err(AppError::NotFound(_))
    ));
    assert_eq!(outbox.snapshot().queue_length, 1);
}

#[tokio::test]
async fn subscribers_see_every_mutation() {
    let outbox = outbox().await;
    let mut rx = outbox.subscribe();
    assert_eq!(rx.borrow_and_update().queue_length, 0);

    let action = outbox.enqueue("a", json!({})).await.expect("enqueue");
    assert!(rx.has_changed().expect("open"));
    assert_eq!(rx.borrow_and_update().queue_length, 1);

    outbox
        .fail(&action.id, &DispatchError::transient("x"))
        .await
        .expect("fail");
    assert!(rx.has_changed().expect("open"));
    let snapshot = rx.borrow_and_update().clone();
    assert_eq!(snapshot.queue_length, 0);
    assert_eq!(snapshot.failed_actions.len(), 1);
}
