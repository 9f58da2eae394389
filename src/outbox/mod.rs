//! Durable offline outbox of commands awaiting remote confirmation.
//!
//! The outbox is the only writer of queued and failed actions. Every
//! mutation is serialised behind one async mutex, persisted to `SQLite`,
//! and followed by a fresh [`OutboxSnapshot`] on a `watch` channel so UI
//! consumers can render state without touching the store.
//!
//! Replay order is strict FIFO. A failed action is moved aside and blocks
//! everything issued after it until it is retried, dismissed, or cleared;
//! [`Outbox::retry`] puts it back at the head so it is replayed first.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::errors::DispatchError;
use crate::models::action::{FailedAction, QueuedAction};
use crate::models::status::SyncStatus;
use crate::persistence::db::Database;
use crate::persistence::outbox_repo::OutboxRepo;
use crate::{AppError, Result};

/// Read-only view published after every outbox mutation.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct OutboxSnapshot {
    /// Actions waiting to be dispatched.
    pub queue_length: u64,
    /// Actions that failed and await a user decision or automatic retry.
    pub failed_actions: Vec<FailedAction>,
    /// Whether a drain pass is running.
    pub sync_status: SyncStatus,
}

/// Persistent FIFO of unconfirmed commands plus the failed side list.
pub struct Outbox {
    repo: OutboxRepo,
    write_lock: Mutex<()>,
    snapshot_tx: watch::Sender<OutboxSnapshot>,
}

impl Outbox {
    /// Open the outbox over `db`, loading whatever survived the last run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the initial state cannot be read.
    pub async fn open(db: Arc<Database>) -> Result<Self> {
        let (snapshot_tx, _) = watch::channel(OutboxSnapshot::default());
        let outbox = Self {
            repo: OutboxRepo::new(db),
            write_lock: Mutex::new(()),
            snapshot_tx,
        };
        outbox.refresh().await?;

        let snapshot = outbox.snapshot();
        if snapshot.queue_length > 0 || !snapshot.failed_actions.is_empty() {
            info!(
                queued = snapshot.queue_length,
                failed = snapshot.failed_actions.len(),
                "outbox restored from previous run"
            );
        }
        Ok(outbox)
    }

    /// Subscribe to snapshot updates.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<OutboxSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> OutboxSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Append a command to the tail of the queue.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Dispatch` (terminal) for an empty command name, or
    /// `AppError::Db` if persistence fails.
    pub async fn enqueue(
        &self,
        cmd: impl Into<String>,
        args: serde_json::Value,
    ) -> Result<QueuedAction> {
        let cmd = cmd.into();
        if cmd.trim().is_empty() {
            return Err(DispatchError::terminal("command name must not be empty").into());
        }

        let _guard = self.write_lock.lock().await;
        let action = QueuedAction::new(cmd, args);
        self.repo.insert(&action).await?;
        self.refresh().await?;
        info!(action_id = %action.id, cmd = %action.cmd, "command queued");
        Ok(action)
    }

    /// Peek at the head of the queue without removing it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn dequeue_head(&self) -> Result<Option<QueuedAction>> {
        self.repo.head().await
    }

    /// The failed action that must be resolved before the queue head may be
    /// replayed, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn blocking_failure(&self) -> Result<Option<FailedAction>> {
        self.repo.blocking_failure().await
    }

    /// Remove a queued action after the backend confirmed it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if `id` is not queued.
    pub async fn confirm(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if !self.repo.delete_queued(id).await? {
            return Err(AppError::NotFound(format!("queued action {id} not found")));
        }
        self.refresh().await?;
        debug!(action_id = id, "action confirmed");
        Ok(())
    }

    /// Move a queued action to the failed list, incrementing its retry count.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if `id` is not queued.
    pub async fn fail(&self, id: &str, error: &DispatchError) -> Result<FailedAction> {
        let _guard = self.write_lock.lock().await;
        if !self
            .repo
            .mark_failed(id, &error.message, error.kind, Utc::now())
            .await?
        {
            return Err(AppError::NotFound(format!("queued action {id} not found")));
        }
        let failed = self
            .repo
            .get_failed(id)
            .await?
            .ok_or_else(|| AppError::Db(format!("failed action {id} missing after update")))?;
        self.refresh().await?;
        warn!(
            action_id = id,
            kind = error.kind.as_str(),
            retry_count = failed.action.retry_count,
            error = %error.message,
            "action failed"
        );
        Ok(failed)
    }

    /// Move a failed action back to the head of the queue, error cleared.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if `failed_id` is not in the failed list.
    pub async fn retry(&self, failed_id: &str) -> Result<QueuedAction> {
        let _guard = self.write_lock.lock().await;
        if !self.repo.requeue_at_head(failed_id).await? {
            return Err(AppError::NotFound(format!(
                "failed action {failed_id} not found"
            )));
        }
        let action = self
            .repo
            .head()
            .await?
            .filter(|head| head.id == failed_id)
            .ok_or_else(|| AppError::Db(format!("action {failed_id} is not at queue head")))?;
        self.refresh().await?;
        info!(action_id = failed_id, retry_count = action.retry_count, "action requeued");
        Ok(action)
    }

    /// Discard a failed action permanently.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if `failed_id` is not in the failed list.
    pub async fn dismiss(&self, failed_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if !self.repo.delete_failed(failed_id).await? {
            return Err(AppError::NotFound(format!(
                "failed action {failed_id} not found"
            )));
        }
        self.refresh().await?;
        info!(action_id = failed_id, "failed action dismissed");
        Ok(())
    }

    /// Discard every failed action. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn clear_failed(&self) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let removed = self.repo.delete_all_failed().await?;
        self.refresh().await?;
        info!(removed, "failed actions cleared");
        Ok(removed)
    }

    /// Queued actions in replay order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn queued(&self) -> Result<Vec<QueuedAction>> {
        self.repo.list_queued().await
    }

    /// Failed actions in original issue order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn failed(&self) -> Result<Vec<FailedAction>> {
        self.repo.list_failed().await
    }

    /// Publish the sync engine's status alongside the outbox state.
    pub(crate) fn publish_sync_status(&self, status: SyncStatus) {
        self.snapshot_tx.send_if_modified(|snapshot| {
            if snapshot.sync_status == status {
                false
            } else {
                snapshot.sync_status = status;
                true
            }
        });
    }

    async fn refresh(&self) -> Result<()> {
        let queue_length = self.repo.count_queued().await?;
        let failed_actions = self.repo.list_failed().await?;
        self.snapshot_tx.send_modify(|snapshot| {
            snapshot.queue_length = queue_length;
            snapshot.failed_actions = failed_actions;
        });
        Ok(())
    }
}
