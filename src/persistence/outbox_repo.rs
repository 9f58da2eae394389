//! Outbox repository for `SQLite` persistence.
//!
//! Queued and failed actions share the `outbox_action` table, told apart by
//! `state`. Queue order is ascending `position`; a retried action is given a
//! position below every other row so it becomes the new head.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::errors::FailureKind;
use crate::models::action::{FailedAction, QueuedAction};
use crate::{AppError, Result};

use super::db::Database;
use super::parse_timestamp;

/// Repository wrapper around `SQLite` for outbox entries.
#[derive(Clone)]
pub struct OutboxRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: String,
    cmd: String,
    args: String,
    created_at: String,
    retry_count: i64,
    last_error: Option<String>,
    failure_kind: Option<String>,
    failed_at: Option<String>,
}

const COLUMNS: &str =
    "id, cmd, args, created_at, retry_count, last_error, failure_kind, failed_at";

impl OutboxRow {
    fn into_queued(self) -> Result<QueuedAction> {
        let retry_count = u32::try_from(self.retry_count)
            .map_err(|_| AppError::Db(format!("invalid retry_count: {}", self.retry_count)))?;
        Ok(QueuedAction {
            args: serde_json::from_str(&self.args)?,
            timestamp: parse_timestamp("created_at", &self.created_at)?,
            id: self.id,
            cmd: self.cmd,
            retry_count,
        })
    }

    fn into_failed(self) -> Result<FailedAction> {
        let kind = self
            .failure_kind
            .as_deref()
            .map(FailureKind::parse)
            .transpose()?
            .unwrap_or(FailureKind::Transient);
        let failed_at = self
            .failed_at
            .as_deref()
            .map(|raw| parse_timestamp("failed_at", raw))
            .transpose()?
            .unwrap_or_else(Utc::now);
        let last_error = self.last_error.clone().unwrap_or_default();
        Ok(FailedAction {
            action: self.into_queued()?,
            last_error,
            kind,
            failed_at,
        })
    }
}

impl OutboxRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append an action at the tail of the queue.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn insert(&self, action: &QueuedAction) -> Result<()> {
        let args = serde_json::to_string(&action.args)?;
        sqlx::query(
            "INSERT INTO outbox_action (id, cmd, args, created_at, retry_count, position, state)
             SELECT ?1, ?2, ?3, ?4, ?5, COALESCE(MAX(position), 0) + 1, 'queued'
             FROM outbox_action",
        )
        .bind(&action.id)
        .bind(&action.cmd)
        .bind(&args)
        .bind(action.timestamp.to_rfc3339())
        .bind(i64::from(action.retry_count))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Oldest queued action, without removing it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn head(&self) -> Result<Option<QueuedAction>> {
        let row: Option<OutboxRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM outbox_action WHERE state = 'queued'
             ORDER BY position ASC LIMIT 1"
        ))
        .fetch_optional(self.db.as_ref())
        .await?;
        row.map(OutboxRow::into_queued).transpose()
    }

    /// All queued actions in replay order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_queued(&self) -> Result<Vec<QueuedAction>> {
        let rows: Vec<OutboxRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM outbox_action WHERE state = 'queued' ORDER BY position ASC"
        ))
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(OutboxRow::into_queued).collect()
    }

    /// All failed actions in original issue order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_failed(&self) -> Result<Vec<FailedAction>> {
        let rows: Vec<OutboxRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM outbox_action WHERE state = 'failed' ORDER BY position ASC"
        ))
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(OutboxRow::into_failed).collect()
    }

    /// Earliest failed action issued ahead of the current queue head, if
    /// any. Such an entry blocks the queue until it is retried or dismissed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn blocking_failure(&self) -> Result<Option<FailedAction>> {
        let row: Option<OutboxRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM outbox_action
             WHERE state = 'failed'
               AND position < (SELECT MIN(position) FROM outbox_action WHERE state = 'queued')
             ORDER BY position ASC LIMIT 1"
        ))
        .fetch_optional(self.db.as_ref())
        .await?;
        row.map(OutboxRow::into_failed).transpose()
    }

    /// One failed action by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_failed(&self, id: &str) -> Result<Option<FailedAction>> {
        let row: Option<OutboxRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM outbox_action WHERE id = ?1 AND state = 'failed'"
        ))
        .bind(id)
        .fetch_optional(self.db.as_ref())
        .await?;
        row.map(OutboxRow::into_failed).transpose()
    }

    /// Number of queued actions.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn count_queued(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM outbox_action WHERE state = 'queued'")
                .fetch_one(self.db.as_ref())
                .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Delete a queued action. Returns `false` if no queued row matched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_queued(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM outbox_action WHERE id = ?1 AND state = 'queued'")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a queued action to the failed list, bumping its retry count.
    /// Returns `false` if no queued row matched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        kind: FailureKind,
        failed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE outbox_action
             SET state = 'failed', retry_count = retry_count + 1,
                 last_error = ?2, failure_kind = ?3, failed_at = ?4
             WHERE id = ?1 AND state = 'queued'",
        )
        .bind(id)
        .bind(error)
        .bind(kind.as_str())
        .bind(failed_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a failed action to the head of the queue with its error cleared.
    /// Returns `false` if no failed row matched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn requeue_at_head(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE outbox_action
             SET state = 'queued', last_error = NULL, failure_kind = NULL, failed_at = NULL,
                 position = (SELECT MIN(position) FROM outbox_action) - 1
             WHERE id = ?1 AND state = 'failed'",
        )
        .bind(id)
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a failed action. Returns `false` if no failed row matched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_failed(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM outbox_action WHERE id = ?1 AND state = 'failed'")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete every failed action. Returns the number of rows deleted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_all_failed(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM outbox_action WHERE state = 'failed'")
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}
