//! Session lock repository for `SQLite` persistence.
//!
//! Pure data access over the `session_lock` table. Policy about when a
//! lock is stale lives in [`crate::recovery::detector`].

use std::sync::Arc;

use crate::models::lock::SessionLock;
use crate::{AppError, Result};

use super::db::Database;
use super::parse_timestamp;

/// Repository wrapper around `SQLite` for session locks.
#[derive(Clone)]
pub struct LockRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct LockRow {
    session_id: String,
    owner_pid: i64,
    heartbeat_at: String,
}

impl LockRow {
    fn into_lock(self) -> Result<SessionLock> {
        let owner_pid = u32::try_from(self.owner_pid)
            .map_err(|_| AppError::Db(format!("invalid owner_pid: {}", self.owner_pid)))?;
        Ok(SessionLock {
            heartbeat_at: parse_timestamp("heartbeat_at", &self.heartbeat_at)?,
            session_id: self.session_id,
            owner_pid,
        })
    }
}

impl LockRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace the lock for `lock.session_id` (last write wins).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the upsert fails.
    pub async fn put(&self, lock: &SessionLock) -> Result<()> {
        sqlx::query(
            "INSERT INTO session_lock (session_id, owner_pid, heartbeat_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(session_id) DO UPDATE SET
                owner_pid = excluded.owner_pid,
                heartbeat_at = excluded.heartbeat_at",
        )
        .bind(&lock.session_id)
        .bind(i64::from(lock.owner_pid))
        .bind(lock.heartbeat_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Retrieve the lock for a session, if one is held.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or the row is malformed.
    pub async fn get(&self, session_id: &str) -> Result<Option<SessionLock>> {
        let row: Option<LockRow> = sqlx::query_as(
            "SELECT session_id, owner_pid, heartbeat_at FROM session_lock WHERE session_id = ?1",
        )
        .bind(session_id)
        .fetch_optional(self.db.as_ref())
        .await?;
        row.map(LockRow::into_lock).transpose()
    }

    /// List every lock, oldest heartbeat first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or a row is malformed.
    pub async fn list(&self) -> Result<Vec<SessionLock>> {
        let rows: Vec<LockRow> = sqlx::query_as(
            "SELECT session_id, owner_pid, heartbeat_at FROM session_lock
             ORDER BY heartbeat_at ASC, session_id ASC",
        )
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(LockRow::into_lock).collect()
    }

    /// Delete the lock for a session. Returns `false` if none was held.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn remove(&self, session_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM session_lock WHERE session_id = ?1")
            .bind(session_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete the lock for a session only if it still matches `expected`
    /// (same owner pid and heartbeat). Returns `false` if the lock was
    /// refreshed, replaced, or already removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn remove_if(&self, expected: &SessionLock) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM session_lock
             WHERE session_id = ?1 AND owner_pid = ?2 AND heartbeat_at = ?3",
        )
        .bind(&expected.session_id)
        .bind(i64::from(expected.owner_pid))
        .bind(expected.heartbeat_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
