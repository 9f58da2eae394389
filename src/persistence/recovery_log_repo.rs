//! Append-only log of recovery attempts.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::recovery::RecoveryResult;
use crate::{AppError, Result};

use super::db::Database;
use super::parse_timestamp;

/// Repository for `recovery_log` rows.
#[derive(Clone)]
pub struct RecoveryLogRepo {
    db: Arc<Database>,
}

#[derive(sqlx::FromRow)]
struct RecoveryRow {
    session_id: String,
    success: i64,
    message: String,
    tasks_unassigned: i64,
    recovered_at: String,
}

impl RecoveryRow {
    fn into_result(self) -> Result<RecoveryResult> {
        let tasks_unassigned = u32::try_from(self.tasks_unassigned).map_err(|_| {
            AppError::Db(format!("invalid tasks_unassigned: {}", self.tasks_unassigned))
        })?;
        Ok(RecoveryResult {
            recovered_at: parse_timestamp("recovered_at", &self.recovered_at)?,
            session_id: self.session_id,
            success: self.success != 0,
            message: self.message,
            tasks_unassigned,
        })
    }
}

impl RecoveryLogRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append one result.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn append(&self, result: &RecoveryResult) -> Result<()> {
        sqlx::query(
            "INSERT INTO recovery_log (session_id, success, message, tasks_unassigned, recovered_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&result.session_id)
        .bind(i64::from(result.success))
        .bind(&result.message)
        .bind(i64::from(result.tasks_unassigned))
        .bind(result.recovered_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Most recent results first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<RecoveryResult>> {
        let rows: Vec<RecoveryRow> = sqlx::query_as(
            "SELECT session_id, success, message, tasks_unassigned, recovered_at
             FROM recovery_log ORDER BY id DESC LIMIT ?1",
        )
        .bind(i64::from(limit))
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(RecoveryRow::into_result).collect()
    }

    /// All results for one session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<RecoveryResult>> {
        let rows: Vec<RecoveryRow> = sqlx::query_as(
            "SELECT session_id, success, message, tasks_unassigned, recovered_at
             FROM recovery_log WHERE session_id = ?1 ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(RecoveryRow::into_result).collect()
    }

    /// Delete results recorded before `before`. Returns the number of rows deleted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn purge(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM recovery_log WHERE recovered_at < ?1")
            .bind(before.to_rfc3339())
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}
