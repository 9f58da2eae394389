//! Persistence layer modules.

use chrono::{DateTime, Utc};

use crate::{AppError, Result};

pub mod db;
pub mod lock_repo;
pub mod outbox_repo;
pub mod recovery_log_repo;
pub mod retention;
pub mod schema;
pub mod task_repo;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

/// Parse an RFC 3339 column value into a UTC timestamp.
pub(crate) fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {column}: {e}")))
}
