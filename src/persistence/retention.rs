//! Retention service for time-based purge of the recovery log.
//!
//! Stale locks and outbox entries are never purged by age; they stay
//! until recovered, confirmed, or dismissed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::db::Database;
use super::recovery_log_repo::RecoveryLogRepo;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the retention purge background task.
///
/// The task runs hourly, deleting recovery log entries older than
/// `retention_days`.
#[must_use]
pub fn spawn_retention_task(
    db: Arc<Database>,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = purge(&db, retention_days).await {
                        error!(?err, "retention purge failed");
                    }
                }
            }
        }
    })
}

/// Delete recovery log entries older than `retention_days`.
///
/// # Errors
///
/// Returns `AppError::Db` if the delete fails.
pub async fn purge(db: &Arc<Database>, retention_days: u32) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let deleted = RecoveryLogRepo::new(Arc::clone(db)).purge(cutoff).await?;
    info!(retention_days, deleted, "retention purge completed");
    Ok(deleted)
}
