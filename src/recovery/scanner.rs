//! Periodic stale-session scan.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use crate::models::status::ConnectionStatus;

use super::coordinator::RecoveryCoordinator;
use super::detector::StaleSessionDetector;

/// Spawn the stale scanner.
///
/// Every `interval` the task re-scans the lock store. When `coordinator` is
/// set, stale sessions found while connected are recovered immediately;
/// otherwise they are only published for the user to act on.
#[must_use]
pub fn spawn_stale_scanner(
    detector: Arc<StaleSessionDetector>,
    coordinator: Option<Arc<RecoveryCoordinator>>,
    connectivity: watch::Receiver<ConnectionStatus>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; startup already scanned.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("stale scanner shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        scan_once(&detector, coordinator.as_deref(), &connectivity).await;
                    }
                }
            }
        }
        .instrument(info_span!("stale_scanner")),
    )
}

async fn scan_once(
    detector: &StaleSessionDetector,
    coordinator: Option<&RecoveryCoordinator>,
    connectivity: &watch::Receiver<ConnectionStatus>,
) {
    let stale = match detector.scan().await {
        Ok(stale) => stale,
        Err(err) => {
            error!(%err, "stale scan failed");
            return;
        }
    };
    if stale.is_empty() {
        return;
    }
    let Some(coordinator) = coordinator else {
        return;
    };
    if !connectivity.borrow().is_connected() {
        info!(stale = stale.len(), "auto-recovery deferred until connected");
        return;
    }
    if let Err(err) = coordinator.recover_all(Some(stale)).await {
        error!(%err, "auto-recovery failed");
    }
}
