//! Connectivity signal shared by the sync engine and the stale scanner.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

use crate::models::status::ConnectionStatus;

use super::dispatcher::CommandDispatcher;

/// Publishes the current [`ConnectionStatus`].
///
/// The status is owned by whoever observes the network (a probe task, the
/// host application); this layer only reads it through [`subscribe`](Self::subscribe).
#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<ConnectionStatus>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectionStatus::default())
    }
}

impl ConnectivityMonitor {
    /// Start with `initial` status.
    #[must_use]
    pub fn new(initial: ConnectionStatus) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Publish `status`. Subscribers are only woken on an actual change;
    /// returns whether the status changed.
    pub fn set(&self, status: ConnectionStatus) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            info!(?status, "connectivity changed");
        }
        changed
    }

    /// Latest published status.
    #[must_use]
    pub fn current(&self) -> ConnectionStatus {
        *self.tx.borrow()
    }

    /// Receiver that observes every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }
}

/// Spawn a task that probes `dispatcher` every `interval` and publishes the
/// answer on `monitor` until `cancel` fires.
#[must_use]
pub fn spawn_connectivity_probe(
    monitor: Arc<ConnectivityMonitor>,
    dispatcher: Arc<dyn CommandDispatcher>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("connectivity probe shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let status = dispatcher.probe().await;
                        monitor.set(status);
                    }
                }
            }
        }
        .instrument(info_span!("connectivity_probe")),
    )
}
