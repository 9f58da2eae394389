//! Stale session detection.
//!
//! A lock is stale when its owner pid is positively dead. Locks whose owner
//! cannot be probed (timeout, inconclusive answer) are left out: a false
//! positive would release tasks a live agent is still working on.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::liveness::{check_within, Liveness, LivenessChecker};
use crate::models::lock::{SessionLock, StaleLockInfo};
use crate::persistence::lock_repo::LockRepo;
use crate::Result;

/// Finds locks whose owning process is gone and publishes them.
pub struct StaleSessionDetector {
    locks: LockRepo,
    liveness: Arc<dyn LivenessChecker>,
    check_timeout: Duration,
    stale_tx: watch::Sender<Vec<StaleLockInfo>>,
}

impl StaleSessionDetector {
    /// Build a detector over `locks`. Each liveness check that takes longer
    /// than `check_timeout` counts as [`Liveness::Unknown`].
    #[must_use]
    pub fn new(
        locks: LockRepo,
        liveness: Arc<dyn LivenessChecker>,
        check_timeout: Duration,
    ) -> Self {
        let (stale_tx, _) = watch::channel(Vec::new());
        Self {
            locks,
            liveness,
            check_timeout,
            stale_tx,
        }
    }

    /// Check every lock and return the stale ones.
    ///
    /// The result is also published to subscribers, de-duplicated by
    /// session id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the lock store cannot be listed.
    pub async fn scan(&self) -> Result<Vec<StaleLockInfo>> {
        let locks = self.locks.list().await?;
        if locks.is_empty() {
            debug!("stale scan: no locks held");
            self.publish(Vec::new());
            return Ok(Vec::new());
        }

        let verdicts = join_all(locks.iter().map(|lock| self.owner_liveness(lock))).await;

        let mut seen = HashSet::new();
        let mut stale = Vec::new();
        for (lock, liveness) in locks.iter().zip(verdicts) {
            match liveness {
                Liveness::Alive => {}
                Liveness::Dead => {
                    if seen.insert(lock.session_id.clone()) {
                        stale.push(lock.to_stale());
                    }
                }
                Liveness::Unknown => warn!(
                    session_id = %lock.session_id,
                    pid = lock.owner_pid,
                    "owner liveness unknown; not reporting as stale"
                ),
            }
        }

        info!(locks = locks.len(), stale = stale.len(), "stale scan complete");
        self.publish(stale.clone());
        Ok(stale)
    }

    /// Probe the owner of `lock`, bounded by the check timeout.
    pub async fn owner_liveness(&self, lock: &SessionLock) -> Liveness {
        check_within(
            self.check_timeout,
            lock.owner_pid,
            self.liveness.check(lock.owner_pid),
        )
        .await
    }

    /// Stale sessions from the most recent scan.
    #[must_use]
    pub fn stale_sessions(&self) -> Vec<StaleLockInfo> {
        self.stale_tx.borrow().clone()
    }

    /// Subscribe to the published stale list.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<StaleLockInfo>> {
        self.stale_tx.subscribe()
    }

    /// Drop a recovered session from the published list.
    pub(crate) fn forget(&self, session_id: &str) {
        self.stale_tx.send_if_modified(|stale| {
            let before = stale.len();
            stale.retain(|info| info.session_id != session_id);
            stale.len() != before
        });
    }

    fn publish(&self, stale: Vec<StaleLockInfo>) {
        self.stale_tx.send_if_modified(|current| {
            if *current == stale {
                false
            } else {
                *current = stale;
                true
            }
        });
    }
}
