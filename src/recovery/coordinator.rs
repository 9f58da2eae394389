//! Recovery of stale sessions.
//!
//! Recovering a session releases every task its agents claimed and then
//! deletes its lock. The lock goes last: if any task cannot be released the
//! lock stays, so the session is still reported stale on the next scan and
//! the whole recovery can simply be run again.
//!
//! Recovery is single-flight per session id. A concurrent second call waits
//! for the first and then finds no lock, which is a successful no-op.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::join_all;
use tracing::{info, info_span, warn, Instrument};

use crate::liveness::Liveness;
use crate::models::lock::StaleLockInfo;
use crate::models::recovery::RecoveryResult;
use crate::persistence::lock_repo::LockRepo;
use crate::persistence::recovery_log_repo::RecoveryLogRepo;
use crate::persistence::task_repo::TaskRepository;
use crate::Result;

use super::detector::StaleSessionDetector;

type SessionGate = Arc<tokio::sync::Mutex<()>>;

/// Releases the work of stale sessions.
pub struct RecoveryCoordinator {
    locks: LockRepo,
    tasks: Arc<dyn TaskRepository>,
    log: RecoveryLogRepo,
    detector: Arc<StaleSessionDetector>,
    in_flight: Mutex<HashMap<String, SessionGate>>,
}

impl RecoveryCoordinator {
    /// Build a coordinator.
    #[must_use]
    pub fn new(
        locks: LockRepo,
        tasks: Arc<dyn TaskRepository>,
        log: RecoveryLogRepo,
        detector: Arc<StaleSessionDetector>,
    ) -> Self {
        Self {
            locks,
            tasks,
            log,
            detector,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Recover one session.
    ///
    /// Never fails: problems are reported through
    /// [`RecoveryResult::success`] and the result is appended to the
    /// recovery log.
    pub async fn recover(&self, session_id: &str) -> RecoveryResult {
        let gate = self.gate_for(session_id);
        let result = {
            let _held = gate.lock().await;
            self.recover_locked(session_id)
                .instrument(info_span!("recover_session", session_id))
                .await
        };
        self.release_gate(session_id, gate);

        if result.success {
            self.detector.forget(session_id);
        }
        if let Err(err) = self.log.append(&result).await {
            warn!(session_id, %err, "failed to record recovery result");
        }
        result
    }

    /// Recover every session in `stale_sessions`, or every session found by
    /// a fresh scan when `None`.
    ///
    /// Sessions are recovered concurrently and independently; duplicates are
    /// recovered once.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` only if the re-scan cannot read the lock store.
    pub async fn recover_all(
        &self,
        stale_sessions: Option<Vec<StaleLockInfo>>,
    ) -> Result<Vec<RecoveryResult>> {
        let stale = match stale_sessions {
            Some(list) => list,
            None => self.detector.scan().await?,
        };

        let mut seen = HashSet::new();
        let session_ids: Vec<String> = stale
            .into_iter()
            .filter(|info| seen.insert(info.session_id.clone()))
            .map(|info| info.session_id)
            .collect();

        let results = join_all(session_ids.iter().map(|id| self.recover(id))).await;
        let failed = results.iter().filter(|r| !r.success).count();
        info!(
            sessions = results.len(),
            failed, "batch recovery complete"
        );
        Ok(results)
    }

    /// Recent results, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the log cannot be read.
    pub async fn recent_results(&self, limit: u32) -> Result<Vec<RecoveryResult>> {
        self.log.list_recent(limit).await
    }

    async fn recover_locked(&self, session_id: &str) -> RecoveryResult {
        let lock = match self.locks.get(session_id).await {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                info!("no lock held; nothing to recover");
                return RecoveryResult::succeeded(session_id, 0, "no lock held; nothing to recover");
            }
            Err(err) => {
                warn!(%err, "lock store unavailable");
                return RecoveryResult::failed(session_id, 0, format!("lock store unavailable: {err}"));
            }
        };

        if self.detector.owner_liveness(&lock).await == Liveness::Alive {
            warn!(pid = lock.owner_pid, "owner process is alive; refusing to recover");
            return RecoveryResult::failed(
                session_id,
                0,
                format!("owner process {} is still running", lock.owner_pid),
            );
        }

        let tasks = match self.tasks.find_by_assignee(session_id).await {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(%err, "failed to list claimed tasks; lock retained");
                return RecoveryResult::failed(
                    session_id,
                    0,
                    format!("failed to list claimed tasks: {err}"),
                );
            }
        };

        let mut unassigned: u32 = 0;
        for task in &tasks {
            if let Err(err) = self.tasks.unassign(&task.id).await {
                warn!(task_id = %task.id, unassigned, %err, "failed to unassign task; lock retained");
                return RecoveryResult::failed(
                    session_id,
                    unassigned,
                    format!(
                        "unassigned {unassigned} of {} task(s) before failing on {}: {err}",
                        tasks.len(),
                        task.id
                    ),
                );
            }
            unassigned += 1;
        }

        match self.locks.remove_if(&lock).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(unassigned, "lock refreshed during recovery; left in place");
                return RecoveryResult::failed(
                    session_id,
                    unassigned,
                    format!(
                        "lock refreshed during recovery; released {unassigned} task(s) but kept the new lock"
                    ),
                );
            }
            Err(err) => {
                warn!(%err, "tasks released but lock removal failed");
                return RecoveryResult::failed(
                    session_id,
                    unassigned,
                    format!("released {unassigned} task(s) but failed to remove lock: {err}"),
                );
            }
        }

        info!(pid = lock.owner_pid, unassigned, "session recovered");
        RecoveryResult::succeeded(
            session_id,
            unassigned,
            format!(
                "released lock held by pid {}; unassigned {unassigned} task(s)",
                lock.owner_pid
            ),
        )
    }

    fn gate_for(&self, session_id: &str) -> SessionGate {
        let mut gates = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(session_id.to_owned()).or_default())
    }

    /// Drop the gate entry once no other caller holds or awaits it.
    fn release_gate(&self, session_id: &str, gate: SessionGate) {
        let mut gates = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map plus ours.
        if Arc::strong_count(&gate) == 2 {
            gates.remove(session_id);
        }
    }

    #[cfg(test)]
    fn gate_count(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
