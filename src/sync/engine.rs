//! Outbox drain loop.
//!
//! A drain pass replays the outbox head-first against the remote command
//! interface. Only one pass runs at a time; a second caller gets
//! [`DrainOutcome::Skipped`]. The first failure stops the pass because later
//! commands may depend on the one that failed, and while that action sits in
//! the failed list no later command is replayed ([`DrainOutcome::Blocked`]).
//!
//! Transient failures get a bounded number of automatic retries with
//! exponential backoff; terminal failures wait for the user.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::SyncConfig;
use crate::errors::{DispatchError, FailureKind};
use crate::models::status::{ConnectionStatus, SyncStatus};
use crate::outbox::Outbox;
use crate::{AppError, Result};

use super::dispatcher::CommandDispatcher;

/// Highest power of two applied to the initial backoff.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Why a drain request did nothing.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another pass is already running.
    AlreadySyncing,
    /// The backend is not reachable.
    NotConnected,
}

/// What one drain request accomplished.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum DrainOutcome {
    /// Nothing was attempted.
    Skipped {
        /// Why the pass did not run.
        reason: SkipReason,
    },
    /// The queue was emptied.
    Completed {
        /// Actions confirmed in this pass.
        dispatched: usize,
    },
    /// The pass stopped at a failed action, which moved to the failed list.
    Halted {
        /// Actions confirmed before the failure.
        dispatched: usize,
        /// The action that failed.
        action_id: String,
        /// Classification of the failure.
        kind: FailureKind,
        /// Failed attempts recorded for the action, including this one.
        retry_count: u32,
    },
    /// An action issued ahead of the queue head is still in the failed list;
    /// nothing behind it is replayed until it is retried or dismissed.
    Blocked {
        /// Actions confirmed before reaching the blocked entry.
        dispatched: usize,
        /// The unresolved failed action.
        action_id: String,
    },
    /// Connectivity dropped mid-pass; remaining actions stay queued.
    Interrupted {
        /// Actions confirmed before connectivity dropped.
        dispatched: usize,
    },
}

/// Bounded automatic retry schedule for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Automatic retries granted per action.
    pub max_auto_retries: u32,
    /// Delay before the first automatic retry.
    pub initial_backoff: Duration,
    /// Ceiling for the delay.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Policy described by the `[sync]` config section.
    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_auto_retries: config.max_auto_retries,
            initial_backoff: Duration::from_secs(config.initial_backoff_seconds),
            max_backoff: Duration::from_secs(config.max_backoff_seconds),
        }
    }

    /// Delay before retrying an action that has failed `retry_count` times,
    /// or `None` once automatic retries are exhausted.
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Option<Duration> {
        if retry_count == 0 || retry_count > self.max_auto_retries {
            return None;
        }
        let exponent = (retry_count - 1).min(MAX_BACKOFF_EXPONENT);
        Some(
            self.initial_backoff
                .saturating_mul(1 << exponent)
                .min(self.max_backoff),
        )
    }
}

#[derive(Debug)]
struct ScheduledRetry {
    at: Instant,
    action_id: String,
}

/// Replays the outbox against a [`CommandDispatcher`].
pub struct SyncEngine {
    outbox: Arc<Outbox>,
    dispatcher: Arc<dyn CommandDispatcher>,
    connectivity: watch::Receiver<ConnectionStatus>,
    policy: RetryPolicy,
    dispatch_timeout: Duration,
    syncing: AtomicBool,
    wake: Notify,
}

/// Marks one drain pass; clears the single-flight flag and publishes
/// `Idle` when dropped, whichever way the pass ends.
struct SyncPass<'a> {
    engine: &'a SyncEngine,
}

impl<'a> SyncPass<'a> {
    fn begin(engine: &'a SyncEngine) -> Option<Self> {
        engine
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        engine.outbox.publish_sync_status(SyncStatus::Syncing);
        Some(Self { engine })
    }
}

impl Drop for SyncPass<'_> {
    fn drop(&mut self) {
        self.engine.syncing.store(false, Ordering::Release);
        self.engine.outbox.publish_sync_status(SyncStatus::Idle);
    }
}

impl SyncEngine {
    /// Build an engine over `outbox`.
    #[must_use]
    pub fn new(
        outbox: Arc<Outbox>,
        dispatcher: Arc<dyn CommandDispatcher>,
        connectivity: watch::Receiver<ConnectionStatus>,
        policy: RetryPolicy,
        dispatch_timeout: Duration,
    ) -> Self {
        Self {
            outbox,
            dispatcher,
            connectivity,
            policy,
            dispatch_timeout,
            syncing: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// Current sync status.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        if self.syncing.load(Ordering::Acquire) {
            SyncStatus::Syncing
        } else {
            SyncStatus::Idle
        }
    }

    /// The retry schedule in force.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Ask the background loop started by [`spawn`](Self::spawn) to drain.
    pub fn request_drain(&self) {
        self.wake.notify_one();
    }

    fn is_connected(&self) -> bool {
        self.connectivity.borrow().is_connected()
    }

    /// Run one drain pass.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the outbox cannot be read or updated. The
    /// sync status is back to `Idle` either way.
    pub async fn drain(&self) -> Result<DrainOutcome> {
        if !self.is_connected() {
            debug!("drain skipped: not connected");
            return Ok(DrainOutcome::Skipped {
                reason: SkipReason::NotConnected,
            });
        }
        let Some(_pass) = SyncPass::begin(self) else {
            debug!("drain skipped: already syncing");
            return Ok(DrainOutcome::Skipped {
                reason: SkipReason::AlreadySyncing,
            });
        };

        let mut dispatched = 0usize;
        loop {
            if !self.is_connected() {
                info!(dispatched, "drain interrupted: connectivity lost");
                return Ok(DrainOutcome::Interrupted { dispatched });
            }
            let Some(action) = self.outbox.dequeue_head().await? else {
                info!(dispatched, "outbox drained");
                return Ok(DrainOutcome::Completed { dispatched });
            };
            if let Some(blocker) = self.outbox.blocking_failure().await? {
                debug!(
                    dispatched,
                    blocked_by = blocker.id(),
                    head = %action.id,
                    "drain blocked by unresolved failure"
                );
                return Ok(DrainOutcome::Blocked {
                    dispatched,
                    action_id: blocker.action.id,
                });
            }

            let span = info_span!("dispatch", action_id = %action.id, cmd = %action.cmd);
            let result = tokio::time::timeout(self.dispatch_timeout, self.dispatcher.dispatch(&action))
                .instrument(span)
                .await
                .unwrap_or_else(|_| {
                    Err(DispatchError::transient(format!(
                        "dispatch timed out after {}ms",
                        self.dispatch_timeout.as_millis()
                    )))
                });

            match result {
                Ok(_) => {
                    self.outbox.confirm(&action.id).await?;
                    dispatched += 1;
                    debug!(action_id = %action.id, cmd = %action.cmd, "action dispatched");
                }
                Err(err) => {
                    let failed = self.outbox.fail(&action.id, &err).await?;
                    return Ok(DrainOutcome::Halted {
                        dispatched,
                        action_id: action.id,
                        kind: err.kind,
                        retry_count: failed.action.retry_count,
                    });
                }
            }
        }
    }

    /// Move every failed action back into the queue, preserving their
    /// original order ahead of anything still queued, then drain.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the outbox cannot be updated.
    pub async fn retry_all(&self) -> Result<DrainOutcome> {
        let failed = self.outbox.failed().await?;
        // Each retry goes to the head, so walk newest first.
        for action in failed.iter().rev() {
            self.outbox.retry(action.id()).await?;
        }
        info!(count = failed.len(), "failed actions requeued");
        self.drain().await
    }

    /// Spawn the background loop: drain on start, on every transition to
    /// `Connected`, on [`request_drain`](Self::request_drain), and when a
    /// scheduled automatic retry comes due.
    #[must_use]
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(
            async move { engine.run(cancel).await }.instrument(info_span!("sync_engine")),
        )
    }

    async fn run(&self, cancel: CancellationToken) {
        let mut connectivity = self.connectivity.clone();
        let mut scheduled: Option<ScheduledRetry> = None;

        self.drain_and_schedule(&mut scheduled).await;

        loop {
            let retry_at = scheduled.as_ref().map(|retry| retry.at);
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("sync engine shutting down");
                    break;
                }
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        warn!("connectivity signal closed; sync engine stopping");
                        break;
                    }
                    let status = *connectivity.borrow_and_update();
                    if status.is_connected() {
                        self.drain_and_schedule(&mut scheduled).await;
                    }
                }
                () = self.wake.notified() => {
                    self.drain_and_schedule(&mut scheduled).await;
                }
                () = sleep_until(retry_at), if retry_at.is_some() => {
                    if let Some(retry) = scheduled.take() {
                        self.auto_retry(&retry.action_id).await;
                        self.drain_and_schedule(&mut scheduled).await;
                    }
                }
            }
        }
    }

    async fn auto_retry(&self, action_id: &str) {
        match self.outbox.retry(action_id).await {
            Ok(action) => info!(action_id, retry_count = action.retry_count, "automatic retry"),
            Err(AppError::NotFound(_)) => {
                debug!(action_id, "automatic retry skipped; action already resolved");
            }
            Err(err) => error!(action_id, %err, "automatic retry failed"),
        }
    }

    async fn drain_and_schedule(&self, scheduled: &mut Option<ScheduledRetry>) {
        match self.drain().await {
            Ok(DrainOutcome::Halted {
                action_id,
                kind: FailureKind::Transient,
                retry_count,
                ..
            }) => match self.policy.delay_for(retry_count) {
                Some(delay) => {
                    info!(
                        %action_id,
                        retry_count,
                        delay_ms = delay.as_millis(),
                        "automatic retry scheduled"
                    );
                    *scheduled = Some(ScheduledRetry {
                        at: Instant::now() + delay,
                        action_id,
                    });
                }
                None => warn!(%action_id, retry_count, "automatic retries exhausted"),
            },
            Ok(DrainOutcome::Halted {
                action_id,
                kind: FailureKind::Terminal,
                ..
            }) => warn!(%action_id, "action rejected by backend; waiting for user"),
            Ok(DrainOutcome::Blocked { action_id, .. }) if scheduled.is_none() => {
                self.schedule_blocked(&action_id, scheduled).await;
            }
            Ok(outcome) => debug!(?outcome, "drain finished"),
            Err(err) => error!(%err, "drain failed"),
        }
    }

    /// Schedule an automatic retry for a transient failure that blocks the
    /// queue with no retry pending, such as one restored from an earlier run.
    async fn schedule_blocked(&self, action_id: &str, scheduled: &mut Option<ScheduledRetry>) {
        let failed = match self.outbox.failed().await {
            Ok(failed) => failed,
            Err(err) => {
                error!(%err, "cannot read failed actions");
                return;
            }
        };
        let Some(blocker) = failed.iter().find(|failed| failed.id() == action_id) else {
            return;
        };
        if !blocker.is_retryable() {
            debug!(action_id, "queue blocked by rejected action; waiting for user");
            return;
        }
        match self.policy.delay_for(blocker.action.retry_count) {
            Some(delay) => {
                info!(
                    action_id,
                    retry_count = blocker.action.retry_count,
                    delay_ms = delay.as_millis(),
                    "automatic retry scheduled for blocking action"
                );
                *scheduled = Some(ScheduledRetry {
                    at: Instant::now() + delay,
                    action_id: action_id.to_owned(),
                });
            }
            None => debug!(action_id, "queue blocked; automatic retries exhausted"),
        }
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
