//! Application facade.
//!
//! [`ResilienceService`] wires the lock store, detector, coordinator,
//! outbox and sync engine together over one database and exposes the entry
//! points a host application (or the CLI) calls. Construct it once and share
//! it by `Arc`.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::liveness::LivenessChecker;
use crate::models::action::{FailedAction, QueuedAction};
use crate::models::lock::StaleLockInfo;
use crate::models::recovery::RecoveryResult;
use crate::models::status::ConnectionStatus;
use crate::outbox::{Outbox, OutboxSnapshot};
use crate::persistence::db::Database;
use crate::persistence::lock_repo::LockRepo;
use crate::persistence::recovery_log_repo::RecoveryLogRepo;
use crate::persistence::retention;
use crate::persistence::task_repo::TaskRepository;
use crate::recovery::scanner::spawn_stale_scanner;
use crate::recovery::{RecoveryCoordinator, StaleSessionDetector};
use crate::sync::connectivity::{spawn_connectivity_probe, ConnectivityMonitor};
use crate::sync::dispatcher::CommandDispatcher;
use crate::sync::engine::{DrainOutcome, RetryPolicy, SyncEngine};
use crate::Result;

/// Handles of the background tasks started by [`ResilienceService::start`].
pub struct ServiceRuntime {
    handles: Vec<JoinHandle<()>>,
}

impl ServiceRuntime {
    /// Number of running background tasks.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every background task to finish. Cancel the token passed to
    /// `start` first.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!(%err, "background task ended abnormally");
            }
        }
    }
}

/// Client-side resilience layer: stale session recovery plus the offline
/// command outbox.
pub struct ResilienceService {
    config: Arc<GlobalConfig>,
    db: Arc<Database>,
    locks: LockRepo,
    outbox: Arc<Outbox>,
    detector: Arc<StaleSessionDetector>,
    coordinator: Arc<RecoveryCoordinator>,
    engine: Arc<SyncEngine>,
    dispatcher: Arc<dyn CommandDispatcher>,
    connectivity: Arc<ConnectivityMonitor>,
}

impl ResilienceService {
    /// Build the service over an open database.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the persisted outbox cannot be loaded.
    pub async fn new(
        config: Arc<GlobalConfig>,
        db: Arc<Database>,
        dispatcher: Arc<dyn CommandDispatcher>,
        tasks: Arc<dyn TaskRepository>,
        liveness: Arc<dyn LivenessChecker>,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> Result<Self> {
        let locks = LockRepo::new(Arc::clone(&db));
        let outbox = Arc::new(Outbox::open(Arc::clone(&db)).await?);
        let detector = Arc::new(StaleSessionDetector::new(
            locks.clone(),
            liveness,
            config.liveness_timeout(),
        ));
        let coordinator = Arc::new(RecoveryCoordinator::new(
            locks.clone(),
            tasks,
            RecoveryLogRepo::new(Arc::clone(&db)),
            Arc::clone(&detector),
        ));
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&outbox),
            Arc::clone(&dispatcher),
            connectivity.subscribe(),
            RetryPolicy::from_config(&config.sync),
            config.dispatch_timeout(),
        ));

        Ok(Self {
            config,
            db,
            locks,
            outbox,
            detector,
            coordinator,
            engine,
            dispatcher,
            connectivity,
        })
    }

    /// Run the startup scan and spawn the background tasks: sync engine,
    /// periodic stale scanner, connectivity probe and retention purge.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the startup scan cannot read the lock store.
    pub async fn start(&self, cancel: CancellationToken) -> Result<ServiceRuntime> {
        if self.config.scan.on_startup {
            self.startup_scan()
                .instrument(info_span!("startup_scan"))
                .await?;
        }

        let mut handles = vec![self.engine.spawn(cancel.clone())];

        if let Some(interval) = self.config.scan_interval() {
            let coordinator = self
                .config
                .scan
                .auto_recover
                .then(|| Arc::clone(&self.coordinator));
            handles.push(spawn_stale_scanner(
                Arc::clone(&self.detector),
                coordinator,
                self.connectivity.subscribe(),
                interval,
                cancel.clone(),
            ));
        }

        if let Some(interval) = self.config.probe_interval() {
            handles.push(spawn_connectivity_probe(
                Arc::clone(&self.connectivity),
                Arc::clone(&self.dispatcher),
                interval,
                cancel.clone(),
            ));
        }

        handles.push(retention::spawn_retention_task(
            Arc::clone(&self.db),
            self.config.retention_days,
            cancel,
        ));

        info!(tasks = handles.len(), "resilience service started");
        Ok(ServiceRuntime { handles })
    }

    async fn startup_scan(&self) -> Result<()> {
        let stale = self.detector.scan().await?;
        if stale.is_empty() {
            info!("no stale sessions found on startup");
            return Ok(());
        }
        info!(count = stale.len(), "found stale sessions on startup");
        if self.config.scan.auto_recover && self.connectivity.current().is_connected() {
            self.coordinator.recover_all(Some(stale)).await?;
        }
        Ok(())
    }

    /// Queue a command. A drain is requested straight away when connected.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Dispatch` for an empty command name or
    /// `AppError::Db` if the outbox cannot be written.
    pub async fn enqueue_command(
        &self,
        cmd: impl Into<String>,
        args: serde_json::Value,
    ) -> Result<QueuedAction> {
        let action = self.outbox.enqueue(cmd, args).await?;
        self.request_drain_if_connected();
        Ok(action)
    }

    /// Put one failed action back at the head of the queue.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if `failed_id` is not in the failed list.
    pub async fn retry_failed(&self, failed_id: &str) -> Result<QueuedAction> {
        let action = self.outbox.retry(failed_id).await?;
        self.request_drain_if_connected();
        Ok(action)
    }

    /// Requeue every failed action and drain.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the outbox cannot be updated.
    pub async fn retry_all_failed(&self) -> Result<DrainOutcome> {
        self.engine.retry_all().await
    }

    /// Discard one failed action.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if `failed_id` is not in the failed list.
    pub async fn dismiss_failed(&self, failed_id: &str) -> Result<()> {
        self.outbox.dismiss(failed_id).await
    }

    /// Discard every failed action; returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the outbox cannot be updated.
    pub async fn clear_failed(&self) -> Result<u64> {
        self.outbox.clear_failed().await
    }

    /// Run one drain pass now.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the outbox cannot be read or updated.
    pub async fn sync_now(&self) -> Result<DrainOutcome> {
        self.engine.drain().await
    }

    /// Recover one session.
    pub async fn recover_session(&self, session_id: &str) -> RecoveryResult {
        self.coordinator.recover(session_id).await
    }

    /// Re-scan and recover every stale session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the lock store cannot be scanned.
    pub async fn recover_all_sessions(&self) -> Result<Vec<RecoveryResult>> {
        self.coordinator.recover_all(None).await
    }

    /// Scan the lock store for stale sessions.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the lock store cannot be listed.
    pub async fn scan_stale_sessions(&self) -> Result<Vec<StaleLockInfo>> {
        self.detector.scan().await
    }

    /// Recovery results, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the recovery log cannot be read.
    pub async fn recent_recoveries(&self, limit: u32) -> Result<Vec<RecoveryResult>> {
        self.coordinator.recent_results(limit).await
    }

    /// Actions waiting to be dispatched, in replay order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the outbox cannot be read.
    pub async fn queued_actions(&self) -> Result<Vec<QueuedAction>> {
        self.outbox.queued().await
    }

    /// Actions awaiting a user decision.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the outbox cannot be read.
    pub async fn failed_actions(&self) -> Result<Vec<FailedAction>> {
        self.outbox.failed().await
    }

    /// Ask the backend for its health and publish the answer.
    pub async fn refresh_connectivity(&self) -> ConnectionStatus {
        let status = self.dispatcher.probe().await;
        self.connectivity.set(status);
        status
    }

    /// Subscribe to outbox snapshots.
    #[must_use]
    pub fn subscribe_outbox(&self) -> watch::Receiver<OutboxSnapshot> {
        self.outbox.subscribe()
    }

    /// Subscribe to the stale session list.
    #[must_use]
    pub fn subscribe_stale(&self) -> watch::Receiver<Vec<StaleLockInfo>> {
        self.detector.subscribe()
    }

    /// Current outbox snapshot.
    #[must_use]
    pub fn outbox_snapshot(&self) -> OutboxSnapshot {
        self.outbox.snapshot()
    }

    /// Stale sessions from the most recent scan.
    #[must_use]
    pub fn stale_sessions(&self) -> Vec<StaleLockInfo> {
        self.detector.stale_sessions()
    }

    /// The session lock store.
    #[must_use]
    pub fn locks(&self) -> &LockRepo {
        &self.locks
    }

    /// The connectivity signal consumed by the sync engine.
    #[must_use]
    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    /// The loaded configuration.
    #[must_use]
    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    fn request_drain_if_connected(&self) {
        if self.connectivity.current().is_connected() {
            self.engine.request_drain();
        }
    }
}
