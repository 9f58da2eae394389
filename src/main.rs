#![forbid(unsafe_code)]

//! `agent-lifeline`: stale session recovery and offline outbox replay.
//!
//! `run` keeps the service alive until ctrl-c or SIGTERM; every other
//! subcommand performs one operation against the local store and prints the
//! result as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use agent_lifeline::config::GlobalConfig;
use agent_lifeline::liveness::OsLivenessChecker;
use agent_lifeline::models::lock::SessionLock;
use agent_lifeline::persistence::db;
use agent_lifeline::persistence::task_repo::SqliteTaskRepo;
use agent_lifeline::sync::connectivity::ConnectivityMonitor;
use agent_lifeline::sync::http::HttpDispatcher;
use agent_lifeline::{AppError, ResilienceService, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "agent-lifeline",
    about = "Stale session recovery and offline command replay",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the service until interrupted.
    Run,

    /// List sessions whose owning process is gone.
    Scan,

    /// Release the tasks and lock of stale sessions.
    #[command(group(ArgGroup::new("target").required(true).args(["session_id", "all"])))]
    Recover {
        /// Session to recover.
        session_id: Option<String>,

        /// Recover every session the scan reports stale.
        #[arg(long)]
        all: bool,
    },

    /// Inspect or manage the offline outbox.
    Outbox {
        #[command(subcommand)]
        action: OutboxCommand,
    },

    /// Drain the outbox now.
    Sync,

    /// Manage session locks.
    Locks {
        #[command(subcommand)]
        action: LocksCommand,
    },

    /// Show recent recovery results.
    History {
        /// Maximum number of entries.
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[derive(Debug, Subcommand)]
enum OutboxCommand {
    /// Show queued and failed actions.
    List,

    /// Queue a command for dispatch.
    Enqueue {
        /// Command name.
        cmd: String,

        /// Command arguments as JSON.
        #[arg(long, default_value = "{}")]
        args: String,
    },

    /// Put a failed action back at the head of the queue and drain.
    Retry {
        /// Failed action ID.
        id: String,
    },

    /// Requeue every failed action and drain.
    RetryAll,

    /// Discard a failed action.
    Dismiss {
        /// Failed action ID.
        id: String,
    },

    /// Discard every failed action.
    ClearFailed,
}

#[derive(Debug, Subcommand)]
enum LocksCommand {
    /// List held locks.
    List,

    /// Create or refresh a lock.
    Put {
        /// Session ID.
        session_id: String,

        /// Owning process id; defaults to this process.
        #[arg(long)]
        pid: Option<u32>,
    },

    /// Delete a lock.
    Remove {
        /// Session ID.
        session_id: String,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    config.load_credentials().await?;
    let service = build_service(config).await?;

    match args.command {
        Command::Run => serve(&service).await,
        Command::Scan => print_json(&service.scan_stale_sessions().await?),
        Command::Recover { session_id, all } => {
            if all {
                print_json(&service.recover_all_sessions().await?)
            } else {
                let session_id = session_id
                    .ok_or_else(|| AppError::Config("a session id or --all is required".into()))?;
                print_json(&service.recover_session(&session_id).await)
            }
        }
        Command::Outbox { action } => outbox_command(&service, action).await,
        Command::Sync => {
            service.refresh_connectivity().await;
            print_json(&service.sync_now().await?)
        }
        Command::Locks { action } => locks_command(&service, action).await,
        Command::History { limit } => print_json(&service.recent_recoveries(limit).await?),
    }
}

async fn build_service(config: GlobalConfig) -> Result<ResilienceService> {
    let db_path = config.db_path().to_string_lossy().to_string();
    let db = Arc::new(db::connect(&db_path).await?);

    let dispatcher = Arc::new(HttpDispatcher::new(&config.remote)?);
    let tasks = Arc::new(SqliteTaskRepo::new(Arc::clone(&db)));
    let liveness = Arc::new(OsLivenessChecker::new(config.liveness_timeout()));
    let connectivity = Arc::new(ConnectivityMonitor::default());

    ResilienceService::new(
        Arc::new(config),
        db,
        dispatcher,
        tasks,
        liveness,
        connectivity,
    )
    .await
}

async fn serve(service: &ResilienceService) -> Result<()> {
    let status = service.refresh_connectivity().await;
    info!(?status, "initial connectivity");

    let ct = CancellationToken::new();
    let runtime = service.start(ct.clone()).await?;
    info!("agent-lifeline ready");

    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    runtime.join().await;
    info!("agent-lifeline shut down");
    Ok(())
}

async fn outbox_command(service: &ResilienceService, action: OutboxCommand) -> Result<()> {
    match action {
        OutboxCommand::List => {
            #[derive(Serialize)]
            struct Listing {
                queued: Vec<agent_lifeline::models::action::QueuedAction>,
                failed: Vec<agent_lifeline::models::action::FailedAction>,
            }
            print_json(&Listing {
                queued: service.queued_actions().await?,
                failed: service.failed_actions().await?,
            })
        }
        OutboxCommand::Enqueue { cmd, args } => {
            let args: serde_json::Value = serde_json::from_str(&args)
                .map_err(|err| AppError::Config(format!("--args is not valid JSON: {err}")))?;
            print_json(&service.enqueue_command(cmd, args).await?)
        }
        OutboxCommand::Retry { id } => {
            service.retry_failed(&id).await?;
            service.refresh_connectivity().await;
            print_json(&service.sync_now().await?)
        }
        OutboxCommand::RetryAll => {
            service.refresh_connectivity().await;
            print_json(&service.retry_all_failed().await?)
        }
        OutboxCommand::Dismiss { id } => {
            service.dismiss_failed(&id).await?;
            print_json(&service.outbox_snapshot())
        }
        OutboxCommand::ClearFailed => {
            let removed = service.clear_failed().await?;
            print_json(&serde_json::json!({ "removed": removed }))
        }
    }
}

async fn locks_command(service: &ResilienceService, action: LocksCommand) -> Result<()> {
    let locks = service.locks();
    match action {
        LocksCommand::List => print_json(&locks.list().await?),
        LocksCommand::Put { session_id, pid } => {
            let lock = SessionLock::new(session_id, pid.unwrap_or_else(std::process::id));
            locks.put(&lock).await?;
            print_json(&lock)
        }
        LocksCommand::Remove { session_id } => {
            if !locks.remove(&session_id).await? {
                return Err(AppError::NotFound(format!("no lock for session {session_id}")));
            }
            print_json(&serde_json::json!({ "removed": session_id }))
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = await_ctrl_c(ctrl_c) => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                await_ctrl_c(ctrl_c).await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        await_ctrl_c(ctrl_c).await;
    }
}

/// Wait for ctrl-c. Returns `false` if the handler could not be installed.
async fn await_ctrl_c(signal: impl std::future::Future<Output = std::io::Result<()>>) -> bool {
    match signal.await {
        Ok(()) => true,
        Err(err) => {
            tracing::error!(%err, "ctrl-c signal handler failed");
            false
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries command output.
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
