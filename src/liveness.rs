//! Process liveness checks.
//!
//! This is the only OS-specific surface of the crate. Unix probes with
//! `kill(pid, 0)`; other platforms ask `sysinfo` for the process table.
//!
//! Liveness is a point-in-time heuristic: the OS may reuse a pid as soon as
//! its process exits. Anything that cannot be answered within the probe
//! timeout is [`Liveness::Unknown`], which callers must not treat as dead.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

/// Answer of a liveness probe.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    /// A process with this pid is running.
    Alive,
    /// No process with this pid exists, or the pid is invalid.
    Dead,
    /// The probe timed out or gave an inconclusive answer.
    Unknown,
}

/// Boxed future returned by [`LivenessChecker`] methods.
pub type LivenessFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Reports whether a process id is currently running on this host.
///
/// Implementations never fail: invalid pids are [`Liveness::Dead`] and
/// probe problems are [`Liveness::Unknown`].
pub trait LivenessChecker: Send + Sync {
    /// Probe `pid`.
    fn check(&self, pid: u32) -> LivenessFuture<'_, Liveness>;

    /// `true` only when the probe positively found the process.
    fn is_alive(&self, pid: u32) -> LivenessFuture<'_, bool> {
        Box::pin(async move { self.check(pid).await == Liveness::Alive })
    }
}

/// Liveness checker backed by the host operating system.
#[derive(Debug, Clone)]
pub struct OsLivenessChecker {
    timeout: Duration,
}

impl OsLivenessChecker {
    /// Build a checker whose probes give up after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn probe_with_timeout(&self, pid: u32) -> Liveness {
        if !is_valid_pid(pid) {
            debug!(pid, "pid outside the valid range; treating as dead");
            return Liveness::Dead;
        }

        let task = async move {
            match tokio::task::spawn_blocking(move || probe(pid)).await {
                Ok(liveness) => liveness,
                Err(err) => {
                    warn!(pid, %err, "liveness probe task failed");
                    Liveness::Unknown
                }
            }
        };
        check_within(self.timeout, pid, task).await
    }
}

/// Await a liveness answer for `pid`, giving up with [`Liveness::Unknown`]
/// once `timeout` has passed.
pub async fn check_within<F>(timeout: Duration, pid: u32, check: F) -> Liveness
where
    F: Future<Output = Liveness>,
{
    if let Ok(liveness) = tokio::time::timeout(timeout, check).await {
        liveness
    } else {
        warn!(pid, timeout_ms = timeout.as_millis(), "liveness probe timed out");
        Liveness::Unknown
    }
}

impl LivenessChecker for OsLivenessChecker {
    fn check(&self, pid: u32) -> LivenessFuture<'_, Liveness> {
        Box::pin(self.probe_with_timeout(pid))
    }
}

/// Pid 0 addresses the caller's process group and values above `i32::MAX`
/// wrap negative on Unix, so neither can name a single process.
fn is_valid_pid(pid: u32) -> bool {
    pid > 0 && i32::try_from(pid).is_ok()
}

#[cfg(unix)]
fn probe(pid: u32) -> Liveness {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return Liveness::Dead;
    };
    // Signal 0 only checks existence.
    match kill(Pid::from_raw(raw), None) {
        // EPERM: the process exists but belongs to another user.
        Ok(()) | Err(Errno::EPERM) => Liveness::Alive,
        Err(Errno::ESRCH) => Liveness::Dead,
        Err(err) => {
            debug!(pid, %err, "inconclusive kill(0) result");
            Liveness::Unknown
        }
    }
}

#[cfg(not(unix))]
fn probe(pid: u32) -> Liveness {
    use sysinfo::{Pid, System};

    let mut system = System::new();
    if system.refresh_process(Pid::from_u32(pid)) {
        Liveness::Alive
    } else {
        Liveness::Dead
    }
}
