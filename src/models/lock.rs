//! Session ownership locks and their stale projection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable record that a session is owned by a running process.
///
/// Written by the session lifecycle owner when a session starts an
/// agent-bearing process and refreshed on every heartbeat. This crate only
/// reads and deletes locks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionLock {
    /// Session the lock belongs to.
    pub session_id: String,
    /// Process id of the owning process.
    pub owner_pid: u32,
    /// Most recent heartbeat written by the owner.
    pub heartbeat_at: DateTime<Utc>,
}

impl SessionLock {
    /// Construct a lock stamped with the current time.
    #[must_use]
    pub fn new(session_id: String, owner_pid: u32) -> Self {
        Self {
            session_id,
            owner_pid,
            heartbeat_at: Utc::now(),
        }
    }

    /// Project this lock into a stale-lock report.
    #[must_use]
    pub fn to_stale(&self) -> StaleLockInfo {
        StaleLockInfo {
            session_id: self.session_id.clone(),
            pid: self.owner_pid,
            timestamp: self.heartbeat_at,
        }
    }
}

/// A lock whose owning process is no longer running.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StaleLockInfo {
    /// Session the stale lock belongs to.
    pub session_id: String,
    /// Process id recorded in the lock.
    pub pid: u32,
    /// Last heartbeat recorded in the lock.
    pub timestamp: DateTime<Utc>,
}
