//! Process-wide sync and connectivity signals.

use serde::{Deserialize, Serialize};

/// Whether an outbox drain pass is in flight.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// No drain pass running.
    #[default]
    Idle,
    /// A drain pass is running.
    Syncing,
}

/// Reachability of the backend command interface.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Backend reachable and healthy.
    Connected,
    /// Backend unreachable (no network path).
    #[default]
    Offline,
    /// Backend reachable but refusing service.
    Disconnected,
}

impl ConnectionStatus {
    /// Whether remote commands may be dispatched.
    #[must_use]
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}
