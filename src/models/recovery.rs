//! Outcome records of stale session recovery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal record of one recovery attempt. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RecoveryResult {
    /// Session the attempt targeted.
    pub session_id: String,
    /// Whether every claimed task was released and the lock removed.
    pub success: bool,
    /// Human-readable outcome or diagnostic.
    pub message: String,
    /// Tasks whose assignment was cleared during this attempt.
    pub tasks_unassigned: u32,
    /// When the attempt finished.
    pub recovered_at: DateTime<Utc>,
}

impl RecoveryResult {
    /// A successful attempt.
    #[must_use]
    pub fn succeeded(session_id: &str, tasks_unassigned: u32, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.to_owned(),
            success: true,
            message: message.into(),
            tasks_unassigned,
            recovered_at: Utc::now(),
        }
    }

    /// A failed or partial attempt; the session stays stale.
    #[must_use]
    pub fn failed(session_id: &str, tasks_unassigned: u32, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.to_owned(),
            success: false,
            message: message.into(),
            tasks_unassigned,
            recovered_at: Utc::now(),
        }
    }
}
