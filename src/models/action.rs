//! Outbox entries: commands awaiting remote confirmation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::FailureKind;

/// A command that has not yet been confirmed by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct QueuedAction {
    /// Unique action identifier (UUID v4 prefixed `act:`). Sent as idempotency key.
    pub id: String,
    /// Remote command name.
    pub cmd: String,
    /// Command arguments.
    pub args: serde_json::Value,
    /// When the command was issued.
    pub timestamp: DateTime<Utc>,
    /// Failed dispatch attempts so far.
    pub retry_count: u32,
}

impl QueuedAction {
    /// Construct a fresh action with a generated identifier.
    #[must_use]
    pub fn new(cmd: String, args: serde_json::Value) -> Self {
        Self {
            id: format!("act:{}", Uuid::new_v4()),
            cmd,
            args,
            timestamp: Utc::now(),
            retry_count: 0,
        }
    }
}

/// A queued action whose last dispatch attempt failed.
///
/// Remains visible until the user retries or dismisses it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct FailedAction {
    /// The action as it was queued, with `retry_count` already incremented.
    #[serde(flatten)]
    pub action: QueuedAction,
    /// Diagnostic from the failed attempt.
    pub last_error: String,
    /// Whether retrying may help.
    pub kind: FailureKind,
    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
}

impl FailedAction {
    /// Identifier of the underlying action.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.action.id
    }

    /// Whether the UI should offer a blind retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}
