//! Agent task records mutated during recovery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AppError, Result};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Unclaimed and waiting for an agent.
    Pending,
    /// Claimed by an agent.
    InProgress,
    /// Finished.
    Completed,
}

impl TaskStatus {
    /// Stable storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    /// Parse the storage representation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` for unknown values.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            other => Err(AppError::Db(format!("invalid task status: {other}"))),
        }
    }
}

/// A unit of agent work that a session may claim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Task {
    /// Unique task identifier.
    pub id: String,
    /// Short description.
    pub title: String,
    /// Current status.
    pub status: TaskStatus,
    /// Session whose agent claimed the task.
    pub assignee_session_id: Option<String>,
    /// Agent within the session that claimed the task.
    pub assignee_agent: Option<String>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Construct an unclaimed pending task.
    #[must_use]
    pub fn new(title: String) -> Self {
        Self {
            id: format!("task:{}", Uuid::new_v4()),
            title,
            status: TaskStatus::Pending,
            assignee_session_id: None,
            assignee_agent: None,
            updated_at: Utc::now(),
        }
    }
}
