//! Error types shared across the application.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Remote command dispatch failure.
    Dispatch(DispatchError),
    /// Requested entity does not exist.
    NotFound(String),
    /// Process liveness probe failure.
    Liveness(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Dispatch(err) => write!(f, "dispatch: {err}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Liveness(msg) => write!(f, "liveness: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Db(format!("invalid json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        Self::Dispatch(err)
    }
}

/// Classification of a remote command failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network unreachable, remote timeout, or a server-side fault. Safe to retry.
    Transient,
    /// The remote rejected the command as invalid. Retrying unchanged will not help.
    Terminal,
}

impl FailureKind {
    /// Stable storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Terminal => "terminal",
        }
    }

    /// Parse the storage representation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` for unknown values.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "transient" => Ok(Self::Transient),
            "terminal" => Ok(Self::Terminal),
            other => Err(AppError::Db(format!("invalid failure kind: {other}"))),
        }
    }
}

/// Typed failure returned by a [`CommandDispatcher`](crate::sync::dispatcher::CommandDispatcher).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchError {
    /// Whether the failure is worth retrying.
    pub kind: FailureKind,
    /// Human-readable diagnostic.
    pub message: String,
}

impl DispatchError {
    /// Build a transient failure.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    /// Build a terminal (validation) failure.
    #[must_use]
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Terminal,
            message: message.into(),
        }
    }

    /// Whether this failure may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

impl Display for DispatchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failure: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for DispatchError {}
