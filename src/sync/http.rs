//! HTTP implementation of [`CommandDispatcher`] on `reqwest`.
//!
//! Commands are posted as JSON to `{base_url}/commands` with the action id
//! as `Idempotency-Key`, so a retry after an ambiguous timeout cannot apply
//! a command twice on a backend that honours the header.

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::config::RemoteConfig;
use crate::errors::DispatchError;
use crate::models::action::QueuedAction;
use crate::models::status::ConnectionStatus;
use crate::{AppError, Result};

use super::dispatcher::{CommandDispatcher, DispatchFuture, DispatchResult};

const MAX_ERROR_BODY: usize = 512;

#[derive(Serialize)]
struct CommandEnvelope<'a> {
    id: &'a str,
    cmd: &'a str,
    args: &'a serde_json::Value,
}

/// Dispatches outbox commands to the backend over HTTP.
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    client: reqwest::Client,
    commands_url: String,
    health_url: String,
    api_token: Option<String>,
}

impl HttpDispatcher {
    /// Build a dispatcher for the configured backend.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be built.
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|err| AppError::Config(format!("failed to build http client: {err}")))?;
        Ok(Self {
            client,
            commands_url: format!("{}/commands", config.base_url),
            health_url: format!("{}{}", config.base_url, config.health_path),
            api_token: config.api_token.clone(),
        })
    }

    async fn send(&self, action: &QueuedAction) -> DispatchResult {
        let envelope = CommandEnvelope {
            id: &action.id,
            cmd: &action.cmd,
            args: &action.args,
        };
        let mut request = self
            .client
            .post(&self.commands_url)
            .header("Idempotency-Key", action.id.as_str())
            .json(&envelope);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| DispatchError::transient(format!("request failed: {err}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| DispatchError::transient(format!("failed to read response: {err}")))?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &body));
        }
        if body.trim().is_empty() {
            return Ok(None);
        }
        match serde_json::from_str(&body) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                debug!(action_id = %action.id, %err, "non-json success body ignored");
                Ok(None)
            }
        }
    }

    async fn health(&self) -> ConnectionStatus {
        let mut request = self.client.get(&self.health_url);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => ConnectionStatus::Connected,
            Ok(response) => {
                debug!(status = response.status().as_u16(), "backend unhealthy");
                ConnectionStatus::Disconnected
            }
            Err(err) => {
                debug!(%err, "backend unreachable");
                ConnectionStatus::Offline
            }
        }
    }
}

impl CommandDispatcher for HttpDispatcher {
    fn dispatch<'a>(&'a self, action: &'a QueuedAction) -> DispatchFuture<'a, DispatchResult> {
        Box::pin(self.send(action))
    }

    fn probe(&self) -> DispatchFuture<'_, ConnectionStatus> {
        Box::pin(self.health())
    }
}

/// Map a non-success HTTP status to a typed failure.
///
/// Timeouts, throttling, and server faults are worth retrying; any other
/// client error means the backend rejected the command.
fn classify_status(code: u16, body: &str) -> DispatchError {
    let body = body.trim();
    let detail = if body.is_empty() {
        format!("remote returned HTTP {code}")
    } else {
        let truncated: String = body.chars().take(MAX_ERROR_BODY).collect();
        format!("remote returned HTTP {code}: {truncated}")
    };
    match code {
        408 | 429 | 500..=599 => DispatchError::transient(detail),
        _ => DispatchError::terminal(detail),
    }
}
