//! Remote command interface consumed by the sync engine.

use std::future::Future;
use std::pin::Pin;

use crate::errors::DispatchError;
use crate::models::action::QueuedAction;
use crate::models::status::ConnectionStatus;

/// Result of one remote dispatch: an optional response body or a typed failure.
pub type DispatchResult = std::result::Result<Option<serde_json::Value>, DispatchError>;

/// Boxed future returned by [`CommandDispatcher`] methods.
pub type DispatchFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Backend endpoint that executes queued commands.
///
/// Failures must be classified: [`FailureKind::Transient`](crate::errors::FailureKind::Transient)
/// for network problems and timeouts,
/// [`FailureKind::Terminal`](crate::errors::FailureKind::Terminal) when the
/// backend rejects the command itself.
pub trait CommandDispatcher: Send + Sync {
    /// Execute `action` remotely. `action.id` is stable across retries and
    /// may be used by the backend to de-duplicate.
    fn dispatch<'a>(&'a self, action: &'a QueuedAction) -> DispatchFuture<'a, DispatchResult>;

    /// Probe backend reachability. Dispatchers without a health check report
    /// themselves connected.
    fn probe(&self) -> DispatchFuture<'_, ConnectionStatus> {
        Box::pin(async { ConnectionStatus::Connected })
    }
}
