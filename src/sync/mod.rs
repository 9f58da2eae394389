//! Outbox synchronisation against the remote command interface.
//!
//! Covers the dispatcher contract and its HTTP implementation, the
//! connectivity signal, and the single-flight drain engine.

pub mod connectivity;
pub mod dispatcher;
pub mod engine;
pub mod http;
