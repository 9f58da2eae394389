#![forbid(unsafe_code)]

//! `agent-lifeline`: crash recovery and offline command replay for
//! clients of multi-agent orchestration backends.

pub mod config;
pub mod errors;
pub mod liveness;
pub mod models;
pub mod outbox;
pub mod persistence;
pub mod recovery;
pub mod service;
pub mod sync;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
pub use service::ResilienceService;
