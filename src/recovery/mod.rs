//! Stale session detection and recovery.

pub mod coordinator;
pub mod detector;
pub mod scanner;

pub use coordinator::RecoveryCoordinator;
pub use detector::StaleSessionDetector;
