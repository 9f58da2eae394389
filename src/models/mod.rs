//! Domain model module declarations.

pub mod action;
pub mod lock;
pub mod recovery;
pub mod status;
pub mod task;
