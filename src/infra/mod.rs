//! Errors and runtime bootstrap.

pub mod error;
pub mod telemetry;
