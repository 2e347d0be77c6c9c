//! Runtime bootstrap: telemetry and the binary's error type.

pub mod error;
pub mod telemetry;
