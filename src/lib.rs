//! Validity-aware content cache with push invalidation and scheduled refresh.

pub mod cache;
pub mod config;
pub mod infra;
pub mod source;
