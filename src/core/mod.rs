//! Error types and process-wide readiness state.

pub mod error;
pub mod status;
