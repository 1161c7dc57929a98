//! Error types for the cluster delivery crate
//!
//! Only setup paths (registration, channel construction) return errors.
//! Per-key delivery failures are logged and counted, never propagated.

use thiserror::Error;

/// Cluster delivery error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Registry at capacity ({0} sessions)")]
    AtCapacity(usize),
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
