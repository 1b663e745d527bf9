//! Error types for the synchronization core
//!
//! The taxonomy mirrors how failures propagate through the pipeline:
//! transport and configuration errors surface to the user-facing status,
//! everything else is absorbed into warnings on the materialization
//! summary.

use thiserror::Error;

/// Errors that can occur in the synchronization core
#[derive(Debug, Error)]
pub enum SyncError {
    /// Server unreachable, authentication failed, or token expired
    #[error("Transport error: {0}")]
    Transport(String),

    /// Server returned an unparseable or unexpected response
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Event payload does not match its declared schema
    #[error("Validation error: {0}")]
    Validation(String),

    /// Event references a prerequisite that has not materialized yet
    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    /// A single store mutation failed
    #[error("Store statement failed: {0}")]
    StoreStatement(String),

    /// A whole-batch store transaction failed
    #[error("Store transaction failed: {0}")]
    StoreTransaction(String),

    /// Unresolvable identity or missing profile record after max retries
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result type for synchronization operations
pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Whether this error should surface to the user-facing status.
    ///
    /// Only configuration and transport failures do; the rest are
    /// absorbed into warnings on the materialization summary.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncError::Transport(_) | SyncError::Configuration(_))
    }
}

impl From<async_nats::Error> for SyncError {
    fn from(err: async_nats::Error) -> Self {
        SyncError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for SyncError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        SyncError::Transport("request deadline exceeded".to_string())
    }
}
