//! Error types for the audit trail.

use thiserror::Error;

/// Errors that can occur during audit operations.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Failed to serialize an entry.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A caller supplied an unusable argument.
    #[error("invalid argument: {reason}")]
    ArgumentInvalid {
        /// Why the argument was rejected.
        reason: String,
    },

    /// The auditor was disposed.
    #[error("auditor has been disposed")]
    ResourceDisposed,
}

/// Result type alias for audit operations.
pub type Result<T> = std::result::Result<T, AuditError>;
