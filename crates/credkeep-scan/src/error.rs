//! Error types for the scanner.

use thiserror::Error;

/// Errors raised by pattern management and scanning.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScanError {
    /// A caller supplied an unusable argument.
    #[error("invalid argument: {reason}")]
    ArgumentInvalid {
        /// Why the argument was rejected.
        reason: String,
    },

    /// A pattern exceeded its time budget and was skipped.
    #[error("pattern {pattern} exceeded its {budget_ms}ms budget")]
    PatternEngineTimeout {
        /// Pattern name.
        pattern: String,
        /// Budget in milliseconds.
        budget_ms: u64,
    },
}

/// Result type alias for scanner operations.
pub type Result<T> = std::result::Result<T, ScanError>;
