//! Validation error types.
//!
//! Only misuse is reported as an error. A check that fails or cannot finish
//! is recorded inside the returned [`ValidationResult`](crate::ValidationResult).

use thiserror::Error;

/// Errors returned by the cleanup validator.
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    /// A caller supplied an unusable argument.
    #[error("invalid argument '{field}': {reason}")]
    ArgumentInvalid {
        /// The offending argument.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// The validator was disposed.
    #[error("cleanup validator has been disposed")]
    ResourceDisposed,

    /// Periodic validation needs a tokio runtime and none is running.
    #[error("no tokio runtime is available to run periodic validation")]
    RuntimeUnavailable,
}

impl ValidationError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::ArgumentInvalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Result type for validator operations.
pub type Result<T> = std::result::Result<T, ValidationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_argument_names_field() {
        let err = ValidationError::invalid("operation_id", "cannot be empty");
        assert_eq!(
            err.to_string(),
            "invalid argument 'operation_id': cannot be empty"
        );
    }
}
