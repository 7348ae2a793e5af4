//! Error types for secret storage.

use thiserror::Error;

/// Errors that can occur while storing, encrypting or clearing secrets.
///
/// Reasons never include secret material.
#[derive(Debug, Error)]
pub enum SecretsError {
    /// A caller supplied an unusable argument.
    #[error("invalid argument: {reason}")]
    ArgumentInvalid {
        /// Why the argument was rejected.
        reason: String,
    },

    /// The component was torn down.
    #[error("{component} has been disposed")]
    ResourceDisposed {
        /// Which component.
        component: &'static str,
    },

    /// Encryption or decryption failed.
    #[error("encryption error: {reason}")]
    EncryptionError {
        /// The reason encryption failed.
        reason: String,
    },

    /// The key version a payload was sealed with is no longer retained.
    #[error("key version {version} is no longer available")]
    KeyVersionUnavailable {
        /// Requested key version.
        version: u32,
    },

    /// Background tasks need a tokio runtime and none is running.
    #[error("no tokio runtime is available to run background tasks")]
    RuntimeUnavailable,
}

impl SecretsError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::ArgumentInvalid {
            reason: reason.into(),
        }
    }
}

/// Result type alias for secrets operations.
pub type Result<T> = std::result::Result<T, SecretsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formats_correctly() {
        let err = SecretsError::invalid("secret cannot be empty");
        assert_eq!(err.to_string(), "invalid argument: secret cannot be empty");

        let err = SecretsError::ResourceDisposed {
            component: "secret container",
        };
        assert_eq!(err.to_string(), "secret container has been disposed");

        let err = SecretsError::KeyVersionUnavailable { version: 2 };
        assert_eq!(err.to_string(), "key version 2 is no longer available");
    }
}
