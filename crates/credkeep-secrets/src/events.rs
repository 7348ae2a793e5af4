//! Events published by the lifecycle manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::SecretKind;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    /// A token was stored.
    TokenStored,
    /// A token was read back.
    TokenRetrieved,
    /// The encryption key was rotated.
    KeyRotation,
    /// All held secrets were erased.
    SecurityStateCleared,
    /// A stored secret expired.
    SecretExpired,
}

/// A security-relevant state change. Never carries secret material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// What happened.
    pub kind: SecurityEventKind,
    /// Affected slot, when one applies.
    pub secret_kind: Option<SecretKind>,
    /// When it happened.
    pub at: DateTime<Utc>,
}

impl SecurityEvent {
    pub(crate) fn now(kind: SecurityEventKind, secret_kind: Option<SecretKind>) -> Self {
        Self {
            kind,
            secret_kind,
            at: Utc::now(),
        }
    }
}

/// Asks the token owner to refresh a token that is about to expire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRefreshRequested {
    /// Token that needs refreshing.
    pub kind: SecretKind,
    /// When it expires, or `None` when the token is absent or already
    /// expired.
    pub expires_at: Option<DateTime<Utc>>,
    /// When the request was made.
    pub requested_at: DateTime<Utc>,
}
