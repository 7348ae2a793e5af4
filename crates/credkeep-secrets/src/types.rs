//! Core types for secret storage.
//!
//! - [`SecretKind`]: which slot a secret lives in
//! - [`SecretBuffer`]: byte buffer that zeroizes on drop
//! - [`CleanupTriggers`]: when held secrets are erased automatically

use std::fmt;
use std::time::Duration;

use credkeep_config::CredentialConfig;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Identifies a storage slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretKind {
    /// Short-lived access token.
    Access,
    /// Long-lived refresh token.
    Refresh,
    /// Identity of the authenticated user.
    UserId,
    /// Any other named secret.
    Named(String),
}

impl SecretKind {
    /// Returns the slot name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
            Self::UserId => "user_id",
            Self::Named(name) => name,
        }
    }
}

impl fmt::Display for SecretKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Secret bytes that are wiped when dropped.
///
/// The bytes are only reachable through [`expose`](Self::expose), and
/// equality runs in constant time.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct SecretBuffer {
    data: Vec<u8>,
}

impl SecretBuffer {
    /// Takes ownership of `data`.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Copies `data` into a new buffer.
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }

    /// Runs `f` with the raw bytes.
    pub fn expose<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data)
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether `needle` occurs anywhere in the buffer.
    #[must_use]
    pub fn contains(&self, needle: &[u8]) -> bool {
        !needle.is_empty()
            && needle.len() <= self.data.len()
            && self.data.windows(needle.len()).any(|w| bool::from(w.ct_eq(needle)))
    }

    /// Overwrites the bytes with zeros and empties the buffer in place.
    pub fn wipe(&mut self) {
        self.data.zeroize();
    }
}

impl PartialEq for SecretBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.data.ct_eq(&other.data).into()
    }
}

impl Eq for SecretBuffer {}

impl fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBuffer")
            .field("len", &self.data.len())
            .field("data", &"[REDACTED]")
            .finish()
    }
}

/// When held secrets are erased without an explicit store or clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupTriggers {
    /// Erase everything after this long without a store or retrieve.
    pub idle_timeout: Option<Duration>,
    /// Whether explicit clear requests are honoured.
    pub on_explicit_call: bool,
    /// Erase everything when the manager is dropped.
    pub on_process_exit: bool,
}

impl Default for CleanupTriggers {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            on_explicit_call: true,
            on_process_exit: true,
        }
    }
}

impl From<&CredentialConfig> for CleanupTriggers {
    fn from(config: &CredentialConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            on_explicit_call: config.cleanup.on_explicit_call,
            on_process_exit: config.cleanup.on_process_exit,
        }
    }
}
