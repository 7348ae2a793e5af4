//! # credkeep-secrets
//!
//! Holds credentials in memory for as long as they are needed and no longer:
//!
//! - [`SecretContainer`]: typed slots with per-secret expiry; every erased
//!   buffer is zeroized
//! - [`KeyedCipher`]: ChaCha20-Poly1305 with versioned keys, so payloads
//!   sealed before a rotation stay readable while their key is retained
//! - [`CredentialLifecycleManager`]: encrypt-on-store, audit of every
//!   operation, and background refresh, rotation and idle cleanup
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use credkeep_audit::SecurityAuditor;
//! use credkeep_config::CredentialConfig;
//! use credkeep_secrets::{CredentialLifecycleManager, SecretKind};
//!
//! let auditor = Arc::new(SecurityAuditor::with_defaults());
//! let manager = CredentialLifecycleManager::from_config(&CredentialConfig::default(), auditor);
//!
//! manager
//!     .store_token_securely("eyJhbGciOi.payload.sig", chrono::Duration::minutes(15), SecretKind::Access)
//!     .expect("store");
//! assert!(manager.is_authenticated().expect("status"));
//!
//! manager.clear_all_security_state().expect("clear");
//! assert!(!manager.is_authenticated().expect("status"));
//! ```
//!
//! ## Security Considerations
//!
//! - Secret buffers zeroize on drop and compare in constant time
//! - Debug output for secrets and keys is redacted
//! - Events and audit entries never carry secret material

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cipher;
pub mod container;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod types;

pub use cipher::{
    CipherOptions, ENVELOPE_OVERHEAD, EncryptedPayload, KEY_SIZE, KeyMaterial, KeyRotated,
    KeyedCipher, NONCE_SIZE, SecretKey, TAG_SIZE,
};
pub use container::{ContainerOptions, SecretContainer, SecretExpired};
pub use error::{Result, SecretsError};
pub use events::{SecurityEvent, SecurityEventKind, TokenRefreshRequested};
pub use lifecycle::{CredentialLifecycleManager, LifecycleOptions, SecurityStatus};
pub use types::{CleanupTriggers, SecretBuffer, SecretKind};
