//! Independent verification of credential cleanup.
//!
//! The [`CleanupValidator`] does not take the word of the component it
//! checks. It reads state through the [`CleanupTarget`], [`MemorySurface`]
//! and [`ReclaimableMemory`] traits, searches for leaked identifier values,
//! and reads the audit trail.
//!
//! # Checks
//!
//! - **Cleanup state**: slots match an [`ExpectedState`], no expired residue,
//!   intact audit trail
//! - **Zero leak**: identifiers absent from memory, environment and temp files
//! - **Idempotency**: repeated operation ids carry the same parameters
//! - **Success rate**: cleanup successes in the audit trail
//! - **Memory integrity**: live secret bytes across a reclamation pass
//!
//! Every check returns a [`ValidationResult`] sealed with a BLAKE3 checksum.
//!
//! ```
//! use std::sync::Arc;
//!
//! use credkeep_audit::SecurityAuditor;
//! use credkeep_config::CredentialConfig;
//! use credkeep_secrets::{SecretContainer, SecretKind};
//! use credkeep_validation::{CleanupValidator, ExpectedState};
//!
//! let auditor = Arc::new(SecurityAuditor::with_defaults());
//! let validator = CleanupValidator::from_config(&CredentialConfig::default(), auditor);
//!
//! let container = SecretContainer::default();
//! container.store(SecretKind::Access, b"token", chrono::Duration::minutes(5))?;
//! container.clear_all()?;
//!
//! let result = validator
//!     .validate_cleanup_state(&container, &ExpectedState::cleared())
//!     .expect("validator is active");
//! assert!(result.is_valid);
//! assert!(result.verify_checksum());
//! # Ok::<(), credkeep_secrets::SecretsError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod result;
mod scope;
mod target;
mod validator;

pub use error::{Result, ValidationError};
pub use result::{
    LeakFinding, MessageLevel, RuleOutcome, RuleStatus, ValidationMessage, ValidationResult,
    ValidationType,
};
pub use scope::LeakScanScope;
pub use target::{CleanupTarget, MemorySurface, ReclaimableMemory, TargetSnapshot};
pub use validator::{
    CleanupCompleted, CleanupValidator, ExpectedState, ValidationEvent, ValidationFailed,
    ValidationRule, ValidationSession, ValidatorOptions,
};
