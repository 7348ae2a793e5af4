//! # credkeep-audit
//!
//! Security audit trail for credkeep.
//!
//! Every security-relevant action is sealed into an [`AuditEntry`] carrying
//! a sequence number, a non-decreasing timestamp, a correlation id and a
//! BLAKE3 checksum over its other fields. Details are passed through the
//! sensitive-data scanner before sealing, so the trail never holds
//! plaintext secrets.
//!
//! ## Features
//!
//! - [`SecurityAuditor`]: bounded trail with statistics, queries and
//!   integrity checks
//! - [`AuditSink`]: pluggable trait for audit backends
//! - [`TracingAuditSink`]: default implementation using `tracing`
//! - [`AuditRecord`]: fluent builder for entries
//!
//! ## Example
//!
//! ```rust
//! use credkeep_audit::{AuditOutcome, SecurityAuditor};
//!
//! let auditor = SecurityAuditor::with_defaults();
//! auditor.log_cleanup_operation("all", 2, AuditOutcome::Success)?;
//!
//! let stats = auditor.statistics(None)?;
//! assert_eq!(stats.cleanup_succeeded, 1);
//! assert!(auditor.verify_integrity()?.is_intact());
//! # Ok::<(), credkeep_audit::AuditError>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auditor;
pub mod error;
pub mod events;
pub mod logger;

pub use auditor::{
    AuditQuery, AuditStatistics, AuditorOptions, IntegrityReport, SecurityAuditor, TimeRange,
};
pub use error::{AuditError, Result};
pub use events::{AuditEntry, AuditEventType, AuditOutcome, AuditRecord, Severity};
pub use logger::{AuditSink, NoopAuditSink, TracingAuditSink};
