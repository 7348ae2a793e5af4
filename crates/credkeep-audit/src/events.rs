//! Audit record and entry types.
//!
//! A caller builds an [`AuditRecord`]; the auditor stamps it with a
//! sequence number, timestamp and session, then seals it into an immutable
//! [`AuditEntry`] whose checksum covers every other field.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Severity level for audit entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Routine operation (token stored, key rotated).
    Info = 0,
    /// Unusual but harmless.
    Low = 1,
    /// Failed operation that did not expose anything.
    Medium = 2,
    /// Failed cleanup or validation.
    High = 3,
    /// Possible exposure of secret material.
    Critical = 4,
}

impl Severity {
    /// Returns the string representation of this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Category of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Token stored, retrieved or cleared.
    TokenOperation,
    /// Encryption key rotated.
    KeyRotation,
    /// Secret material erased.
    CleanupOperation,
    /// Cleanup validation run.
    Validation,
    /// Policy violation or suspected exposure.
    SecurityViolation,
    /// A stored secret reached its expiry.
    SecretExpired,
    /// Component started or stopped.
    Lifecycle,
}

impl AuditEventType {
    /// Returns the string representation of this event type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TokenOperation => "token_operation",
            Self::KeyRotation => "key_rotation",
            Self::CleanupOperation => "cleanup_operation",
            Self::Validation => "validation",
            Self::SecurityViolation => "security_violation",
            Self::SecretExpired => "secret_expired",
            Self::Lifecycle => "lifecycle",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of the audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// The action completed.
    Success,
    /// The action failed.
    Failure,
    /// The action was not attempted.
    Skipped,
}

impl AuditOutcome {
    /// Maps a boolean result to an outcome.
    #[must_use]
    pub const fn from_success(success: bool) -> Self {
        if success { Self::Success } else { Self::Failure }
    }

    /// Returns the string representation of this outcome.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An action to be audited, before it is sealed into the trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Category.
    pub event_type: AuditEventType,
    /// Severity.
    pub severity: Severity,
    /// Outcome.
    pub outcome: AuditOutcome,
    /// Links entries that belong to one logical operation.
    pub correlation_id: Option<Uuid>,
    /// Free-form details. Sensitive keys and values are redacted on entry.
    pub details: BTreeMap<String, serde_json::Value>,
}

impl AuditRecord {
    /// Starts a successful, informational record.
    #[must_use]
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            event_type,
            severity: Severity::Info,
            outcome: AuditOutcome::Success,
            correlation_id: None,
            details: BTreeMap::new(),
        }
    }

    /// Sets the severity.
    #[must_use]
    pub const fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Sets the outcome.
    #[must_use]
    pub const fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub const fn correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Adds a detail.
    #[must_use]
    pub fn detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// A sealed audit trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the trail, starting at 1.
    pub sequence: u64,
    /// Category.
    pub event_type: AuditEventType,
    /// Severity.
    pub severity: Severity,
    /// Outcome.
    pub outcome: AuditOutcome,
    /// When the entry was sealed. Non-decreasing within a trail.
    pub timestamp: DateTime<Utc>,
    /// Auditor session that produced the entry.
    pub session_id: Uuid,
    /// Correlation id.
    pub correlation_id: Uuid,
    /// Redacted details.
    pub details: BTreeMap<String, serde_json::Value>,
    /// BLAKE3 hex digest over the canonical JSON of all other fields.
    pub checksum: String,
}

/// Fields covered by the checksum, in canonical order.
#[derive(Serialize)]
struct ChecksumView<'a> {
    sequence: u64,
    event_type: AuditEventType,
    severity: Severity,
    outcome: AuditOutcome,
    timestamp: &'a DateTime<Utc>,
    session_id: &'a Uuid,
    correlation_id: &'a Uuid,
    details: &'a BTreeMap<String, serde_json::Value>,
}

impl AuditEntry {
    pub(crate) fn seal(
        record: AuditRecord,
        sequence: u64,
        timestamp: DateTime<Utc>,
        session_id: Uuid,
    ) -> Result<Self> {
        let mut entry = Self {
            sequence,
            event_type: record.event_type,
            severity: record.severity,
            outcome: record.outcome,
            timestamp,
            session_id,
            correlation_id: record.correlation_id.unwrap_or_else(Uuid::new_v4),
            details: record.details,
            checksum: String::new(),
        };
        entry.checksum = entry.compute_checksum()?;
        Ok(entry)
    }

    /// Recomputes the checksum over the current field values.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be serialized.
    pub fn compute_checksum(&self) -> Result<String> {
        let view = ChecksumView {
            sequence: self.sequence,
            event_type: self.event_type,
            severity: self.severity,
            outcome: self.outcome,
            timestamp: &self.timestamp,
            session_id: &self.session_id,
            correlation_id: &self.correlation_id,
            details: &self.details,
        };
        let canonical = serde_json::to_vec(&view)?;
        Ok(blake3::hash(&canonical).to_hex().to_string())
    }

    /// Whether the stored checksum matches the fields.
    #[must_use]
    pub fn verify_checksum(&self) -> bool {
        self.compute_checksum()
            .is_ok_and(|expected| expected == self.checksum)
    }

    /// Serializes the entry to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
