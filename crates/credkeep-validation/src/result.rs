//! Validation results.
//!
//! A [`ValidationRun`] collects rule outcomes, messages and findings while a
//! check is in progress. [`ValidationRun::complete`] turns it into a sealed
//! [`ValidationResult`] whose checksum covers every other field.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use credkeep_scan::SensitiveFinding;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which check produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationType {
    /// Target state after cleanup.
    CleanupState,
    /// Search for leaked identifier values.
    ZeroSensitiveDataLeak,
    /// Repeated operation parameters.
    Idempotency,
    /// Cleanup success ratio from the audit trail.
    CleanupSuccessRate,
    /// Live secret bytes across a reclamation pass.
    MemoryCleanupIntegrity,
}

impl ValidationType {
    /// Stable name used in logs and audit details.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CleanupState => "cleanup_state",
            Self::ZeroSensitiveDataLeak => "zero_sensitive_data_leak",
            Self::Idempotency => "idempotency",
            Self::CleanupSuccessRate => "cleanup_success_rate",
            Self::MemoryCleanupIntegrity => "memory_cleanup_integrity",
        }
    }
}

impl fmt::Display for ValidationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    /// Informational.
    Info,
    /// Suspicious but not failing.
    Warning,
    /// A failed check.
    Error,
    /// A failed check that indicates exposure or tampering.
    Critical,
}

/// A message attached to a result. Never contains secret material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationMessage {
    /// Severity.
    pub level: MessageLevel,
    /// Rule the message belongs to, if any.
    pub rule: Option<String>,
    /// Sanitized text.
    pub text: String,
}

/// Outcome of one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    /// The rule held.
    Passed,
    /// The rule was violated.
    Failed,
    /// The rule was not evaluated.
    Skipped,
}

/// One evaluated rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleOutcome {
    /// Rule name.
    pub name: String,
    /// Outcome.
    pub status: RuleStatus,
}

/// A leaked identifier located during a zero-leak scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakFinding {
    /// Where it was found, e.g. `env:API_TOKEN` or `memory:secret_container`.
    pub location: String,
    /// The masked match.
    pub finding: SensitiveFinding,
}

/// A sealed validation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Unique result id.
    pub id: Uuid,
    /// Which check ran.
    pub validation_type: ValidationType,
    /// What was validated.
    pub target: String,
    /// Validation session that produced the result.
    pub session_id: Uuid,
    /// Rule outcomes in evaluation order.
    pub rules: Vec<RuleOutcome>,
    /// Messages in the order they were raised.
    pub messages: Vec<ValidationMessage>,
    /// Leak findings.
    pub findings: Vec<LeakFinding>,
    /// Check-specific values such as `zero_leak_achieved`.
    pub context: BTreeMap<String, serde_json::Value>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run was sealed.
    pub completed_at: DateTime<Utc>,
    /// Rules evaluated (passed plus failed).
    pub validated: usize,
    /// Rules passed.
    pub passed: usize,
    /// Rules failed.
    pub failed: usize,
    /// Rules skipped.
    pub skipped: usize,
    /// Share of rules that passed, in `[0, 1]`.
    pub confidence: f64,
    /// No failed rule and no error or critical message.
    pub is_valid: bool,
    /// BLAKE3 hex digest over the canonical JSON of all other fields.
    pub checksum: String,
}

#[derive(Serialize)]
struct ChecksumView<'a> {
    id: &'a Uuid,
    validation_type: ValidationType,
    target: &'a str,
    session_id: &'a Uuid,
    rules: &'a [RuleOutcome],
    messages: &'a [ValidationMessage],
    findings: &'a [LeakFinding],
    context: &'a BTreeMap<String, serde_json::Value>,
    started_at: &'a DateTime<Utc>,
    completed_at: &'a DateTime<Utc>,
    validated: usize,
    passed: usize,
    failed: usize,
    skipped: usize,
    confidence: f64,
    is_valid: bool,
}

impl ValidationResult {
    /// Recomputes the checksum over the current field values.
    #[must_use]
    pub fn compute_checksum(&self) -> String {
        let view = ChecksumView {
            id: &self.id,
            validation_type: self.validation_type,
            target: &self.target,
            session_id: &self.session_id,
            rules: &self.rules,
            messages: &self.messages,
            findings: &self.findings,
            context: &self.context,
            started_at: &self.started_at,
            completed_at: &self.completed_at,
            validated: self.validated,
            passed: self.passed,
            failed: self.failed,
            skipped: self.skipped,
            confidence: self.confidence,
            is_valid: self.is_valid,
        };
        let canonical = serde_json::to_vec(&view).unwrap_or_default();
        blake3::hash(&canonical).to_hex().to_string()
    }

    /// Whether the result is unchanged since it was sealed.
    #[must_use]
    pub fn verify_checksum(&self) -> bool {
        !self.checksum.is_empty() && self.compute_checksum() == self.checksum
    }

    /// Looks up a rule outcome by name.
    #[must_use]
    pub fn rule(&self, name: &str) -> Option<RuleStatus> {
        self.rules.iter().find(|r| r.name == name).map(|r| r.status)
    }

    /// Messages at or above `level`.
    pub fn messages_at_least(&self, level: MessageLevel) -> impl Iterator<Item = &ValidationMessage> {
        self.messages.iter().filter(move |m| m.level >= level)
    }

    /// Reads a boolean context value.
    #[must_use]
    pub fn context_flag(&self, key: &str) -> Option<bool> {
        self.context.get(key).and_then(serde_json::Value::as_bool)
    }
}

/// An in-progress result.
#[derive(Debug)]
pub(crate) struct ValidationRun {
    validation_type: ValidationType,
    target: String,
    session_id: Uuid,
    started_at: DateTime<Utc>,
    rules: Vec<RuleOutcome>,
    messages: Vec<ValidationMessage>,
    findings: Vec<LeakFinding>,
    context: BTreeMap<String, serde_json::Value>,
}

impl ValidationRun {
    pub(crate) fn new(
        validation_type: ValidationType,
        target: impl Into<String>,
        session_id: Uuid,
    ) -> Self {
        Self {
            validation_type,
            target: target.into(),
            session_id,
            started_at: Utc::now(),
            rules: Vec::new(),
            messages: Vec::new(),
            findings: Vec::new(),
            context: BTreeMap::new(),
        }
    }

    pub(crate) fn rule(&mut self, name: impl Into<String>, status: RuleStatus) -> &mut Self {
        self.rules.push(RuleOutcome {
            name: name.into(),
            status,
        });
        self
    }

    /// Records a rule as passed or failed.
    pub(crate) fn check(&mut self, name: impl Into<String>, held: bool) -> &mut Self {
        self.rule(
            name,
            if held {
                RuleStatus::Passed
            } else {
                RuleStatus::Failed
            },
        )
    }

    pub(crate) fn message(
        &mut self,
        level: MessageLevel,
        rule: Option<&str>,
        text: impl Into<String>,
    ) -> &mut Self {
        self.messages.push(ValidationMessage {
            level,
            rule: rule.map(str::to_owned),
            text: text.into(),
        });
        self
    }

    pub(crate) fn finding(&mut self, finding: LeakFinding) -> &mut Self {
        self.findings.push(finding);
        self
    }

    pub(crate) fn findings_len(&self) -> usize {
        self.findings.len()
    }

    pub(crate) fn context(
        &mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> &mut Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Seals the run.
    pub(crate) fn complete(self) -> ValidationResult {
        let count = |status| self.rules.iter().filter(|r| r.status == status).count();
        let passed = count(RuleStatus::Passed);
        let failed = count(RuleStatus::Failed);
        let skipped = count(RuleStatus::Skipped);
        let total = passed + failed + skipped;
        let confidence = if total == 0 {
            1.0
        } else {
            passed as f64 / total as f64
        };
        let is_valid = failed == 0
            && !self
                .messages
                .iter()
                .any(|m| m.level >= MessageLevel::Error);

        let mut result = ValidationResult {
            id: Uuid::new_v4(),
            validation_type: self.validation_type,
            target: self.target,
            session_id: self.session_id,
            rules: self.rules,
            messages: self.messages,
            findings: self.findings,
            context: self.context,
            started_at: self.started_at,
            completed_at: Utc::now().max(self.started_at),
            validated: passed + failed,
            passed,
            failed,
            skipped,
            confidence,
            is_valid,
            checksum: String::new(),
        };
        result.checksum = result.compute_checksum();
        result
    }
}
