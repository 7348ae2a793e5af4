//! The security auditor: an append-only, checksummed, bounded trail.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use credkeep_config::CredentialConfig;
use credkeep_runtime::{EventBus, SubscriptionId};
use credkeep_scan::SensitiveDataScanner;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AuditError, Result};
use crate::events::{AuditEntry, AuditEventType, AuditOutcome, AuditRecord, Severity};
use crate::logger::{AuditSink, TracingAuditSink};

/// Auditor tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditorOptions {
    /// Oldest entries are evicted once the trail holds this many.
    pub max_entries: usize,
}

impl Default for AuditorOptions {
    fn default() -> Self {
        Self { max_entries: 10_000 }
    }
}

impl From<&CredentialConfig> for AuditorOptions {
    fn from(config: &CredentialConfig) -> Self {
        Self {
            max_entries: config.audit_max_entries,
        }
    }
}

/// Inclusive time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start of the window.
    pub start: DateTime<Utc>,
    /// End of the window.
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Creates a window, swapping the bounds if they are reversed.
    #[must_use]
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    /// The window ending now and starting `span` ago.
    #[must_use]
    pub fn last(span: chrono::Duration) -> Self {
        let end = Utc::now();
        Self::new(end - span, end)
    }

    /// Whether `at` lies within the window.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }
}

/// Aggregate counts over a window of the trail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStatistics {
    /// Entries considered.
    pub total: usize,
    /// Counts per event type.
    pub by_type: BTreeMap<AuditEventType, usize>,
    /// Counts per severity.
    pub by_severity: BTreeMap<Severity, usize>,
    /// Counts per outcome.
    pub by_outcome: BTreeMap<AuditOutcome, usize>,
    /// Successful cleanup operations.
    pub cleanup_succeeded: usize,
    /// Failed cleanup operations.
    pub cleanup_failed: usize,
}

impl AuditStatistics {
    /// Cleanup operations that completed either way.
    #[must_use]
    pub const fn cleanup_total(&self) -> usize {
        self.cleanup_succeeded + self.cleanup_failed
    }
}

/// Trail query. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditQuery {
    /// Only these event types.
    pub event_types: Vec<AuditEventType>,
    /// Only entries at or above this severity.
    pub min_severity: Option<Severity>,
    /// Only entries with this correlation id.
    pub correlation_id: Option<Uuid>,
    /// Only entries inside this window.
    pub window: Option<TimeRange>,
    /// At most this many entries.
    pub limit: Option<usize>,
}

impl AuditQuery {
    fn matches(&self, entry: &AuditEntry) -> bool {
        (self.event_types.is_empty() || self.event_types.contains(&entry.event_type))
            && self.min_severity.is_none_or(|min| entry.severity >= min)
            && self.correlation_id.is_none_or(|id| entry.correlation_id == id)
            && self.window.is_none_or(|w| w.contains(entry.timestamp))
    }
}

/// Result of checking the trail for tampering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// Entries checked.
    pub checked: usize,
    /// Sequences whose checksum no longer matches.
    pub corrupted: Vec<u64>,
    /// Sequences whose timestamp precedes the previous entry's.
    pub out_of_order: Vec<u64>,
}

impl IntegrityReport {
    /// Whether no problem was found.
    #[must_use]
    pub fn is_intact(&self) -> bool {
        self.corrupted.is_empty() && self.out_of_order.is_empty()
    }
}

struct Trail {
    entries: VecDeque<AuditEntry>,
    next_sequence: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

/// Records security-relevant actions.
///
/// Every entry is redacted, stamped, checksummed and appended under one
/// lock. The sink and subscribers run after that lock is released.
pub struct SecurityAuditor {
    session_id: Uuid,
    options: AuditorOptions,
    trail: Mutex<Trail>,
    sink: Arc<dyn AuditSink>,
    scanner: Arc<SensitiveDataScanner>,
    events: EventBus<AuditEntry>,
    critical: EventBus<AuditEntry>,
    disposed: AtomicBool,
}

impl SecurityAuditor {
    /// Creates an auditor.
    #[must_use]
    pub fn new(
        options: AuditorOptions,
        sink: Arc<dyn AuditSink>,
        scanner: Arc<SensitiveDataScanner>,
    ) -> Self {
        let session_id = Uuid::new_v4();
        debug!(%session_id, max_entries = options.max_entries, "audit session opened");
        Self {
            session_id,
            options,
            trail: Mutex::new(Trail {
                entries: VecDeque::new(),
                next_sequence: 1,
                last_timestamp: None,
            }),
            sink,
            scanner,
            events: EventBus::new("audit"),
            critical: EventBus::new("critical-security"),
            disposed: AtomicBool::new(false),
        }
    }

    /// Creates an auditor with default options, a tracing sink and the
    /// default scanner.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(
            AuditorOptions::default(),
            Arc::new(TracingAuditSink::new()),
            Arc::new(SensitiveDataScanner::with_defaults()),
        )
    }

    /// Session id stamped on every entry.
    #[must_use]
    pub const fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Subscribes to every new entry.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&AuditEntry) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    /// Subscribes to entries with critical severity.
    pub fn subscribe_critical<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&AuditEntry) + Send + Sync + 'static,
    {
        self.critical.subscribe(handler)
    }

    /// Removes a subscription made with [`subscribe`](Self::subscribe).
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Removes a subscription made with
    /// [`subscribe_critical`](Self::subscribe_critical).
    pub fn unsubscribe_critical(&self, id: SubscriptionId) -> bool {
        self.critical.unsubscribe(id)
    }

    /// Appends an entry to the trail.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::ResourceDisposed`] after [`dispose`](Self::dispose)
    /// or a serialization error if the details cannot be checksummed.
    pub fn log_event(&self, mut record: AuditRecord) -> Result<AuditEntry> {
        self.ensure_active()?;
        record.details = self.redact_details(record.details);

        let entry = {
            let mut trail = self.trail.lock();
            let now = Utc::now();
            let timestamp = trail.last_timestamp.map_or(now, |last| last.max(now));
            let entry = AuditEntry::seal(record, trail.next_sequence, timestamp, self.session_id)?;

            trail.next_sequence += 1;
            trail.last_timestamp = Some(timestamp);
            trail.entries.push_back(entry.clone());
            while trail.entries.len() > self.options.max_entries {
                trail.entries.pop_front();
            }
            entry
        };

        self.sink.record(&entry);
        self.events.publish(&entry);
        if entry.severity >= Severity::Critical {
            self.critical.publish(&entry);
        }
        Ok(entry)
    }

    /// Audits a token operation such as `store`, `retrieve` or `clear`.
    ///
    /// # Errors
    ///
    /// See [`log_event`](Self::log_event).
    pub fn log_token_operation(
        &self,
        operation: &str,
        kind: &str,
        outcome: AuditOutcome,
    ) -> Result<AuditEntry> {
        let severity = match outcome {
            AuditOutcome::Failure => Severity::Medium,
            AuditOutcome::Success | AuditOutcome::Skipped => Severity::Info,
        };
        self.log_event(
            AuditRecord::new(AuditEventType::TokenOperation)
                .severity(severity)
                .outcome(outcome)
                .detail("operation", operation)
                .detail("kind", kind),
        )
    }

    /// Audits a key rotation.
    ///
    /// # Errors
    ///
    /// See [`log_event`](Self::log_event).
    pub fn log_key_rotation(
        &self,
        version: u32,
        next_rotation: Option<DateTime<Utc>>,
    ) -> Result<AuditEntry> {
        let next = next_rotation.map_or(Value::Null, |at| Value::String(at.to_rfc3339()));
        self.log_event(
            AuditRecord::new(AuditEventType::KeyRotation)
                .detail("key_version", version)
                .detail("next_rotation", next),
        )
    }

    /// Audits an erase of secret material.
    ///
    /// # Errors
    ///
    /// See [`log_event`](Self::log_event).
    pub fn log_cleanup_operation(
        &self,
        scope: &str,
        erased: usize,
        outcome: AuditOutcome,
    ) -> Result<AuditEntry> {
        let severity = match outcome {
            AuditOutcome::Failure => Severity::High,
            AuditOutcome::Success | AuditOutcome::Skipped => Severity::Info,
        };
        self.log_event(
            AuditRecord::new(AuditEventType::CleanupOperation)
                .severity(severity)
                .outcome(outcome)
                .detail("scope", scope)
                .detail("erased", erased),
        )
    }

    /// Audits a validation run.
    ///
    /// # Errors
    ///
    /// See [`log_event`](Self::log_event).
    pub fn log_validation(
        &self,
        validation_type: &str,
        passed: bool,
        confidence: f64,
    ) -> Result<AuditEntry> {
        let severity = if passed { Severity::Info } else { Severity::High };
        self.log_event(
            AuditRecord::new(AuditEventType::Validation)
                .severity(severity)
                .outcome(AuditOutcome::from_success(passed))
                .detail("validation_type", validation_type)
                .detail("confidence", confidence),
        )
    }

    /// Audits a security violation.
    ///
    /// # Errors
    ///
    /// See [`log_event`](Self::log_event).
    pub fn log_security_violation(&self, description: &str, severity: Severity) -> Result<AuditEntry> {
        self.log_event(
            AuditRecord::new(AuditEventType::SecurityViolation)
                .severity(severity)
                .outcome(AuditOutcome::Failure)
                .detail("description", description),
        )
    }

    /// Counts entries, optionally restricted to a window.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::ResourceDisposed`] after disposal.
    pub fn statistics(&self, window: Option<TimeRange>) -> Result<AuditStatistics> {
        self.ensure_active()?;
        let trail = self.trail.lock();
        let mut stats = AuditStatistics::default();

        for entry in trail
            .entries
            .iter()
            .filter(|e| window.is_none_or(|w| w.contains(e.timestamp)))
        {
            stats.total += 1;
            *stats.by_type.entry(entry.event_type).or_default() += 1;
            *stats.by_severity.entry(entry.severity).or_default() += 1;
            *stats.by_outcome.entry(entry.outcome).or_default() += 1;
            if entry.event_type == AuditEventType::CleanupOperation {
                match entry.outcome {
                    AuditOutcome::Success => stats.cleanup_succeeded += 1,
                    AuditOutcome::Failure => stats.cleanup_failed += 1,
                    AuditOutcome::Skipped => {}
                }
            }
        }
        Ok(stats)
    }

    /// Drops entries older than `retention`. Returns how many were dropped.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::ArgumentInvalid`] for a negative retention and
    /// [`AuditError::ResourceDisposed`] after disposal.
    pub fn cleanup_expired_logs(&self, retention: chrono::Duration) -> Result<usize> {
        self.ensure_active()?;
        if retention < chrono::Duration::zero() {
            return Err(AuditError::ArgumentInvalid {
                reason: "retention cannot be negative".to_string(),
            });
        }
        let cutoff = Utc::now() - retention;
        let removed = {
            let mut trail = self.trail.lock();
            let before = trail.entries.len();
            trail.entries.retain(|e| e.timestamp >= cutoff);
            before - trail.entries.len()
        };
        if removed > 0 {
            info!(removed, "expired audit entries dropped");
        }
        Ok(removed)
    }

    /// Returns matching entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::ResourceDisposed`] after disposal.
    pub fn query(&self, filter: &AuditQuery) -> Result<Vec<AuditEntry>> {
        self.ensure_active()?;
        let trail = self.trail.lock();
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(trail
            .entries
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect())
    }

    /// Copies the whole trail, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::ResourceDisposed`] after disposal.
    pub fn snapshot(&self) -> Result<Vec<AuditEntry>> {
        self.ensure_active()?;
        Ok(self.trail.lock().entries.iter().cloned().collect())
    }

    /// Recomputes every checksum and checks timestamp order.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::ResourceDisposed`] after disposal.
    pub fn verify_integrity(&self) -> Result<IntegrityReport> {
        self.ensure_active()?;
        let trail = self.trail.lock();
        let mut report = IntegrityReport::default();
        let mut previous: Option<DateTime<Utc>> = None;

        for entry in &trail.entries {
            report.checked += 1;
            if !entry.verify_checksum() {
                report.corrupted.push(entry.sequence);
            }
            if previous.is_some_and(|p| entry.timestamp < p) {
                report.out_of_order.push(entry.sequence);
            }
            previous = Some(entry.timestamp);
        }
        Ok(report)
    }

    /// Entries currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.trail.lock().entries.len()
    }

    /// Whether the trail is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Drops the trail and every subscriber. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.trail.lock().entries.clear();
        self.events.clear();
        self.critical.clear();
        info!(session_id = %self.session_id, "audit session closed");
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_disposed() {
            Err(AuditError::ResourceDisposed)
        } else {
            Ok(())
        }
    }

    fn redact_details(&self, details: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        let map: serde_json::Map<String, Value> = details.into_iter().collect();
        self.scanner.filter_sensitive_data(&map).into_iter().collect()
    }
}

impl Default for SecurityAuditor {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for SecurityAuditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityAuditor")
            .field("session_id", &self.session_id)
            .field("options", &self.options)
            .field("entries", &self.len())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
