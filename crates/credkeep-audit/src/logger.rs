//! Audit sinks.
//!
//! This module provides the [`AuditSink`] trait and default implementations.

use crate::events::{AuditEntry, Severity};

/// Destination for sealed audit entries.
///
/// Implement this trait to forward entries elsewhere (file, database,
/// external service). Sinks are called after the trail lock is released.
pub trait AuditSink: Send + Sync {
    /// Records a sealed entry.
    fn record(&self, entry: &AuditEntry);
}

/// Sink that emits entries through `tracing`.
///
/// Levels are chosen from severity:
/// - Info, Low → `tracing::info!`
/// - Medium → `tracing::warn!`
/// - High, Critical → `tracing::error!`
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink {
    prefix: Option<String>,
}

impl TracingAuditSink {
    /// Creates a tracing sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tracing sink whose messages start with `prefix`.
    #[must_use]
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }
}

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: &AuditEntry) {
        let sequence = entry.sequence;
        let event_type = entry.event_type;
        let severity = entry.severity;
        let outcome = entry.outcome;
        let correlation_id = entry.correlation_id;

        let json = entry.to_json().unwrap_or_else(|_| "{}".to_string());
        let prefix = self.prefix.as_deref().unwrap_or("AUDIT");

        match severity {
            Severity::Info | Severity::Low => {
                tracing::info!(
                    target: "credkeep_audit",
                    sequence,
                    %event_type,
                    %severity,
                    %outcome,
                    %correlation_id,
                    entry_json = %json,
                    "[{prefix}] {event_type}"
                );
            }
            Severity::Medium => {
                tracing::warn!(
                    target: "credkeep_audit",
                    sequence,
                    %event_type,
                    %severity,
                    %outcome,
                    %correlation_id,
                    entry_json = %json,
                    "[{prefix}] {event_type}"
                );
            }
            Severity::High | Severity::Critical => {
                tracing::error!(
                    target: "credkeep_audit",
                    sequence,
                    %event_type,
                    %severity,
                    %outcome,
                    %correlation_id,
                    entry_json = %json,
                    "[{prefix}] {event_type}"
                );
            }
        }
    }
}

/// Sink that discards entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditSink;

impl NoopAuditSink {
    /// Creates a no-op sink.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl AuditSink for NoopAuditSink {
    fn record(&self, _entry: &AuditEntry) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AuditEventType, AuditRecord};
    use chrono::Utc;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Debug, Default)]
    struct CountingSink {
        count: AtomicUsize,
    }

    impl AuditSink for CountingSink {
        fn record(&self, _entry: &AuditEntry) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn entry(severity: Severity) -> AuditEntry {
        let record = AuditRecord::new(AuditEventType::Validation).severity(severity);
        AuditEntry::seal(record, 1, Utc::now(), Uuid::new_v4()).expect("seal")
    }

    #[test]
    fn tracing_sink_handles_every_severity() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("credkeep_audit=info"))
            .with_test_writer()
            .try_init();
        let sink = TracingAuditSink::with_prefix("TEST");
        for severity in [
            Severity::Info,
            Severity::Low,
            Severity::Medium,
            Severity::High,
            Severity::Critical,
        ] {
            sink.record(&entry(severity));
        }
    }

    #[test]
    fn sinks_work_behind_trait_objects() {
        let counting = Arc::new(CountingSink::default());
        let sinks: Vec<Arc<dyn AuditSink>> = vec![
            counting.clone(),
            Arc::new(NoopAuditSink::new()),
            Arc::new(TracingAuditSink::new()),
        ];
        for sink in &sinks {
            sink.record(&entry(Severity::Info));
        }
        assert_eq!(counting.count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sinks_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TracingAuditSink>();
        assert_send_sync::<NoopAuditSink>();
    }
}
