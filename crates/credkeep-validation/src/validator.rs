//! The cleanup validator.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use credkeep_audit::{SecurityAuditor, TimeRange};
use credkeep_config::CredentialConfig;
use credkeep_runtime::{EventBus, ScheduledTask, SubscriptionId, TickControl};
use credkeep_scan::{SensitiveDataScanner, SensitiveKeyMatcher};
use credkeep_secrets::CredentialLifecycleManager;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{Result, ValidationError};
use crate::result::{MessageLevel, RuleStatus, ValidationResult, ValidationRun, ValidationType};
use crate::scope::{self, LeakScanScope, ScanBudget, ScanStep};
use crate::target::{CleanupTarget, MemorySurface, ReclaimableMemory};

/// Rules evaluated by [`CleanupValidator::validate_cleanup_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValidationRule {
    /// The target can still be read.
    TargetAccessible,
    /// Occupied slots are exactly the expected ones.
    SlotsMatchExpectation,
    /// No expired buffer was left behind.
    NoExpiredResidue,
    /// Every audit checksum verifies and timestamps never go backwards.
    AuditTrailIntact,
    /// None of the forbidden values appear in the audit trail.
    NoSecretMaterialInAudit,
}

impl ValidationRule {
    /// Every rule, in evaluation order.
    pub const ALL: [Self; 5] = [
        Self::TargetAccessible,
        Self::SlotsMatchExpectation,
        Self::NoExpiredResidue,
        Self::AuditTrailIntact,
        Self::NoSecretMaterialInAudit,
    ];

    /// Rule name used in results.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TargetAccessible => "TargetAccessible",
            Self::SlotsMatchExpectation => "SlotsMatchExpectation",
            Self::NoExpiredResidue => "NoExpiredResidue",
            Self::AuditTrailIntact => "AuditTrailIntact",
            Self::NoSecretMaterialInAudit => "NoSecretMaterialInAudit",
        }
    }
}

/// What a target should look like after cleanup.
#[derive(Clone, Default)]
pub struct ExpectedState {
    slots: BTreeSet<String>,
    forbidden: Vec<Zeroizing<String>>,
}

impl ExpectedState {
    /// Nothing held at all.
    #[must_use]
    pub fn cleared() -> Self {
        Self::default()
    }

    /// Exactly these slots held.
    #[must_use]
    pub fn holding<I, S>(slots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            slots: slots.into_iter().map(Into::into).collect(),
            forbidden: Vec::new(),
        }
    }

    /// Values that must never appear in the audit trail.
    #[must_use]
    pub fn with_forbidden_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.forbidden
            .extend(values.into_iter().map(|v| Zeroizing::new(v.into())));
        self
    }

    /// Expected slot names.
    #[must_use]
    pub fn slots(&self) -> &BTreeSet<String> {
        &self.slots
    }
}

impl fmt::Debug for ExpectedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpectedState")
            .field("slots", &self.slots)
            .field("forbidden", &self.forbidden.len())
            .finish()
    }
}

/// Validator tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatorOptions {
    /// Rules evaluated by cleanup state checks.
    pub rules: BTreeSet<ValidationRule>,
    /// Upper bound on a single leak scan.
    pub validation_timeout: Duration,
    /// Interval of the background cleanup state check; `None` disables it.
    pub periodic_interval: Option<Duration>,
    /// Default success rate threshold.
    pub minimum_cleanup_success_rate: f64,
    /// Growth across a reclamation pass that is not reported as a leak.
    pub memory_leak_tolerance_bytes: usize,
    /// Environment variable name fragments treated as sensitive.
    pub sensitive_env_var_substrings: Vec<String>,
    /// Root of the temp file scan.
    pub temp_dir: PathBuf,
    /// Larger temp files are skipped.
    pub temp_scan_max_file_bytes: u64,
    /// Invocations remembered per operation id.
    pub max_operation_history: usize,
}

impl Default for ValidatorOptions {
    fn default() -> Self {
        Self::from(&CredentialConfig::default())
    }
}

impl From<&CredentialConfig> for ValidatorOptions {
    fn from(config: &CredentialConfig) -> Self {
        Self {
            rules: ValidationRule::ALL.into_iter().collect(),
            validation_timeout: config.validation_timeout(),
            periodic_interval: config.periodic_validation_interval(),
            minimum_cleanup_success_rate: config.minimum_cleanup_success_rate,
            memory_leak_tolerance_bytes: config.memory_leak_tolerance_bytes,
            sensitive_env_var_substrings: config.sensitive_env_var_substrings.clone(),
            temp_dir: std::env::temp_dir(),
            temp_scan_max_file_bytes: config.temp_scan_max_file_bytes,
            max_operation_history: 64,
        }
    }
}

/// Published for every completed validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationEvent {
    /// Result id.
    pub result_id: Uuid,
    /// Which check ran.
    pub validation_type: ValidationType,
    /// What was validated.
    pub target: String,
    /// Whether it passed.
    pub is_valid: bool,
    /// Confidence of the result.
    pub confidence: f64,
    /// When it completed.
    pub completed_at: DateTime<Utc>,
}

/// Published for every validation that did not pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFailed {
    /// Result id.
    pub result_id: Uuid,
    /// Which check ran.
    pub validation_type: ValidationType,
    /// What was validated.
    pub target: String,
    /// Names of the failed rules.
    pub failed_rules: Vec<String>,
    /// When it completed.
    pub at: DateTime<Utc>,
}

/// Published after a reclamation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupCompleted {
    /// Bytes released by the pass.
    pub freed_bytes: usize,
    /// Items released by the pass.
    pub reclaimed_items: usize,
    /// Whether any memory grew beyond tolerance.
    pub leak_detected: bool,
    /// When the pass finished.
    pub at: DateTime<Utc>,
}

/// An in-flight validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationSession {
    /// Session id, repeated in the result.
    pub session_id: Uuid,
    /// Which check is running.
    pub validation_type: ValidationType,
    /// What is being validated.
    pub target: String,
    /// When it started.
    pub started_at: DateTime<Utc>,
}

/// Removes its session when the run ends, however it ends.
struct SessionGuard<'a> {
    sessions: &'a Mutex<HashMap<Uuid, ValidationSession>>,
    id: Uuid,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.sessions.lock().remove(&self.id);
    }
}

struct Inner {
    options: ValidatorOptions,
    auditor: Arc<SecurityAuditor>,
    scanner: Arc<SensitiveDataScanner>,
    env_names: SensitiveKeyMatcher,
    surfaces: RwLock<Vec<Arc<dyn MemorySurface>>>,
    reclaimable: RwLock<Vec<Arc<dyn ReclaimableMemory>>>,
    /// Parameter digests per operation id, oldest first.
    history: Mutex<HashMap<String, VecDeque<String>>>,
    sessions: Mutex<HashMap<Uuid, ValidationSession>>,
    validated: EventBus<ValidationEvent>,
    failed: EventBus<ValidationFailed>,
    cleanup: EventBus<CleanupCompleted>,
    disposed: AtomicBool,
}

impl Inner {
    fn ensure_active(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(ValidationError::ResourceDisposed)
        } else {
            Ok(())
        }
    }

    fn begin(&self, validation_type: ValidationType, target: &str) -> (SessionGuard<'_>, ValidationRun) {
        let id = Uuid::new_v4();
        self.sessions.lock().insert(
            id,
            ValidationSession {
                session_id: id,
                validation_type,
                target: target.to_string(),
                started_at: Utc::now(),
            },
        );
        (
            SessionGuard {
                sessions: &self.sessions,
                id,
            },
            ValidationRun::new(validation_type, target, id),
        )
    }

    /// Seals a run, audits it and notifies subscribers.
    fn finish(&self, run: ValidationRun) -> ValidationResult {
        let result = run.complete();
        if result.is_valid {
            info!(
                validation = %result.validation_type,
                target = %result.target,
                confidence = result.confidence,
                "validation passed"
            );
        } else {
            warn!(
                validation = %result.validation_type,
                target = %result.target,
                failed = result.failed,
                "validation failed"
            );
        }

        if let Err(e) = self.auditor.log_validation(
            result.validation_type.as_str(),
            result.is_valid,
            result.confidence,
        ) {
            warn!(error = %e, "validation was not audited");
        }

        self.validated.publish(&ValidationEvent {
            result_id: result.id,
            validation_type: result.validation_type,
            target: result.target.clone(),
            is_valid: result.is_valid,
            confidence: result.confidence,
            completed_at: result.completed_at,
        });
        if !result.is_valid {
            self.failed.publish(&ValidationFailed {
                result_id: result.id,
                validation_type: result.validation_type,
                target: result.target.clone(),
                failed_rules: result
                    .rules
                    .iter()
                    .filter(|r| r.status == RuleStatus::Failed)
                    .map(|r| r.name.clone())
                    .collect(),
                at: result.completed_at,
            });
        }
        result
    }

    fn enabled(&self, rule: ValidationRule) -> bool {
        self.options.rules.contains(&rule)
    }

    fn validate_cleanup_state(
        &self,
        target: &dyn CleanupTarget,
        expected: &ExpectedState,
    ) -> Result<ValidationResult> {
        self.ensure_active()?;
        let (_session, mut run) = self.begin(ValidationType::CleanupState, target.target_name());
        let snapshot = target.snapshot();

        if self.enabled(ValidationRule::TargetAccessible) {
            let name = ValidationRule::TargetAccessible.as_str();
            run.check(name, snapshot.is_some());
            if snapshot.is_none() {
                run.message(MessageLevel::Critical, Some(name), "target can no longer be read");
            }
        }

        for rule in [ValidationRule::SlotsMatchExpectation, ValidationRule::NoExpiredResidue] {
            if !self.enabled(rule) {
                continue;
            }
            let name = rule.as_str();
            let Some(snapshot) = &snapshot else {
                run.rule(name, RuleStatus::Skipped);
                continue;
            };
            if rule == ValidationRule::SlotsMatchExpectation {
                let occupied: BTreeSet<String> = snapshot.occupied.iter().cloned().collect();
                let unexpected: Vec<&String> = occupied.difference(&expected.slots).collect();
                let missing: Vec<&String> = expected.slots.difference(&occupied).collect();
                let stray_bytes = expected.slots.is_empty() && snapshot.live_bytes > 0;
                run.check(name, unexpected.is_empty() && missing.is_empty() && !stray_bytes);
                if !unexpected.is_empty() {
                    run.message(
                        MessageLevel::Error,
                        Some(name),
                        format!("unexpected slots still held: {unexpected:?}"),
                    );
                }
                if !missing.is_empty() {
                    run.message(
                        MessageLevel::Error,
                        Some(name),
                        format!("expected slots are empty: {missing:?}"),
                    );
                }
                if stray_bytes {
                    run.message(
                        MessageLevel::Error,
                        Some(name),
                        format!("{} secret bytes still live", snapshot.live_bytes),
                    );
                }
            } else {
                run.check(name, snapshot.expired_residue.is_empty());
                if !snapshot.expired_residue.is_empty() {
                    run.message(
                        MessageLevel::Warning,
                        Some(name),
                        format!("expired secrets were never erased: {:?}", snapshot.expired_residue),
                    );
                }
            }
        }

        if self.enabled(ValidationRule::AuditTrailIntact) {
            let name = ValidationRule::AuditTrailIntact.as_str();
            match self.auditor.verify_integrity() {
                Ok(report) => {
                    run.check(name, report.is_intact());
                    run.context("audit_entries_checked", report.checked);
                    if !report.corrupted.is_empty() {
                        run.message(
                            MessageLevel::Critical,
                            Some(name),
                            format!("audit entries fail checksum: {:?}", report.corrupted),
                        );
                    }
                    if !report.out_of_order.is_empty() {
                        run.message(
                            MessageLevel::Critical,
                            Some(name),
                            format!("audit entries out of order: {:?}", report.out_of_order),
                        );
                    }
                }
                Err(e) => {
                    run.check(name, false);
                    run.message(MessageLevel::Error, Some(name), format!("audit trail unavailable: {e}"));
                }
            }
        }

        if self.enabled(ValidationRule::NoSecretMaterialInAudit) {
            let name = ValidationRule::NoSecretMaterialInAudit.as_str();
            if expected.forbidden.is_empty() {
                run.rule(name, RuleStatus::Skipped);
                run.message(MessageLevel::Info, Some(name), "no forbidden values supplied");
            } else {
                let leaked = expected
                    .forbidden
                    .iter()
                    .filter(|value| self.auditor.contains_bytes(value.as_bytes()))
                    .count();
                run.check(name, leaked == 0);
                if leaked > 0 {
                    run.message(
                        MessageLevel::Critical,
                        Some(name),
                        format!("{leaked} forbidden value(s) found in the audit trail"),
                    );
                }
            }
        }

        if let Some(snapshot) = &snapshot {
            run.context("occupied_slots", snapshot.occupied.len());
            run.context("live_bytes", snapshot.live_bytes);
        }
        Ok(self.finish(run))
    }
}

/// Independently verifies that secrets were erased and nothing leaked.
///
/// Every check returns a sealed [`ValidationResult`]. Only misuse and
/// calls after [`dispose`](Self::dispose) return an error.
pub struct CleanupValidator {
    inner: Arc<Inner>,
    periodic: Mutex<Option<ScheduledTask>>,
}

impl CleanupValidator {
    /// Creates a validator reading from `auditor` and sanitizing with
    /// `scanner`. The audit trail is always searched by in-memory scans.
    #[must_use]
    pub fn new(
        options: ValidatorOptions,
        auditor: Arc<SecurityAuditor>,
        scanner: Arc<SensitiveDataScanner>,
    ) -> Self {
        let env_names = SensitiveKeyMatcher::new(options.sensitive_env_var_substrings.iter(), false);
        let audit_surface: Arc<dyn MemorySurface> = Arc::clone(&auditor) as Arc<dyn MemorySurface>;
        Self {
            inner: Arc::new(Inner {
                options,
                auditor,
                scanner,
                env_names,
                surfaces: RwLock::new(vec![audit_surface]),
                reclaimable: RwLock::new(Vec::new()),
                history: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                validated: EventBus::new("validation"),
                failed: EventBus::new("validation-failed"),
                cleanup: EventBus::new("cleanup-completed"),
                disposed: AtomicBool::new(false),
            }),
            periodic: Mutex::new(None),
        }
    }

    /// Builds options and the scanner from the shared configuration.
    #[must_use]
    pub fn from_config(config: &CredentialConfig, auditor: Arc<SecurityAuditor>) -> Self {
        Self::new(
            ValidatorOptions::from(config),
            auditor,
            Arc::new(SensitiveDataScanner::from_config(config)),
        )
    }

    /// Validator options.
    #[must_use]
    pub fn options(&self) -> &ValidatorOptions {
        &self.inner.options
    }

    /// Adds a surface searched by in-memory leak scans.
    pub fn register_memory_surface(&self, surface: Arc<dyn MemorySurface>) {
        self.inner.surfaces.write().push(surface);
    }

    /// Adds memory included in reclamation passes.
    pub fn register_reclaimable(&self, memory: Arc<dyn ReclaimableMemory>) {
        self.inner.reclaimable.write().push(memory);
    }

    /// Registers a manager's readable surface and its container's memory.
    pub fn watch_lifecycle(&self, manager: &Arc<CredentialLifecycleManager>) {
        self.register_memory_surface(Arc::clone(manager) as Arc<dyn MemorySurface>);
        self.register_reclaimable(Arc::clone(manager.container()) as Arc<dyn ReclaimableMemory>);
    }

    /// Subscribes to completed validations.
    pub fn subscribe_validation<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ValidationEvent) + Send + Sync + 'static,
    {
        self.inner.validated.subscribe(handler)
    }

    /// Subscribes to failed validations.
    pub fn subscribe_failures<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ValidationFailed) + Send + Sync + 'static,
    {
        self.inner.failed.subscribe(handler)
    }

    /// Subscribes to reclamation passes.
    pub fn subscribe_cleanup_completed<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&CleanupCompleted) + Send + Sync + 'static,
    {
        self.inner.cleanup.subscribe(handler)
    }

    /// Validations currently in progress.
    #[must_use]
    pub fn active_validation_sessions(&self) -> Vec<ValidationSession> {
        let mut sessions: Vec<ValidationSession> =
            self.inner.sessions.lock().values().cloned().collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    /// Checks `target` against `expected` with the configured rules.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::ResourceDisposed`] after disposal.
    pub fn validate_cleanup_state(
        &self,
        target: &dyn CleanupTarget,
        expected: &ExpectedState,
    ) -> Result<ValidationResult> {
        self.inner.validate_cleanup_state(target, expected)
    }

    /// Searches `scope` for any of `identifiers`.
    ///
    /// Passes only when nothing was found and the whole scope was searched.
    /// The context carries `zero_leak_achieved`. When `cancel` fires or the
    /// validation timeout elapses, the remaining areas are skipped and a
    /// partial result is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::ArgumentInvalid`] when `identifiers` is
    /// empty or holds an empty value, and
    /// [`ValidationError::ResourceDisposed`] after disposal.
    pub async fn validate_zero_sensitive_data_leak(
        &self,
        identifiers: &[&str],
        scope: LeakScanScope,
        cancel: &CancellationToken,
    ) -> Result<ValidationResult> {
        let inner = &self.inner;
        inner.ensure_active()?;
        if identifiers.is_empty() {
            return Err(ValidationError::invalid("identifiers", "at least one identifier is required"));
        }
        if identifiers.iter().any(|id| id.is_empty()) {
            return Err(ValidationError::invalid("identifiers", "identifiers cannot be empty"));
        }

        let (_session, mut run) = inner.begin(ValidationType::ZeroSensitiveDataLeak, scope.as_str());
        let budget = ScanBudget {
            cancel: cancel.clone(),
            deadline: Instant::now() + inner.options.validation_timeout,
        };
        let mut interrupted = None;

        for &step in scope.steps() {
            let rule = step.rule_name();
            if interrupted.is_none() {
                interrupted = budget.interruption();
            }
            if let Some(reason) = interrupted {
                run.rule(rule, RuleStatus::Skipped);
                run.message(
                    MessageLevel::Warning,
                    Some(rule),
                    format!("scan {} before this area was searched", reason.as_str()),
                );
                continue;
            }

            let before = run.findings_len();
            let findings = match step {
                ScanStep::Memory => {
                    let surfaces = inner.surfaces.read().clone();
                    run.context("memory_surfaces", surfaces.len());
                    scope::scan_surfaces(&surfaces, identifiers)
                }
                ScanStep::Environment => {
                    let vars = std::env::vars_os().map(|(k, v)| {
                        (k.to_string_lossy().into_owned(), v.to_string_lossy().into_owned())
                    });
                    scope::scan_environment(vars, identifiers, &inner.env_names, &inner.scanner)
                }
                ScanStep::TempFiles => {
                    let scan = scope::scan_temp_files(
                        &inner.options.temp_dir,
                        inner.options.temp_scan_max_file_bytes,
                        identifiers,
                        &inner.scanner,
                        &budget,
                    )
                    .await;
                    run.context("temp_files_scanned", scan.files_scanned);
                    run.context("temp_files_skipped", scan.files_skipped);
                    interrupted = scan.interrupted;
                    scan.findings
                }
            };
            let found = findings.len();
            for finding in findings {
                run.finding(finding);
            }
            debug!(area = rule, found, "leak scan area searched");

            match (found, interrupted) {
                (0, Some(reason)) => {
                    run.rule(rule, RuleStatus::Skipped);
                    run.message(
                        MessageLevel::Warning,
                        Some(rule),
                        format!("scan {} part way through this area", reason.as_str()),
                    );
                }
                (0, None) => {
                    run.check(rule, true);
                }
                _ => {
                    run.check(rule, false);
                    run.message(
                        MessageLevel::Critical,
                        Some(rule),
                        format!("{} leaked identifier occurrence(s)", run.findings_len() - before),
                    );
                }
            }
        }

        let complete = interrupted.is_none();
        let zero_leak = complete && run.findings_len() == 0;
        if let Some(reason) = interrupted {
            run.message(
                MessageLevel::Error,
                None,
                format!("scan {}; zero leak cannot be confirmed", reason.as_str()),
            );
            run.context("interrupted", reason.as_str());
        }
        run.context("identifiers", identifiers.len());
        run.context("partial", !complete);
        run.context("zero_leak_achieved", zero_leak);
        Ok(inner.finish(run))
    }

    /// Compares `parameters` with earlier invocations of `operation_id`.
    ///
    /// Only parameter digests are remembered. The first invocation is
    /// trivially idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::ArgumentInvalid`] for an empty id and
    /// [`ValidationError::ResourceDisposed`] after disposal.
    pub fn validate_idempotency(
        &self,
        operation_id: &str,
        parameters: &serde_json::Value,
    ) -> Result<ValidationResult> {
        let inner = &self.inner;
        inner.ensure_active()?;
        if operation_id.trim().is_empty() {
            return Err(ValidationError::invalid("operation_id", "cannot be empty"));
        }

        let (_session, mut run) = inner.begin(ValidationType::Idempotency, operation_id);
        let canonical = serde_json::to_vec(&canonicalize(parameters)).unwrap_or_default();
        let digest = blake3::hash(&canonical).to_hex().to_string();

        let (prior, conflicting) = {
            let mut history = inner.history.lock();
            let seen = history.entry(operation_id.to_string()).or_default();
            let prior = seen.len();
            let conflicting = seen.iter().filter(|d| **d != digest).count();
            seen.push_back(digest);
            while seen.len() > inner.options.max_operation_history.max(1) {
                seen.pop_front();
            }
            (prior, conflicting)
        };

        run.check("ParametersConsistent", conflicting == 0);
        if prior == 0 {
            run.message(MessageLevel::Info, None, "first invocation");
        }
        if conflicting > 0 {
            run.message(
                MessageLevel::Error,
                Some("ParametersConsistent"),
                format!("{conflicting} earlier invocation(s) used different parameters"),
            );
        }
        run.context("prior_invocations", prior);
        run.context("conflicting_invocations", conflicting);
        Ok(inner.finish(run))
    }

    /// Checks the share of successful cleanups in the audit trail.
    ///
    /// Passes when `succeeded / total >= minimum_rate`; a window without
    /// cleanups passes.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::ArgumentInvalid`] when `minimum_rate` is
    /// outside `[0, 1]` and [`ValidationError::ResourceDisposed`] after
    /// disposal.
    pub fn validate_cleanup_success_rate(
        &self,
        window: Option<TimeRange>,
        minimum_rate: f64,
    ) -> Result<ValidationResult> {
        let inner = &self.inner;
        inner.ensure_active()?;
        if !(0.0..=1.0).contains(&minimum_rate) {
            return Err(ValidationError::invalid("minimum_rate", "must be within [0, 1]"));
        }

        let (_session, mut run) = inner.begin(ValidationType::CleanupSuccessRate, "audit_trail");
        let rule = "SuccessRateAtLeastMinimum";
        run.context("minimum_rate", minimum_rate);

        match inner.auditor.statistics(window) {
            Ok(stats) => {
                let total = stats.cleanup_total();
                run.context("total", total);
                run.context("succeeded", stats.cleanup_succeeded);
                run.context("failed", stats.cleanup_failed);
                if total == 0 {
                    run.check(rule, true);
                    run.context("vacuous", true);
                    run.message(MessageLevel::Info, Some(rule), "no cleanup operations in window");
                } else {
                    let actual = stats.cleanup_succeeded as f64 / total as f64;
                    run.context("actual_rate", actual);
                    run.context("vacuous", false);
                    run.check(rule, actual >= minimum_rate);
                    if actual < minimum_rate {
                        run.message(
                            MessageLevel::Error,
                            Some(rule),
                            format!("cleanup success rate {actual:.3} is below {minimum_rate:.3}"),
                        );
                    }
                }
            }
            Err(e) => {
                run.check(rule, false);
                run.message(MessageLevel::Error, Some(rule), format!("audit statistics unavailable: {e}"));
            }
        }
        Ok(inner.finish(run))
    }

    /// Runs a reclamation pass over registered memory and checks that no
    /// memory grew beyond the tolerance.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::ResourceDisposed`] after disposal.
    pub fn validate_memory_cleanup_integrity(&self) -> Result<ValidationResult> {
        let inner = &self.inner;
        inner.ensure_active()?;
        let (_session, mut run) = inner.begin(ValidationType::MemoryCleanupIntegrity, "memory");
        let targets = inner.reclaimable.read().clone();
        let tolerance = inner.options.memory_leak_tolerance_bytes;

        let (mut before_total, mut after_total, mut freed, mut reclaimed) = (0, 0, 0, 0);
        let mut leak_detected = false;

        if targets.is_empty() {
            run.rule("ReclaimableMemoryRegistered", RuleStatus::Skipped);
            run.message(MessageLevel::Warning, None, "no reclaimable memory registered");
        }
        for memory in &targets {
            let before = memory.live_bytes();
            reclaimed += memory.reclaim();
            let after = memory.live_bytes();
            before_total += before;
            after_total += after;
            freed += before.saturating_sub(after);

            let grew = after > before.saturating_add(tolerance);
            leak_detected |= grew;
            let rule = format!("NoGrowth:{}", memory.memory_name());
            run.check(rule.as_str(), !grew);
            if grew {
                run.message(
                    MessageLevel::Error,
                    Some(rule.as_str()),
                    format!("live bytes grew from {before} to {after} during reclamation"),
                );
            }
        }

        run.context("before_bytes", before_total);
        run.context("after_bytes", after_total);
        run.context("freed_bytes", freed);
        run.context("reclaimed_items", reclaimed);

        inner.cleanup.publish(&CleanupCompleted {
            freed_bytes: freed,
            reclaimed_items: reclaimed,
            leak_detected,
            at: Utc::now(),
        });
        Ok(inner.finish(run))
    }

    /// Starts re-checking `target` against `expected` on the configured
    /// interval. Failures are published as [`ValidationFailed`].
    ///
    /// Returns `false` when periodic validation is disabled or already
    /// running.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::RuntimeUnavailable`] outside a tokio
    /// runtime and [`ValidationError::ResourceDisposed`] after disposal.
    pub fn start_periodic_validation(
        &self,
        target: Arc<dyn CleanupTarget>,
        expected: ExpectedState,
    ) -> Result<bool> {
        self.inner.ensure_active()?;
        let Some(interval) = self.inner.options.periodic_interval else {
            return Ok(false);
        };
        tokio::runtime::Handle::try_current().map_err(|_| ValidationError::RuntimeUnavailable)?;

        let mut periodic = self.periodic.lock();
        if periodic.as_ref().is_some_and(ScheduledTask::is_running) {
            return Ok(false);
        }
        let inner = Arc::clone(&self.inner);
        *periodic = ScheduledTask::spawn("periodic-validation", interval, move || {
            let inner = Arc::clone(&inner);
            let target = Arc::clone(&target);
            let expected = expected.clone();
            async move {
                match inner.validate_cleanup_state(target.as_ref(), &expected) {
                    Ok(_) => TickControl::Continue,
                    Err(_) => TickControl::Stop,
                }
            }
        });
        Ok(periodic.is_some())
    }

    /// Stops the periodic check, if running, and waits for it.
    pub async fn stop_periodic_validation(&self) {
        let task = self.periodic.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
    }

    /// Invocations remembered for `operation_id`.
    #[must_use]
    pub fn operation_history_len(&self, operation_id: &str) -> usize {
        self.inner
            .history
            .lock()
            .get(operation_id)
            .map_or(0, VecDeque::len)
    }

    /// Stops background work and disposes.
    pub async fn shutdown(&self) {
        self.stop_periodic_validation().await;
        self.dispose();
    }

    /// Whether the validator was disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Cancels background work and forgets all history. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.periodic.lock().take() {
            task.cancel();
        }
        self.inner.history.lock().clear();
        self.inner.surfaces.write().clear();
        self.inner.reclaimable.write().clear();
        self.inner.validated.clear();
        self.inner.failed.clear();
        self.inner.cleanup.clear();
        info!("cleanup validator disposed");
    }
}

impl Drop for CleanupValidator {
    fn drop(&mut self) {
        if let Some(task) = self.periodic.lock().take() {
            task.cancel();
        }
    }
}

impl fmt::Debug for CleanupValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupValidator")
            .field("options", &self.inner.options)
            .field("active_sessions", &self.inner.sessions.lock().len())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

/// Rebuilds `value` with object keys in sorted order.
fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            serde_json::Value::Object(
                keys.into_iter()
                    .map(|k| (k.clone(), canonicalize(&map[k])))
                    .collect(),
            )
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use credkeep_audit::{AuditOutcome, AuditorOptions, NoopAuditSink};
    use credkeep_secrets::{SecretContainer, SecretKind};
    use serde_json::json;

    use crate::target::TargetSnapshot;

    struct FixedTarget(Option<TargetSnapshot>);

    impl CleanupTarget for FixedTarget {
        fn target_name(&self) -> &str {
            "fixed"
        }

        fn snapshot(&self) -> Option<TargetSnapshot> {
            self.0.clone()
        }
    }

    struct Growing {
        bytes: Mutex<usize>,
    }

    impl ReclaimableMemory for Growing {
        fn memory_name(&self) -> &str {
            "growing"
        }

        fn live_bytes(&self) -> usize {
            *self.bytes.lock()
        }

        fn reclaim(&self) -> usize {
            *self.bytes.lock() += 4096;
            0
        }
    }

    fn auditor() -> Arc<SecurityAuditor> {
        Arc::new(SecurityAuditor::new(
            AuditorOptions::default(),
            Arc::new(NoopAuditSink::new()),
            Arc::new(SensitiveDataScanner::with_defaults()),
        ))
    }

    fn validator_with(options: ValidatorOptions) -> (CleanupValidator, Arc<SecurityAuditor>) {
        let auditor = auditor();
        let validator = CleanupValidator::new(
            options,
            Arc::clone(&auditor),
            Arc::new(SensitiveDataScanner::with_defaults()),
        );
        (validator, auditor)
    }

    fn validator() -> (CleanupValidator, Arc<SecurityAuditor>) {
        let dir = std::env::temp_dir().join(format!("credkeep-empty-{}", Uuid::new_v4()));
        validator_with(ValidatorOptions {
            temp_dir: dir,
            ..ValidatorOptions::default()
        })
    }

    #[test]
    fn cleared_container_passes_cleanup_state() {
        let (validator, _) = validator();
        let container = SecretContainer::default();
        container
            .store(SecretKind::Access, b"value", chrono::Duration::minutes(5))
            .expect("store");
        container.clear_all().expect("clear");

        let result = validator
            .validate_cleanup_state(&container, &ExpectedState::cleared())
            .expect("validate");
        assert!(result.is_valid);
        assert!(result.verify_checksum());
        assert_eq!(result.rule("SlotsMatchExpectation"), Some(RuleStatus::Passed));
        assert_eq!(result.rule("NoSecretMaterialInAudit"), Some(RuleStatus::Skipped));
        assert_eq!(result.failed, 0);
        assert!(result.confidence > 0.7 && result.confidence < 1.0);
    }

    #[test]
    fn held_slots_and_residue_fail_cleanup_state() {
        let (validator, _) = validator();
        let target = FixedTarget(Some(TargetSnapshot {
            occupied: vec!["access".into(), "refresh".into()],
            expired_residue: vec!["refresh".into()],
            live_bytes: 32,
        }));

        let result = validator
            .validate_cleanup_state(&target, &ExpectedState::holding(["access"]))
            .expect("validate");
        assert!(!result.is_valid);
        assert_eq!(result.rule("SlotsMatchExpectation"), Some(RuleStatus::Failed));
        assert_eq!(result.rule("NoExpiredResidue"), Some(RuleStatus::Failed));
        assert!(result.messages.iter().any(|m| m.text.contains("refresh")));
    }

    #[test]
    fn unreadable_target_is_critical_and_skips_dependent_rules() {
        let (validator, _) = validator();
        let result = validator
            .validate_cleanup_state(&FixedTarget(None), &ExpectedState::cleared())
            .expect("validate");
        assert!(!result.is_valid);
        assert_eq!(result.rule("TargetAccessible"), Some(RuleStatus::Failed));
        assert_eq!(result.rule("SlotsMatchExpectation"), Some(RuleStatus::Skipped));
        assert_eq!(result.messages_at_least(MessageLevel::Critical).count(), 1);
    }

    #[test]
    fn forbidden_values_in_audit_trail_fail() {
        let (validator, auditor) = validator();
        auditor
            .log_security_violation("user pasted zebra-canary-42", credkeep_audit::Severity::Low)
            .expect("log");

        let expected = ExpectedState::cleared().with_forbidden_values(["zebra-canary-42"]);
        assert!(!format!("{expected:?}").contains("zebra"));

        let result = validator
            .validate_cleanup_state(&FixedTarget(Some(TargetSnapshot::default())), &expected)
            .expect("validate");
        assert_eq!(result.rule("NoSecretMaterialInAudit"), Some(RuleStatus::Failed));
        assert!(!serde_json::to_string(&result).expect("json").contains("zebra-canary-42"));
    }

    #[test]
    fn disabled_rules_are_not_evaluated() {
        let (validator, _) = validator_with(ValidatorOptions {
            rules: [ValidationRule::TargetAccessible].into_iter().collect(),
            ..ValidatorOptions::default()
        });
        let result = validator
            .validate_cleanup_state(&FixedTarget(Some(TargetSnapshot::default())), &ExpectedState::cleared())
            .expect("validate");
        assert_eq!(result.rules.len(), 1);
        assert!((result.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn idempotency_flags_only_changed_parameters() {
        let (validator, _) = validator();

        let first = validator
            .validate_idempotency("clear-all", &json!({"scope": "all", "force": true}))
            .expect("first");
        assert!(first.is_valid);
        assert_eq!(first.context["prior_invocations"], json!(0));

        let same = validator
            .validate_idempotency("clear-all", &json!({"force": true, "scope": "all"}))
            .expect("same");
        assert!(same.is_valid);

        let changed = validator
            .validate_idempotency("clear-all", &json!({"scope": "access"}))
            .expect("changed");
        assert!(!changed.is_valid);
        assert_eq!(changed.context["conflicting_invocations"], json!(2));

        let other = validator
            .validate_idempotency("other-op", &json!({"scope": "access"}))
            .expect("other");
        assert!(other.is_valid);
        assert_eq!(validator.operation_history_len("clear-all"), 3);
    }

    #[test]
    fn idempotency_rejects_empty_operation_id() {
        let (validator, _) = validator();
        assert!(matches!(
            validator.validate_idempotency(" ", &json!({})),
            Err(ValidationError::ArgumentInvalid { field: "operation_id", .. })
        ));
    }

    #[test]
    fn success_rate_uses_audit_statistics() {
        let (validator, auditor) = validator();
        for _ in 0..9 {
            auditor
                .log_cleanup_operation("explicit", 1, AuditOutcome::Success)
                .expect("log");
        }
        auditor
            .log_cleanup_operation("explicit", 0, AuditOutcome::Failure)
            .expect("log");

        let lenient = validator
            .validate_cleanup_success_rate(None, 0.85)
            .expect("validate");
        assert!(lenient.is_valid);
        assert_eq!(lenient.context["total"], json!(10));

        let strict = validator
            .validate_cleanup_success_rate(None, 0.95)
            .expect("validate");
        assert!(!strict.is_valid);
    }

    #[test]
    fn success_rate_without_cleanups_passes_vacuously() {
        let (validator, _) = validator();
        let result = validator
            .validate_cleanup_success_rate(None, 1.0)
            .expect("validate");
        assert!(result.is_valid);
        assert_eq!(result.context_flag("vacuous"), Some(true));
        assert!(validator.validate_cleanup_success_rate(None, 1.5).is_err());
        assert!(validator.validate_cleanup_success_rate(None, f64::NAN).is_err());
    }

    #[test]
    fn memory_integrity_reports_freed_bytes() {
        let (validator, _) = validator();
        let container = Arc::new(SecretContainer::default());
        container
            .store(SecretKind::Access, b"expired!", chrono::Duration::zero())
            .expect("store");
        container
            .store(SecretKind::Refresh, b"live", chrono::Duration::minutes(5))
            .expect("store");
        validator.register_reclaimable(Arc::clone(&container) as Arc<dyn ReclaimableMemory>);

        let completed = Arc::new(Mutex::new(None));
        let c = Arc::clone(&completed);
        validator.subscribe_cleanup_completed(move |event: &CleanupCompleted| {
            *c.lock() = Some(event.clone());
        });

        let result = validator.validate_memory_cleanup_integrity().expect("validate");
        assert!(result.is_valid);
        assert_eq!(result.context["freed_bytes"], json!(8));
        assert_eq!(result.context["after_bytes"], json!(4));

        let event = completed.lock().clone().expect("event");
        assert_eq!(event.reclaimed_items, 1);
        assert!(!event.leak_detected);
    }

    #[test]
    fn memory_growth_beyond_tolerance_is_a_leak() {
        let (validator, _) = validator_with(ValidatorOptions {
            memory_leak_tolerance_bytes: 1024,
            ..ValidatorOptions::default()
        });
        validator.register_reclaimable(Arc::new(Growing {
            bytes: Mutex::new(0),
        }));

        let result = validator.validate_memory_cleanup_integrity().expect("validate");
        assert!(!result.is_valid);
        assert_eq!(result.rule("NoGrowth:growing"), Some(RuleStatus::Failed));
    }

    #[tokio::test]
    async fn in_memory_scan_finds_held_identifiers() {
        let (validator, _) = validator();
        let container = Arc::new(SecretContainer::default());
        container
            .store(SecretKind::Access, b"held-identifier-1", chrono::Duration::minutes(5))
            .expect("store");
        validator.register_memory_surface(Arc::clone(&container) as Arc<dyn MemorySurface>);

        let cancel = CancellationToken::new();
        let result = validator
            .validate_zero_sensitive_data_leak(&["held-identifier-1"], LeakScanScope::InMemory, &cancel)
            .await
            .expect("scan");
        assert!(!result.is_valid);
        assert_eq!(result.context_flag("zero_leak_achieved"), Some(false));
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].location, "memory:secret_container");

        container.clear_all().expect("clear");
        let result = validator
            .validate_zero_sensitive_data_leak(&["held-identifier-1"], LeakScanScope::InMemory, &cancel)
            .await
            .expect("scan");
        assert!(result.is_valid);
        assert_eq!(result.context_flag("zero_leak_achieved"), Some(true));
        assert!(!serde_json::to_string(&result).expect("json").contains("held-identifier-1"));
    }

    #[tokio::test]
    async fn temp_file_scan_detects_leaks() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("crash.dmp"), b"...refresh=temp-leak-identifier...").expect("write");
        let (validator, _) = validator_with(ValidatorOptions {
            temp_dir: dir.path().to_path_buf(),
            ..ValidatorOptions::default()
        });

        let result = validator
            .validate_zero_sensitive_data_leak(
                &["temp-leak-identifier"],
                LeakScanScope::TempFiles,
                &CancellationToken::new(),
            )
            .await
            .expect("scan");
        assert!(!result.is_valid);
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.context["temp_files_scanned"], json!(1));
    }

    #[tokio::test]
    async fn cancelled_full_scan_is_partial_and_leaves_no_session() {
        let (validator, _) = validator();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = validator
            .validate_zero_sensitive_data_leak(&["anything-at-all"], LeakScanScope::Full, &cancel)
            .await
            .expect("scan");
        assert!(!result.is_valid);
        assert!(result.verify_checksum());
        assert_eq!(result.skipped, 3);
        assert_eq!(result.context_flag("partial"), Some(true));
        assert_eq!(result.context_flag("zero_leak_achieved"), Some(false));
        assert_eq!(result.context["interrupted"], json!("cancelled"));
        assert!(validator.active_validation_sessions().is_empty());
    }

    #[tokio::test]
    async fn empty_identifiers_are_rejected() {
        let (validator, _) = validator();
        let cancel = CancellationToken::new();
        assert!(matches!(
            validator
                .validate_zero_sensitive_data_leak(&[], LeakScanScope::InMemory, &cancel)
                .await,
            Err(ValidationError::ArgumentInvalid { .. })
        ));
        assert!(matches!(
            validator
                .validate_zero_sensitive_data_leak(&[""], LeakScanScope::InMemory, &cancel)
                .await,
            Err(ValidationError::ArgumentInvalid { .. })
        ));
    }

    #[test]
    fn validations_are_audited_and_published() {
        let (validator, auditor) = validator();
        let seen = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        let f = Arc::clone(&failures);
        validator.subscribe_validation(move |_: &ValidationEvent| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        validator.subscribe_failures(move |event: &ValidationFailed| {
            assert_eq!(event.failed_rules, vec!["TargetAccessible".to_string()]);
            f.fetch_add(1, Ordering::SeqCst);
        });

        validator
            .validate_cleanup_state(&FixedTarget(Some(TargetSnapshot::default())), &ExpectedState::cleared())
            .expect("validate");
        validator
            .validate_cleanup_state(&FixedTarget(None), &ExpectedState::cleared())
            .expect("validate");

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        let stats = auditor.statistics(None).expect("stats");
        assert_eq!(stats.by_type[&credkeep_audit::AuditEventType::Validation], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_validation_publishes_failures() {
        let (validator, _) = validator_with(ValidatorOptions {
            periodic_interval: Some(Duration::from_secs(10)),
            ..ValidatorOptions::default()
        });
        let failures = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&failures);
        validator.subscribe_failures(move |_: &ValidationFailed| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        let target = Arc::new(FixedTarget(Some(TargetSnapshot {
            occupied: vec!["access".into()],
            expired_residue: Vec::new(),
            live_bytes: 8,
        })));
        assert!(
            validator
                .start_periodic_validation(target.clone(), ExpectedState::cleared())
                .expect("start")
        );
        assert!(
            !validator
                .start_periodic_validation(target, ExpectedState::cleared())
                .expect("start again")
        );

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(failures.load(Ordering::SeqCst), 2);

        validator.shutdown().await;
        assert!(validator.is_disposed());
    }

    #[test]
    fn disposed_validator_rejects_calls() {
        let (validator, _) = validator();
        validator.dispose();
        validator.dispose();
        assert!(matches!(
            validator.validate_memory_cleanup_integrity(),
            Err(ValidationError::ResourceDisposed)
        ));
        assert!(matches!(
            validator.validate_idempotency("op", &json!(null)),
            Err(ValidationError::ResourceDisposed)
        ));
    }

    #[test]
    fn periodic_validation_needs_runtime_only_when_enabled() {
        let (disabled, _) = validator_with(ValidatorOptions {
            periodic_interval: None,
            ..ValidatorOptions::default()
        });
        let target: Arc<dyn CleanupTarget> = Arc::new(FixedTarget(None));
        assert!(!disabled
            .start_periodic_validation(Arc::clone(&target), ExpectedState::cleared())
            .expect("disabled"));

        let (enabled, _) = validator_with(ValidatorOptions {
            periodic_interval: Some(Duration::from_secs(1)),
            ..ValidatorOptions::default()
        });
        assert!(matches!(
            enabled.start_periodic_validation(target, ExpectedState::cleared()),
            Err(ValidationError::RuntimeUnavailable)
        ));
    }
}
