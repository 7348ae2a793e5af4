//! Test helpers for E2E tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Once};

use credkeep_audit::{AuditorOptions, SecurityAuditor, TracingAuditSink};
use credkeep_config::CredentialConfig;
use credkeep_scan::SensitiveDataScanner;
use credkeep_secrets::CredentialLifecycleManager;
use credkeep_validation::{CleanupValidator, ValidatorOptions};

static TRACING: Once = Once::new();

/// Installs a test-friendly subscriber once per test binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// All components wired the way an application wires them.
pub struct Stack {
    pub config: CredentialConfig,
    pub scanner: Arc<SensitiveDataScanner>,
    pub auditor: Arc<SecurityAuditor>,
    pub manager: Arc<CredentialLifecycleManager>,
    pub validator: CleanupValidator,
}

impl Stack {
    /// Builds a stack whose temp scans look only at `temp_dir`.
    pub fn new(config: CredentialConfig, temp_dir: &Path) -> Self {
        init_tracing();
        let scanner = Arc::new(SensitiveDataScanner::from_config(&config));
        let auditor = Arc::new(SecurityAuditor::new(
            AuditorOptions::from(&config),
            Arc::new(TracingAuditSink::new()),
            Arc::clone(&scanner),
        ));
        let manager = Arc::new(CredentialLifecycleManager::from_config(
            &config,
            Arc::clone(&auditor),
        ));
        let validator = CleanupValidator::new(
            ValidatorOptions {
                temp_dir: temp_dir.to_path_buf(),
                ..ValidatorOptions::from(&config)
            },
            Arc::clone(&auditor),
            Arc::clone(&scanner),
        );
        validator.watch_lifecycle(&manager);
        Self {
            config,
            scanner,
            auditor,
            manager,
            validator,
        }
    }

    /// A stack on default configuration.
    pub fn with_defaults(temp_dir: &Path) -> Self {
        Self::new(CredentialConfig::default(), temp_dir)
    }
}
