//! Typed configuration for the credkeep crates.
//!
//! [`CredentialConfig`] is parsed from JSON (every field has a default),
//! optionally overridden from `CREDKEEP_*` environment variables, and then
//! checked by [`CredentialConfig::validate`]. Components derive their own
//! option structs from it.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "CREDKEEP_";

/// Errors produced while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document could not be parsed.
    #[error("config parse error: {reason}")]
    Parse {
        /// Parser message.
        reason: String,
    },

    /// A field holds a value outside its allowed range.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// An environment override could not be applied.
    #[error("invalid environment override {var}: {reason}")]
    EnvOverride {
        /// Variable name.
        var: String,
        /// Why the override was rejected.
        reason: String,
    },
}

/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Conditions under which credential state is cleared automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CleanupTriggerConfig {
    /// Clear all state after this many idle minutes (0 = never).
    pub idle_timeout_minutes: u64,
    /// Allow callers to clear state explicitly.
    pub on_explicit_call: bool,
    /// Clear state when the owning manager is dropped.
    pub on_process_exit: bool,
}

impl Default for CleanupTriggerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_minutes: 0,
            on_explicit_call: true,
            on_process_exit: true,
        }
    }
}

/// Full configuration surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CredentialConfig {
    /// Encrypt secrets held in memory.
    pub encryption_enabled: bool,
    /// Hours between scheduled key rotations (0 = manual only).
    pub key_rotation_interval_hours: u64,
    /// Superseded key versions kept for decryption.
    pub retained_key_versions: usize,
    /// Largest secret accepted by the cipher.
    pub max_secret_bytes: usize,
    /// Minutes between refresh checks (0 = disabled).
    pub token_refresh_interval_minutes: u64,
    /// A refresh is requested when the access token expires within this window.
    pub token_refresh_threshold_minutes: u64,
    /// Upper bound for a single validation run.
    pub validation_timeout_ms: u64,
    /// Seconds between background baseline validations (0 = disabled).
    pub periodic_validation_interval_secs: u64,
    /// Lowest acceptable ratio of successful cleanups.
    pub minimum_cleanup_success_rate: f64,
    /// Growth in live secret bytes tolerated by the memory integrity check.
    pub memory_leak_tolerance_bytes: usize,
    /// Environment variable name fragments treated as sensitive.
    pub sensitive_env_var_substrings: Vec<String>,
    /// Map key fragments whose values are always redacted.
    pub sensitive_key_substrings: Vec<String>,
    /// Match sensitive key fragments case-sensitively.
    pub sensitive_keys_case_sensitive: bool,
    /// Maximum audit entries kept in memory.
    pub audit_max_entries: usize,
    /// Per-pattern time budget while scanning.
    pub scan_pattern_timeout_ms: u64,
    /// Inputs longer than this are truncated before scanning.
    pub max_scan_bytes: usize,
    /// Temp files larger than this are skipped by leak scans.
    pub temp_scan_max_file_bytes: u64,
    /// Automatic cleanup triggers.
    pub cleanup: CleanupTriggerConfig,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            encryption_enabled: true,
            key_rotation_interval_hours: 24,
            retained_key_versions: 3,
            max_secret_bytes: 1024 * 1024,
            token_refresh_interval_minutes: 1,
            token_refresh_threshold_minutes: 5,
            validation_timeout_ms: 30_000,
            periodic_validation_interval_secs: 0,
            minimum_cleanup_success_rate: 0.95,
            memory_leak_tolerance_bytes: 0,
            sensitive_env_var_substrings: ["TOKEN", "SECRET", "PASSWORD", "CREDENTIAL", "API_KEY"]
                .into_iter()
                .map(String::from)
                .collect(),
            sensitive_key_substrings: [
                "password",
                "passwd",
                "secret",
                "token",
                "api_key",
                "apikey",
                "credential",
                "private_key",
                "authorization",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            sensitive_keys_case_sensitive: false,
            audit_max_entries: 10_000,
            scan_pattern_timeout_ms: 100,
            max_scan_bytes: 1024 * 1024,
            temp_scan_max_file_bytes: 1024 * 1024,
            cleanup: CleanupTriggerConfig::default(),
        }
    }
}

impl CredentialConfig {
    /// Parses a JSON document and validates it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the process environment, validated.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `CREDKEEP_*` overrides from the given variables.
    ///
    /// Variables without the prefix are ignored. Returns how many overrides
    /// were applied. List values are comma separated.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<usize>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut applied = 0;
        for (key, value) in vars {
            let key = key.as_ref();
            let Some(field) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref().trim();
            let known = match field {
                "ENCRYPTION_ENABLED" => {
                    self.encryption_enabled = parse_env(key, value)?;
                    true
                }
                "KEY_ROTATION_INTERVAL_HOURS" => {
                    self.key_rotation_interval_hours = parse_env(key, value)?;
                    true
                }
                "RETAINED_KEY_VERSIONS" => {
                    self.retained_key_versions = parse_env(key, value)?;
                    true
                }
                "TOKEN_REFRESH_INTERVAL_MINUTES" => {
                    self.token_refresh_interval_minutes = parse_env(key, value)?;
                    true
                }
                "TOKEN_REFRESH_THRESHOLD_MINUTES" => {
                    self.token_refresh_threshold_minutes = parse_env(key, value)?;
                    true
                }
                "VALIDATION_TIMEOUT_MS" => {
                    self.validation_timeout_ms = parse_env(key, value)?;
                    true
                }
                "PERIODIC_VALIDATION_INTERVAL_SECS" => {
                    self.periodic_validation_interval_secs = parse_env(key, value)?;
                    true
                }
                "MINIMUM_CLEANUP_SUCCESS_RATE" => {
                    self.minimum_cleanup_success_rate = parse_env(key, value)?;
                    true
                }
                "SENSITIVE_ENV_VAR_SUBSTRINGS" => {
                    self.sensitive_env_var_substrings = split_list(value);
                    true
                }
                "SENSITIVE_KEY_SUBSTRINGS" => {
                    self.sensitive_key_substrings = split_list(value);
                    true
                }
                "IDLE_TIMEOUT_MINUTES" => {
                    self.cleanup.idle_timeout_minutes = parse_env(key, value)?;
                    true
                }
                _ => false,
            };
            if known {
                debug!(var = key, "applied config override");
                applied += 1;
            } else {
                warn!(var = key, "ignoring unknown config override");
            }
        }
        Ok(applied)
    }

    /// Checks every field against its allowed range.
    pub fn validate(&self) -> Result<()> {
        let rate = self.minimum_cleanup_success_rate;
        if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
            return Err(ConfigError::InvalidValue {
                field: "minimum_cleanup_success_rate",
                reason: format!("must be within 0.0..=1.0, got {rate}"),
            });
        }
        if self.retained_key_versions == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retained_key_versions",
                reason: "at least the current key must be retained".to_string(),
            });
        }
        if self.max_secret_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_secret_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.validation_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "validation_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.audit_max_entries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "audit_max_entries",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.scan_pattern_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scan_pattern_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_scan_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_scan_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.token_refresh_interval_minutes > 0 && self.token_refresh_threshold_minutes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "token_refresh_threshold_minutes",
                reason: "must be greater than zero when refresh checks are enabled".to_string(),
            });
        }
        if self.sensitive_key_substrings.iter().any(String::is_empty) {
            return Err(ConfigError::InvalidValue {
                field: "sensitive_key_substrings",
                reason: "entries must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Non-fatal observations about a configuration.
    #[must_use]
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.encryption_enabled {
            warnings.push("encryption is disabled; secrets are held in plaintext".to_string());
        }
        if self.encryption_enabled && self.key_rotation_interval_hours == 0 {
            warnings.push("scheduled key rotation is disabled".to_string());
        }
        if self.token_refresh_interval_minutes > self.token_refresh_threshold_minutes
            && self.token_refresh_threshold_minutes > 0
        {
            warnings.push(format!(
                "refresh checks every {}m may miss a {}m threshold",
                self.token_refresh_interval_minutes, self.token_refresh_threshold_minutes
            ));
        }
        if !self.cleanup.on_explicit_call && self.cleanup.idle_timeout_minutes == 0 {
            warnings.push("explicit cleanup is disabled and no idle timeout is set".to_string());
        }
        warnings
    }

    /// Scheduled rotation interval, `None` when disabled.
    #[must_use]
    pub fn key_rotation_interval(&self) -> Option<Duration> {
        non_zero(Duration::from_secs(self.key_rotation_interval_hours.saturating_mul(3600)))
    }

    /// Refresh check interval, `None` when disabled.
    #[must_use]
    pub fn token_refresh_interval(&self) -> Option<Duration> {
        non_zero(Duration::from_secs(self.token_refresh_interval_minutes.saturating_mul(60)))
    }

    /// Refresh threshold window.
    #[must_use]
    pub fn token_refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.token_refresh_threshold_minutes.saturating_mul(60))
    }

    /// Validation timeout.
    #[must_use]
    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }

    /// Background validation interval, `None` when disabled.
    #[must_use]
    pub fn periodic_validation_interval(&self) -> Option<Duration> {
        non_zero(Duration::from_secs(self.periodic_validation_interval_secs))
    }

    /// Idle timeout for automatic cleanup, `None` when disabled.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        non_zero(Duration::from_secs(self.cleanup.idle_timeout_minutes.saturating_mul(60)))
    }

    /// Per-pattern scan budget.
    #[must_use]
    pub fn scan_pattern_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_pattern_timeout_ms)
    }
}

fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}

fn parse_env<T>(var: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::EnvOverride {
        var: var.to_string(),
        reason: e.to_string(),
    })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
