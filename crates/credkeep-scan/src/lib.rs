//! # credkeep-scan
//!
//! Detects and redacts secret-shaped substrings.
//!
//! - [`SensitiveDataScanner::scan_text`] reports findings with masked values
//! - [`SensitiveDataScanner::redact_text`] rewrites text with matches masked
//! - [`SensitiveDataScanner::filter_sensitive_data`] redacts JSON maps by key
//!   name and by value pattern
//!
//! Every pattern runs under its own time budget. A pattern that exceeds it
//! is reported as skipped and the remaining patterns still run.
//!
//! ## Example
//!
//! ```rust
//! use credkeep_scan::SensitiveDataScanner;
//!
//! let scanner = SensitiveDataScanner::with_defaults();
//! let report = scanner.scan_text("password=Secret123!", "example");
//!
//! assert!(report.contains_sensitive);
//! assert_eq!(report.findings[0].pattern_type, "Password");
//! assert!(!report.findings[0].masked_value.contains("Secret123!"));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod pattern;
pub mod scanner;
pub mod types;

pub use error::{Result, ScanError};
pub use pattern::{Redaction, SensitivePattern, builtin_patterns, mask_value};
pub use scanner::{ScannerOptions, SensitiveDataScanner, SensitiveKeyMatcher};
pub use types::{RiskLevel, ScanReport, SensitiveFinding, SkippedPattern};
