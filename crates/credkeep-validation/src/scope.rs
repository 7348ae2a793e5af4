//! Leak scan scopes and the searches behind them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use credkeep_scan::{RiskLevel, SensitiveDataScanner, SensitiveFinding, SensitiveKeyMatcher, mask_value};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::result::LeakFinding;
use crate::target::MemorySurface;

/// Bytes of surrounding text kept on each side of a match.
const CONTEXT_BYTES: usize = 24;

/// Directory levels below the temp root that are searched.
const MAX_TEMP_DEPTH: usize = 2;

/// Where a zero-leak scan looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeakScanScope {
    /// Registered memory surfaces and the audit trail.
    InMemory,
    /// Process environment variables.
    Environment,
    /// Files under the configured temp directory.
    TempFiles,
    /// All of the above.
    Full,
}

/// One searchable area inside a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanStep {
    Memory,
    Environment,
    TempFiles,
}

impl ScanStep {
    pub(crate) const fn rule_name(self) -> &'static str {
        match self {
            Self::Memory => "NoLeakInMemory",
            Self::Environment => "NoLeakInEnvironment",
            Self::TempFiles => "NoLeakInTempFiles",
        }
    }
}

impl LeakScanScope {
    pub(crate) const fn steps(self) -> &'static [ScanStep] {
        match self {
            Self::InMemory => &[ScanStep::Memory],
            Self::Environment => &[ScanStep::Environment],
            Self::TempFiles => &[ScanStep::TempFiles],
            Self::Full => &[ScanStep::Memory, ScanStep::Environment, ScanStep::TempFiles],
        }
    }

    /// Stable name used in results.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InMemory => "in_memory",
            Self::Environment => "environment",
            Self::TempFiles => "temp_files",
            Self::Full => "full",
        }
    }
}

/// Why a scan stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interruption {
    Cancelled,
    TimedOut,
}

impl Interruption {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Stops a scan on cancellation or after a deadline.
#[derive(Debug, Clone)]
pub(crate) struct ScanBudget {
    pub(crate) cancel: CancellationToken,
    pub(crate) deadline: Instant,
}

impl ScanBudget {
    pub(crate) fn interruption(&self) -> Option<Interruption> {
        if self.cancel.is_cancelled() {
            Some(Interruption::Cancelled)
        } else if Instant::now() >= self.deadline {
            Some(Interruption::TimedOut)
        } else {
            None
        }
    }
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Text around a match with the match masked and the rest redacted.
fn masked_context(haystack: &[u8], position: usize, identifier: &str, scanner: &SensitiveDataScanner) -> String {
    let start = position.saturating_sub(CONTEXT_BYTES);
    let end = (position + identifier.len() + CONTEXT_BYTES).min(haystack.len());
    let before = String::from_utf8_lossy(&haystack[start..position]);
    let after = String::from_utf8_lossy(&haystack[position + identifier.len()..end]);
    let window = format!("{before}{}{after}", mask_value(identifier));
    scanner.redact_text(&window)
}

fn leak(
    location: String,
    haystack: &[u8],
    position: usize,
    identifier: &str,
    risk: RiskLevel,
    scanner: &SensitiveDataScanner,
) -> LeakFinding {
    LeakFinding {
        location,
        finding: SensitiveFinding {
            pattern_type: "Identifier".to_string(),
            position,
            length: identifier.len(),
            masked_value: mask_value(identifier),
            risk,
            context: masked_context(haystack, position, identifier, scanner),
        },
    }
}

/// Checks every surface for every identifier.
///
/// Surfaces expose only a yes/no answer, so findings carry no position.
pub(crate) fn scan_surfaces(surfaces: &[Arc<dyn MemorySurface>], identifiers: &[&str]) -> Vec<LeakFinding> {
    let mut findings = Vec::new();
    for surface in surfaces {
        for identifier in identifiers {
            if surface.contains_bytes(identifier.as_bytes()) {
                findings.push(LeakFinding {
                    location: format!("memory:{}", surface.surface_name()),
                    finding: SensitiveFinding {
                        pattern_type: "Identifier".to_string(),
                        position: 0,
                        length: identifier.len(),
                        masked_value: mask_value(identifier),
                        risk: RiskLevel::Critical,
                        context: format!("identifier held by {}", surface.surface_name()),
                    },
                });
            }
        }
    }
    findings
}

/// Searches environment variable values.
///
/// A leak in a variable whose name looks sensitive is critical; elsewhere
/// it is high.
pub(crate) fn scan_environment<I>(
    vars: I,
    identifiers: &[&str],
    names: &SensitiveKeyMatcher,
    scanner: &SensitiveDataScanner,
) -> Vec<LeakFinding>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut findings = Vec::new();
    for (name, value) in vars {
        let risk = if names.is_sensitive(&name) {
            RiskLevel::Critical
        } else {
            RiskLevel::High
        };
        for identifier in identifiers {
            if let Some(position) = find(value.as_bytes(), identifier.as_bytes()) {
                findings.push(leak(
                    format!("env:{name}"),
                    value.as_bytes(),
                    position,
                    identifier,
                    risk,
                    scanner,
                ));
            }
        }
    }
    findings
}

/// Progress of a temp-file scan.
#[derive(Debug, Default)]
pub(crate) struct TempScan {
    pub(crate) findings: Vec<LeakFinding>,
    pub(crate) files_scanned: usize,
    pub(crate) files_skipped: usize,
    pub(crate) interrupted: Option<Interruption>,
}

/// Searches regular files under `root`, at most [`MAX_TEMP_DEPTH`] levels
/// deep. Files larger than `max_file_bytes` and unreadable entries are
/// skipped.
pub(crate) async fn scan_temp_files(
    root: &Path,
    max_file_bytes: u64,
    identifiers: &[&str],
    scanner: &SensitiveDataScanner,
    budget: &ScanBudget,
) -> TempScan {
    let mut scan = TempScan::default();
    let mut pending: Vec<(PathBuf, usize)> = vec![(root.to_path_buf(), 0)];

    while let Some((dir, depth)) = pending.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            debug!(dir = %dir.display(), "temp directory not readable");
            continue;
        };
        loop {
            if let Some(reason) = budget.interruption() {
                scan.interrupted = Some(reason);
                return scan;
            }
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(_) => {
                    scan.files_skipped += 1;
                    break;
                }
            };
            let Ok(file_type) = entry.file_type().await else {
                scan.files_skipped += 1;
                continue;
            };
            let path = entry.path();
            if file_type.is_dir() {
                if depth < MAX_TEMP_DEPTH {
                    pending.push((path, depth + 1));
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            let small_enough = entry
                .metadata()
                .await
                .is_ok_and(|meta| meta.len() <= max_file_bytes);
            if !small_enough {
                scan.files_skipped += 1;
                continue;
            }
            let Ok(contents) = tokio::fs::read(&path).await else {
                scan.files_skipped += 1;
                continue;
            };
            scan.files_scanned += 1;
            for identifier in identifiers {
                if let Some(position) = find(&contents, identifier.as_bytes()) {
                    scan.findings.push(leak(
                        format!("file:{}", path.display()),
                        &contents,
                        position,
                        identifier,
                        RiskLevel::Critical,
                        scanner,
                    ));
                }
            }
        }
    }
    scan
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scanner() -> SensitiveDataScanner {
        SensitiveDataScanner::with_defaults()
    }

    fn budget() -> ScanBudget {
        ScanBudget {
            cancel: CancellationToken::new(),
            deadline: Instant::now() + Duration::from_secs(30),
        }
    }

    #[test]
    fn full_scope_covers_every_step() {
        assert_eq!(LeakScanScope::Full.steps().len(), 3);
        assert_eq!(LeakScanScope::InMemory.steps(), &[ScanStep::Memory]);
    }

    #[test]
    fn find_locates_needles() {
        assert_eq!(find(b"abcdef", b"cd"), Some(2));
        assert_eq!(find(b"abc", b""), None);
        assert_eq!(find(b"ab", b"abc"), None);
    }

    #[test]
    fn environment_findings_are_masked_and_ranked() {
        let names = SensitiveKeyMatcher::new(["TOKEN", "SECRET"], false);
        let vars = vec![
            ("HOME".to_string(), "/home/user".to_string()),
            ("MY_TOKEN".to_string(), "prefix-leaked-identifier-suffix".to_string()),
            ("NOTES".to_string(), "leaked-identifier".to_string()),
        ];

        let findings = scan_environment(vars, &["leaked-identifier"], &names, &scanner());
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].location, "env:MY_TOKEN");
        assert_eq!(findings[0].finding.risk, RiskLevel::Critical);
        assert_eq!(findings[0].finding.position, 7);
        assert_eq!(findings[1].finding.risk, RiskLevel::High);
        for finding in &findings {
            assert!(!finding.finding.context.contains("leaked-identifier"));
            assert!(!finding.finding.masked_value.contains("leaked-identifier"));
        }
    }

    #[tokio::test]
    async fn temp_scan_finds_nested_files_and_skips_large_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("nested")).expect("mkdir");
        std::fs::write(dir.path().join("clean.txt"), b"nothing here").expect("write");
        std::fs::write(dir.path().join("nested/dump.log"), b"token: leaked-identifier\n").expect("write");
        std::fs::write(dir.path().join("big.bin"), vec![b'x'; 4096]).expect("write");

        let scan = scan_temp_files(dir.path(), 1024, &["leaked-identifier"], &scanner(), &budget()).await;

        assert_eq!(scan.files_scanned, 2);
        assert_eq!(scan.files_skipped, 1);
        assert!(scan.interrupted.is_none());
        assert_eq!(scan.findings.len(), 1);
        assert!(scan.findings[0].location.ends_with("dump.log"));
        assert_eq!(scan.findings[0].finding.position, 7);
    }

    #[tokio::test]
    async fn cancelled_temp_scan_stops_early() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.txt"), b"leaked-identifier").expect("write");
        let budget = budget();
        budget.cancel.cancel();

        let scan = scan_temp_files(dir.path(), 1024, &["leaked-identifier"], &scanner(), &budget).await;
        assert_eq!(scan.interrupted, Some(Interruption::Cancelled));
        assert!(scan.findings.is_empty());
    }

    #[tokio::test]
    async fn missing_directory_is_empty_scan() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scan = scan_temp_files(&dir.path().join("absent"), 1024, &["x"], &scanner(), &budget()).await;
        assert_eq!(scan.files_scanned, 0);
        assert!(scan.interrupted.is_none());
    }
}
