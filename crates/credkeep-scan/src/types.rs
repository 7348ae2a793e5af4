//! Scan result types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How damaging a leaked match would be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Personal but low-impact data.
    Low = 0,
    /// Personal data such as emails and phone numbers.
    Medium = 1,
    /// Credentials that grant limited access.
    High = 2,
    /// Credentials that grant full access (passwords, private keys).
    Critical = 3,
}

impl RiskLevel {
    /// Returns the string representation of this risk level.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One detected secret-shaped substring.
///
/// The raw match is never stored; only its masked form and a context window
/// in which the match itself is masked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensitiveFinding {
    /// Name of the pattern that matched.
    pub pattern_type: String,
    /// Byte offset of the match in the scanned text.
    pub position: usize,
    /// Length of the match in bytes.
    pub length: usize,
    /// Masked rendering of the match.
    pub masked_value: String,
    /// Risk of the pattern.
    pub risk: RiskLevel,
    /// Surrounding text with the match masked.
    pub context: String,
}

/// A pattern that did not complete during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedPattern {
    /// Pattern name.
    pub pattern: String,
    /// Why it was skipped.
    pub reason: String,
}

/// Outcome of scanning one text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    /// Caller-supplied label for the scanned text.
    pub source: String,
    /// Whether any finding was produced.
    pub contains_sensitive: bool,
    /// Findings ordered by position.
    pub findings: Vec<SensitiveFinding>,
    /// Patterns that were skipped.
    pub skipped: Vec<SkippedPattern>,
    /// Whether the input was truncated before scanning.
    pub truncated: bool,
    /// Bytes actually scanned.
    pub scanned_bytes: usize,
}

impl ScanReport {
    /// Highest risk among the findings.
    #[must_use]
    pub fn max_risk(&self) -> Option<RiskLevel> {
        self.findings.iter().map(|f| f.risk).max()
    }

    /// Findings at or above `risk`.
    pub fn findings_at_least(&self, risk: RiskLevel) -> impl Iterator<Item = &SensitiveFinding> {
        self.findings.iter().filter(move |f| f.risk >= risk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(risk: RiskLevel) -> SensitiveFinding {
        SensitiveFinding {
            pattern_type: "Test".to_string(),
            position: 0,
            length: 4,
            masked_value: "***".to_string(),
            risk,
            context: "***".to_string(),
        }
    }

    #[test]
    fn risk_levels_are_ordered() {
        assert!(RiskLevel::Critical > RiskLevel::High);
        assert!(RiskLevel::High > RiskLevel::Medium);
        assert!(RiskLevel::Medium > RiskLevel::Low);
        assert_eq!(RiskLevel::Critical.to_string(), "critical");
    }

    #[test]
    fn max_risk_and_threshold_filter() {
        let report = ScanReport {
            findings: vec![finding(RiskLevel::Medium), finding(RiskLevel::Critical)],
            contains_sensitive: true,
            ..ScanReport::default()
        };

        assert_eq!(report.max_risk(), Some(RiskLevel::Critical));
        assert_eq!(report.findings_at_least(RiskLevel::High).count(), 1);
        assert_eq!(ScanReport::default().max_risk(), None);
    }
}
