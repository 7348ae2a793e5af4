//! The scanner: pattern table management, text scanning, redaction and
//! key-aware filtering of JSON maps.

use std::sync::Arc;
use std::time::{Duration, Instant};

use credkeep_config::CredentialConfig;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::ScanError;
use crate::pattern::{FULL_MASK, SensitivePattern, builtin_patterns};
use crate::types::{ScanReport, SensitiveFinding, SkippedPattern};

/// Nesting depth beyond which map filtering stops descending.
const MAX_FILTER_DEPTH: usize = 64;

/// Placeholder for values nested deeper than [`MAX_FILTER_DEPTH`].
const DEPTH_PLACEHOLDER: &str = "[TRUNCATED]";

/// Tunables for a scanner instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerOptions {
    /// Time budget per pattern per scan.
    pub pattern_timeout: Duration,
    /// Inputs longer than this are truncated before scanning.
    pub max_scan_bytes: usize,
    /// Characters of surrounding text included in each finding.
    pub context_chars: usize,
}

impl Default for ScannerOptions {
    fn default() -> Self {
        Self {
            pattern_timeout: Duration::from_millis(100),
            max_scan_bytes: 1024 * 1024,
            context_chars: 24,
        }
    }
}

impl From<&CredentialConfig> for ScannerOptions {
    fn from(config: &CredentialConfig) -> Self {
        Self {
            pattern_timeout: config.scan_pattern_timeout(),
            max_scan_bytes: config.max_scan_bytes,
            ..Self::default()
        }
    }
}

/// Decides whether a map key names a sensitive value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensitiveKeyMatcher {
    fragments: Vec<String>,
    case_sensitive: bool,
}

impl SensitiveKeyMatcher {
    /// Builds a matcher from key fragments.
    #[must_use]
    pub fn new<I, S>(fragments: I, case_sensitive: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fragments = fragments
            .into_iter()
            .map(Into::into)
            .filter(|f: &String| !f.is_empty())
            .map(|f| if case_sensitive { f } else { f.to_lowercase() })
            .collect();
        Self {
            fragments,
            case_sensitive,
        }
    }

    /// Whether `key` contains any configured fragment.
    #[must_use]
    pub fn is_sensitive(&self, key: &str) -> bool {
        if self.case_sensitive {
            self.fragments.iter().any(|f| key.contains(f.as_str()))
        } else {
            let key = key.to_lowercase();
            self.fragments.iter().any(|f| key.contains(f.as_str()))
        }
    }
}

impl Default for SensitiveKeyMatcher {
    fn default() -> Self {
        let config = CredentialConfig::default();
        Self::new(config.sensitive_key_substrings, config.sensitive_keys_case_sensitive)
    }
}

/// A match found during a scan, before rendering.
struct RawMatch {
    pattern: Arc<SensitivePattern>,
    start: usize,
    end: usize,
    masked: String,
}

/// Text with selected matches replaced, plus where each match landed.
struct Rendered {
    text: String,
    spans: Vec<(usize, usize)>,
}

/// Pattern-based detector and redactor.
///
/// The pattern table is shared behind a lock; scans work on a snapshot so
/// patterns can be added or removed while scans are running.
pub struct SensitiveDataScanner {
    patterns: RwLock<Vec<Arc<SensitivePattern>>>,
    keys: SensitiveKeyMatcher,
    options: ScannerOptions,
}

impl SensitiveDataScanner {
    /// Creates a scanner with the built-in patterns.
    #[must_use]
    pub fn new(options: ScannerOptions, keys: SensitiveKeyMatcher) -> Self {
        Self {
            patterns: RwLock::new(builtin_patterns().into_iter().map(Arc::new).collect()),
            keys,
            options,
        }
    }

    /// Creates a scanner with default options and key fragments.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(ScannerOptions::default(), SensitiveKeyMatcher::default())
    }

    /// Creates a scanner from the shared configuration.
    #[must_use]
    pub fn from_config(config: &CredentialConfig) -> Self {
        Self::new(
            ScannerOptions::from(config),
            SensitiveKeyMatcher::new(
                config.sensitive_key_substrings.iter().cloned(),
                config.sensitive_keys_case_sensitive,
            ),
        )
    }

    /// Scanner options.
    #[must_use]
    pub const fn options(&self) -> &ScannerOptions {
        &self.options
    }

    /// Adds a pattern, replacing any pattern with the same name.
    ///
    /// Returns `true` if an existing pattern was replaced.
    pub fn add_pattern(&self, pattern: SensitivePattern) -> bool {
        let mut patterns = self.patterns.write();
        let name = pattern.name().to_string();
        let replaced = if let Some(slot) = patterns.iter_mut().find(|p| p.name() == name) {
            *slot = Arc::new(pattern);
            true
        } else {
            patterns.push(Arc::new(pattern));
            false
        };
        debug!(pattern = %name, replaced, "pattern added");
        replaced
    }

    /// Removes a pattern by name. Returns `false` if it was not present.
    pub fn remove_pattern(&self, name: &str) -> bool {
        let mut patterns = self.patterns.write();
        let before = patterns.len();
        patterns.retain(|p| p.name() != name);
        patterns.len() != before
    }

    /// Names of the active patterns in evaluation order.
    #[must_use]
    pub fn pattern_names(&self) -> Vec<String> {
        self.patterns.read().iter().map(|p| p.name().to_string()).collect()
    }

    /// Whether a map key names a sensitive value.
    #[must_use]
    pub fn is_sensitive_key(&self, key: &str) -> bool {
        self.keys.is_sensitive(key)
    }

    /// Scans `text` and reports every match.
    ///
    /// Never fails: oversized input is truncated and patterns that exceed
    /// their budget are reported in [`ScanReport::skipped`].
    pub fn scan_text(&self, text: &str, source: &str) -> ScanReport {
        let (text, truncated) = self.bounded(text);
        let (mut matches, skipped) = self.collect_matches(text);
        matches.sort_by(|a, b| {
            a.start
                .cmp(&b.start)
                .then_with(|| b.pattern.risk().cmp(&a.pattern.risk()))
                .then_with(|| b.end.cmp(&a.end))
        });

        let rendered = render(text, &matches);
        let findings: Vec<SensitiveFinding> = matches
            .iter()
            .zip(rendered.spans.iter())
            .map(|(m, span)| SensitiveFinding {
                pattern_type: m.pattern.name().to_string(),
                position: m.start,
                length: m.end - m.start,
                masked_value: m.masked.clone(),
                risk: m.pattern.risk(),
                context: context_window(&rendered.text, *span, self.options.context_chars),
            })
            .collect();

        if !findings.is_empty() {
            debug!(source, findings = findings.len(), "sensitive data detected");
        }

        ScanReport {
            source: source.to_string(),
            contains_sensitive: !findings.is_empty(),
            findings,
            skipped,
            truncated,
            scanned_bytes: text.len(),
        }
    }

    /// Returns `text` with every detected secret masked.
    ///
    /// Overlapping matches are resolved in favour of the earliest, then the
    /// riskiest, then the longest match.
    pub fn redact_text(&self, text: &str) -> String {
        let (bounded, truncated) = self.bounded(text);
        let (mut matches, _) = self.collect_matches(bounded);
        if matches.is_empty() && !truncated {
            return text.to_string();
        }
        matches.sort_by(|a, b| {
            a.start
                .cmp(&b.start)
                .then_with(|| b.pattern.risk().cmp(&a.pattern.risk()))
                .then_with(|| b.end.cmp(&a.end))
        });
        let mut redacted = render(bounded, &matches).text;
        if truncated {
            redacted.push_str(DEPTH_PLACEHOLDER);
        }
        redacted
    }

    /// Redacts a JSON object.
    ///
    /// Values under sensitive key names are replaced whatever their type;
    /// other string values are pattern-redacted. Nested objects and arrays
    /// are filtered recursively.
    pub fn filter_sensitive_data(&self, data: &Map<String, Value>) -> Map<String, Value> {
        self.filter_map(data, 0)
    }

    /// Redacts any JSON value.
    pub fn filter_value(&self, value: &Value) -> Value {
        self.filter_inner(value, 0)
    }

    fn filter_map(&self, data: &Map<String, Value>, depth: usize) -> Map<String, Value> {
        data.iter()
            .map(|(key, value)| {
                let filtered = if self.keys.is_sensitive(key) {
                    Value::String(FULL_MASK.to_string())
                } else {
                    self.filter_inner(value, depth + 1)
                };
                (key.clone(), filtered)
            })
            .collect()
    }

    fn filter_inner(&self, value: &Value, depth: usize) -> Value {
        if depth > MAX_FILTER_DEPTH {
            return Value::String(DEPTH_PLACEHOLDER.to_string());
        }
        match value {
            Value::String(s) => Value::String(self.redact_text(s)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.filter_inner(v, depth + 1)).collect())
            }
            Value::Object(map) => Value::Object(self.filter_map(map, depth)),
            other => other.clone(),
        }
    }

    fn bounded<'a>(&self, text: &'a str) -> (&'a str, bool) {
        if text.len() <= self.options.max_scan_bytes {
            return (text, false);
        }
        let mut end = self.options.max_scan_bytes;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        warn!(
            len = text.len(),
            limit = self.options.max_scan_bytes,
            "scan input truncated"
        );
        (&text[..end], true)
    }

    fn collect_matches(&self, text: &str) -> (Vec<RawMatch>, Vec<SkippedPattern>) {
        let snapshot: Vec<Arc<SensitivePattern>> = self.patterns.read().clone();
        let budget = self.options.pattern_timeout;

        let mut matches = Vec::new();
        let mut skipped = Vec::new();

        for pattern in snapshot {
            let started = Instant::now();
            for caps in pattern.regex().captures_iter(text) {
                if let Some(whole) = caps.get(0) {
                    if !whole.as_str().is_empty() && pattern.accepts(whole.as_str()) {
                        matches.push(RawMatch {
                            pattern: Arc::clone(&pattern),
                            start: whole.start(),
                            end: whole.end(),
                            masked: pattern.mask(&caps),
                        });
                    }
                }
                if started.elapsed() > budget {
                    let err = ScanError::PatternEngineTimeout {
                        pattern: pattern.name().to_string(),
                        budget_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
                    };
                    warn!(error = %err, "skipping remainder of pattern");
                    skipped.push(SkippedPattern {
                        pattern: pattern.name().to_string(),
                        reason: err.to_string(),
                    });
                    break;
                }
            }
        }
        (matches, skipped)
    }
}

impl Default for SensitiveDataScanner {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for SensitiveDataScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensitiveDataScanner")
            .field("patterns", &self.pattern_names())
            .field("options", &self.options)
            .finish()
    }
}

/// Replaces a non-overlapping subset of `matches` (sorted by start) and
/// records where every match, selected or not, ended up in the output.
fn render(text: &str, matches: &[RawMatch]) -> Rendered {
    let mut out = String::with_capacity(text.len());
    let mut spans = vec![(0, 0); matches.len()];
    let mut cursor = 0;
    let mut last_span = (0, 0);
    let mut last_end = 0;

    for (i, m) in matches.iter().enumerate() {
        if m.start < last_end {
            // Overlaps a match that was already rendered.
            spans[i] = last_span;
            continue;
        }
        out.push_str(&text[cursor..m.start]);
        let span_start = out.len();
        out.push_str(&m.masked);
        last_span = (span_start, out.len());
        spans[i] = last_span;
        cursor = m.end;
        last_end = m.end;
    }
    out.push_str(&text[cursor..]);

    Rendered { text: out, spans }
}

fn context_window(text: &str, span: (usize, usize), chars: usize) -> String {
    let start = text[..span.0]
        .char_indices()
        .rev()
        .take(chars)
        .last()
        .map_or(span.0, |(i, _)| i);
    let end = text[span.1..]
        .char_indices()
        .nth(chars)
        .map_or(text.len(), |(i, _)| span.1 + i);
    text[start..end].to_string()
}
