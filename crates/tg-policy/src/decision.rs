// decision.rs — The verdict returned for every operation.
//
// A TrustDecision is produced once per evaluation and never mutated after it
// leaves the engine. `source` records which pipeline stage produced it, so a
// human reviewer can tell a rate-limit escalation from a tamper response
// without parsing the reason string.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How risky an operation is judged to be. Ordered: `Low < Critical`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "LOW"),
            RiskLevel::Medium => write!(f, "MEDIUM"),
            RiskLevel::High => write!(f, "HIGH"),
            RiskLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Which stage of the pipeline produced a decision.
///
/// The last five variants are the error taxonomy: every decision carrying one
/// of them is a fail-closed escalation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Fresh classification against the active policy.
    Classifier,
    /// Served from the exact-operation memo.
    Memo,
    /// Served from the normalized-pattern cache.
    PatternCache,
    /// Malformed operation.
    Validation,
    /// Policy missing, corrupt, or tampered.
    Config,
    /// Suspicious pattern, external-request failure, or manual mode.
    Security,
    /// Per-user hourly cap exceeded.
    RateLimit,
    /// Admission deadline exceeded under load.
    Overload,
    /// Unexpected internal failure.
    Internal,
}

impl fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionSource::Classifier => "classifier",
            DecisionSource::Memo => "memo",
            DecisionSource::PatternCache => "pattern_cache",
            DecisionSource::Validation => "validation",
            DecisionSource::Config => "config",
            DecisionSource::Security => "security",
            DecisionSource::RateLimit => "rate_limit",
            DecisionSource::Overload => "overload",
            DecisionSource::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

/// The engine's verdict plus rationale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TrustDecision {
    pub approved: bool,
    pub requires_manual_approval: bool,
    pub reason: String,
    pub risk_level: RiskLevel,
    pub source: DecisionSource,
}

impl TrustDecision {
    /// Auto-approve: the agent may proceed without a human.
    pub fn approve(risk_level: RiskLevel, reason: impl Into<String>) -> Self {
        Self {
            approved: true,
            requires_manual_approval: false,
            reason: reason.into(),
            risk_level,
            source: DecisionSource::Classifier,
        }
    }

    /// Escalate: a human must approve before the agent proceeds.
    pub fn escalate(
        risk_level: RiskLevel,
        reason: impl Into<String>,
        source: DecisionSource,
    ) -> Self {
        Self {
            approved: false,
            requires_manual_approval: true,
            reason: reason.into(),
            risk_level,
            source,
        }
    }

    /// Hard block: not approved, and not offered to a human either.
    ///
    /// Reserved for requests the guard rejects outright (forged identity,
    /// impossible timestamps).
    pub fn deny(risk_level: RiskLevel, reason: impl Into<String>, source: DecisionSource) -> Self {
        Self {
            approved: false,
            requires_manual_approval: false,
            reason: reason.into(),
            risk_level,
            source,
        }
    }

    /// Return the same verdict attributed to a different stage.
    pub fn with_source(mut self, source: DecisionSource) -> Self {
        self.source = source;
        self
    }

    /// Force a human into the loop, keeping the risk assessment.
    ///
    /// Used for manual-approval mode: the operation is still classified, but
    /// an auto-approval is downgraded to an escalation.
    pub fn require_manual(mut self, reason: &str) -> Self {
        if self.requires_manual_approval {
            return self;
        }
        self.approved = false;
        self.requires_manual_approval = true;
        self.reason = format!("{} (was: {})", reason, self.reason);
        self.source = DecisionSource::Security;
        self
    }

    /// True when a human must be involved.
    pub fn is_escalation(&self) -> bool {
        self.requires_manual_approval || !self.approved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_levels_are_ordered() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::High < RiskLevel::Critical);
        assert_eq!(
            [RiskLevel::Medium, RiskLevel::High, RiskLevel::Low]
                .into_iter()
                .max(),
            Some(RiskLevel::High)
        );
    }

    #[test]
    fn require_manual_downgrades_approval() {
        let d = TrustDecision::approve(RiskLevel::Medium, "git status allowed");
        let d = d.require_manual("manual approval mode active");
        assert!(!d.approved);
        assert!(d.requires_manual_approval);
        assert_eq!(d.risk_level, RiskLevel::Medium);
        assert!(d.reason.starts_with("manual approval mode active"));
        assert_eq!(d.source, DecisionSource::Security);
    }

    #[test]
    fn require_manual_leaves_escalations_untouched() {
        let d = TrustDecision::escalate(
            RiskLevel::High,
            "deletion operation",
            DecisionSource::Classifier,
        );
        let again = d.clone().require_manual("manual approval mode active");
        assert_eq!(d, again);
    }

    #[test]
    fn decision_serializes_camel_case() {
        let d = TrustDecision::approve(RiskLevel::Low, "ok");
        let json = serde_json::to_string(&d).unwrap();
        assert!(json.contains("\"requiresManualApproval\":false"));
        assert!(json.contains("\"riskLevel\":\"LOW\""));
        assert!(json.contains("\"source\":\"classifier\""));
    }
}
