// fallback.rs — ErrorHandler: turn pipeline failures into decisions.
//
// `evaluate()` has no error path. Whatever goes wrong between validation and
// classification (a guard I/O error, a rate-limit refusal, an admission
// timeout, a panic) ends up here and leaves as a TrustDecision whose reason
// names the failure category, so a reviewer can tell why a human was asked.
//
// The default handler fails closed: every error requires manual approval.

use std::fmt;

use serde::Serialize;

use tg_policy::{DecisionSource, Operation, RiskLevel, TrustDecision};

use crate::error::EngineError;

/// Where in the pipeline an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Validate,
    Guard,
    RateLimit,
    Cache,
    Admission,
    Classify,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineStage::Validate => "validate",
            PipelineStage::Guard => "guard",
            PipelineStage::RateLimit => "rate_limit",
            PipelineStage::Cache => "cache",
            PipelineStage::Admission => "admission",
            PipelineStage::Classify => "classify",
        };
        write!(f, "{}", s)
    }
}

/// What the handler is told about a failure.
#[derive(Debug, Clone)]
pub struct ErrorContext<'a> {
    pub stage: PipelineStage,
    /// Absent when the payload could not be parsed into an Operation.
    pub operation: Option<&'a Operation>,
}

impl<'a> ErrorContext<'a> {
    pub fn new(stage: PipelineStage, operation: Option<&'a Operation>) -> Self {
        Self { stage, operation }
    }
}

/// Handler output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackDecision {
    pub decision: TrustDecision,
    pub reason: String,
    /// False only when the handler chose to let the error's natural
    /// decision stand (custom handlers may do so).
    pub fallback_applied: bool,
}

/// Converts pipeline errors into decisions.
pub trait ErrorHandler: Send + Sync {
    fn handle_error(&self, error: &EngineError, context: &ErrorContext<'_>) -> FallbackDecision;
}

/// The human-readable prefix for each error category.
pub fn category_label(source: DecisionSource) -> &'static str {
    match source {
        DecisionSource::Validation => "invalid operation",
        DecisionSource::Config => "configuration error",
        DecisionSource::Security => "security",
        DecisionSource::RateLimit => "rate limit exceeded",
        DecisionSource::Overload => "system overloaded",
        DecisionSource::Internal
        | DecisionSource::Classifier
        | DecisionSource::Memo
        | DecisionSource::PatternCache => "system error",
    }
}

/// Every error becomes a manual-approval escalation.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailClosedHandler;

impl ErrorHandler for FailClosedHandler {
    fn handle_error(&self, error: &EngineError, context: &ErrorContext<'_>) -> FallbackDecision {
        let source = error.category();
        let label = category_label(source);
        let message = error.to_string();
        let reason = if message.starts_with(label) {
            message
        } else {
            format!("{}: {}", label, message)
        };
        let risk = match source {
            DecisionSource::Config | DecisionSource::Security | DecisionSource::Internal => {
                RiskLevel::High
            }
            _ => RiskLevel::Medium,
        };

        match source {
            DecisionSource::RateLimit | DecisionSource::Overload => {
                tracing::warn!(stage = %context.stage, "{}", reason)
            }
            _ => tracing::error!(stage = %context.stage, "{}", reason),
        }

        FallbackDecision {
            decision: TrustDecision::escalate(risk, reason.clone(), source),
            reason,
            fallback_applied: true,
        }
    }
}
