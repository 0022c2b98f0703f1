// record.rs — What the engine hands to its audit and metrics collaborators.
//
// A DecisionRecord is one line in the audit trail: the operation, the verdict,
// and (once the host reports it) how execution went. An OperationSample is
// the slimmer per-evaluation datum for metrics.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tg_policy::{DecisionSource, Operation, OperationType, TrustDecision};

/// Outcome of actually running an operation, reported by the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn success() -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            duration_ms: None,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: None,
            duration_ms: None,
            error: Some(error.into()),
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
        self
    }
}

/// Whether a record describes a fresh decision or a later execution report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Decision,
    Execution,
}

/// One entry in the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub record_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub kind: RecordKind,
    pub operation: Operation,
    pub decision: TrustDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    /// Hash of the previous line in a chained log. Set by the logger.
    #[serde(default)]
    pub previous_hash: Option<String>,
}

impl DecisionRecord {
    /// Record a fresh decision. User and session come from the operation context.
    pub fn decision(operation: &Operation, decision: &TrustDecision) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            record_id: Uuid::new_v4(),
            recorded_at: Utc::now(),
            kind: RecordKind::Decision,
            user: non_empty(&operation.context.user),
            session: non_empty(&operation.context.session_id),
            operation: operation.clone(),
            decision: decision.clone(),
            execution_result: None,
            previous_hash: None,
        }
    }

    /// Record the execution outcome of a previously decided operation.
    pub fn execution(
        operation: &Operation,
        decision: &TrustDecision,
        result: ExecutionResult,
    ) -> Self {
        let mut record = Self::decision(operation, decision);
        record.kind = RecordKind::Execution;
        record.execution_result = Some(result);
        record
    }
}

/// Per-evaluation metrics datum.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OperationSample {
    pub operation_type: OperationType,
    pub command: String,
    pub args: Vec<String>,
    pub approved: bool,
    pub requires_manual_approval: bool,
    pub source: DecisionSource,
    /// Wall time spent inside `evaluate()`, in microseconds.
    pub processing_time_us: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl OperationSample {
    pub fn new(operation: &Operation, decision: &TrustDecision, processing_time: Duration) -> Self {
        Self {
            operation_type: operation.op_type,
            command: operation.command.clone(),
            args: operation.args.clone(),
            approved: decision.approved,
            requires_manual_approval: decision.requires_manual_approval,
            source: decision.source,
            processing_time_us: u64::try_from(processing_time.as_micros()).unwrap_or(u64::MAX),
            user_id: (!operation.context.user.is_empty()).then(|| operation.context.user.clone()),
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tg_policy::{OperationContext, RiskLevel};

    fn op() -> Operation {
        Operation::new(
            OperationType::Git,
            "git",
            ["status"],
            OperationContext::new("/repo", "dev", "session-1234"),
        )
    }

    #[test]
    fn decision_record_takes_identity_from_context() {
        let d = TrustDecision::approve(RiskLevel::Medium, "ok");
        let record = DecisionRecord::decision(&op(), &d);
        assert_eq!(record.kind, RecordKind::Decision);
        assert_eq!(record.user.as_deref(), Some("dev"));
        assert_eq!(record.session.as_deref(), Some("session-1234"));
        assert!(record.execution_result.is_none());
    }

    #[test]
    fn huge_durations_saturate() {
        let result = ExecutionResult::success().with_duration(Duration::MAX);
        assert_eq!(result.duration_ms, Some(u64::MAX));

        let d = TrustDecision::approve(RiskLevel::Low, "ok");
        let sample = OperationSample::new(&op(), &d, Duration::MAX);
        assert_eq!(sample.processing_time_us, u64::MAX);

        let sample = OperationSample::new(&op(), &d, Duration::from_micros(1500));
        assert_eq!(sample.processing_time_us, 1500);
    }

    #[test]
    fn empty_identity_is_omitted() {
        let mut o = op();
        o.context.user.clear();
        let record = DecisionRecord::decision(&o, &TrustDecision::approve(RiskLevel::Low, "ok"));
        assert!(record.user.is_none());
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("\"user\""));
    }

    #[test]
    fn execution_record_carries_result() {
        let d = TrustDecision::approve(RiskLevel::Medium, "ok");
        let result = ExecutionResult::failure("exit 1").with_exit_code(1);
        let record = DecisionRecord::execution(&op(), &d, result.clone());
        assert_eq!(record.kind, RecordKind::Execution);
        assert_eq!(record.execution_result, Some(result));
    }

    #[test]
    fn sample_records_timing_in_micros() {
        let d = TrustDecision::approve(RiskLevel::Medium, "ok");
        let sample = OperationSample::new(&op(), &d, Duration::from_millis(3));
        assert_eq!(sample.processing_time_us, 3000);
        assert_eq!(sample.user_id.as_deref(), Some("dev"));
        assert_eq!(sample.source, DecisionSource::Classifier);
    }
}
