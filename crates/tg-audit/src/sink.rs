// sink.rs — Collaborator traits the engine emits decisions to.
//
// The engine never waits on these: records are queued and delivered from a
// background task, and any error a sink returns is logged and dropped. A
// slow or broken audit sink therefore cannot change or delay a decision.

use crate::error::AuditError;
use crate::record::{DecisionRecord, OperationSample};

/// Receives every decision (and later execution reports). Append-only.
pub trait AuditLogger: Send + Sync {
    /// Persist one record. Errors are logged by the caller and ignored.
    fn log_decision(&self, record: &DecisionRecord) -> Result<(), AuditError>;
}

/// Receives one sample per evaluation.
pub trait MetricsCollector: Send + Sync {
    fn record_operation(&self, sample: &OperationSample) -> Result<(), AuditError>;
}

/// Writes decisions to the `tracing` stream instead of a file.
///
/// The engine falls back to this when the JSONL log cannot be opened.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn log_decision(&self, record: &DecisionRecord) -> Result<(), AuditError> {
        tracing::info!(
            record_id = %record.record_id,
            kind = ?record.kind,
            op_type = %record.operation.op_type,
            command = %record.operation.command_line(),
            approved = record.decision.approved,
            manual = record.decision.requires_manual_approval,
            risk = %record.decision.risk_level,
            source = %record.decision.source,
            "{}",
            record.decision.reason
        );
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl AuditLogger for NoopSink {
    fn log_decision(&self, _record: &DecisionRecord) -> Result<(), AuditError> {
        Ok(())
    }
}

impl MetricsCollector for NoopSink {
    fn record_operation(&self, _sample: &OperationSample) -> Result<(), AuditError> {
        Ok(())
    }
}
