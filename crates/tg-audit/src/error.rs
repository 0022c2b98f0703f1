// error.rs — Error types for the audit subsystem.
//
// Sinks report failures through these variants; the engine logs and drops
// them, so nothing here ever reaches a decision.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while recording decisions or metrics.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Failed to open or create the audit log file.
    #[error("failed to open audit log at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write a record to the log.
    #[error("failed to append record: {0}")]
    WriteFailed(#[from] std::io::Error),

    /// Failed to serialize or deserialize a record (malformed JSON).
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The audit log has been tampered with; the hash chain is broken.
    #[error("integrity check failed at line {line}: expected hash {expected}, got {actual}")]
    IntegrityViolation {
        line: usize,
        expected: String,
        actual: String,
    },

    /// A collaborator is temporarily unable to accept records.
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}
