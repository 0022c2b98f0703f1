// error.rs — Error types for the security guard.

use std::path::PathBuf;

use thiserror::Error;

use crate::state::SecurityLevel;

/// Errors raised by the guard's checks and its persisted state.
#[derive(Debug, Error)]
pub enum GuardError {
    /// A file I/O operation failed (state file, checksum file, policy file).
    #[error("I/O error at {path}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to serialize or deserialize guard state.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Reading, validating, or restoring the policy failed.
    #[error(transparent)]
    Policy(#[from] tg_policy::PolicyError),

    /// Hashing the policy file failed.
    #[error(transparent)]
    Audit(#[from] tg_audit::AuditError),

    /// A built-in detection rule failed to compile.
    #[error("invalid detection rule: {0}")]
    InvalidRule(#[from] regex::Error),

    /// Restore calls may only lower the security level.
    #[error("cannot restore security level from {from} to {to}: restore only lowers the level")]
    InvalidRestore { from: SecurityLevel, to: SecurityLevel },
}
