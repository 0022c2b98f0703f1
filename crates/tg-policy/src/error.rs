// error.rs — Error types for the policy subsystem.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while parsing operations or loading/saving policy.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The operation payload is structurally malformed (missing command, args, ...).
    #[error("invalid operation: {reason}")]
    InvalidOperation { reason: String },

    /// The policy file could not be read or written.
    #[error("policy I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The policy file is not valid JSON.
    #[error("policy at {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// The policy document parsed but failed structural validation.
    #[error("policy document is invalid: {}", errors.join("; "))]
    Invalid { errors: Vec<String> },

    /// Failed to serialize a policy for writing.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
