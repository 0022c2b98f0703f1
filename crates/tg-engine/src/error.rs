// error.rs — Error types for the decision engine.
//
// `evaluate()` never returns these: every error raised inside the pipeline
// is mapped by `category()` onto a DecisionSource and turned into a
// fail-closed decision by the ErrorHandler. Administrative calls
// (`build`, `update_policy`, restore calls) do return them.

use std::path::PathBuf;

use thiserror::Error;

use tg_guard::GuardError;
use tg_policy::{DecisionSource, PolicyError};

/// Errors that can occur inside the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Policy loading, validation, or persistence failed.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// The security guard could not complete its checks.
    #[error(transparent)]
    Guard(#[from] GuardError),

    /// Opening an audit sink failed.
    #[error(transparent)]
    Audit(#[from] tg_audit::AuditError),

    /// `engine.toml` could not be read.
    #[error("failed to read engine config at {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        source: std::io::Error,
    },

    /// `engine.toml` is not valid TOML or has wrong types.
    #[error("invalid engine config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// A replacement policy failed validation.
    #[error("policy rejected: {}", errors.join("; "))]
    PolicyRejected { errors: Vec<String> },

    /// The per-user hourly cap is exhausted.
    #[error("rate limit exceeded for user '{user}': {limit} operations per window")]
    RateLimited { user: String, limit: u32 },

    /// Waited too long for a classification slot.
    #[error("overloaded: no classification slot within {waited_ms}ms")]
    Overloaded { waited_ms: u64 },

    /// A pipeline stage panicked.
    #[error("internal panic: {0}")]
    Panic(String),

    /// The engine has been shut down.
    #[error("engine is shut down")]
    ShutDown,
}

impl EngineError {
    /// Map onto the error taxonomy carried by fail-closed decisions.
    pub fn category(&self) -> DecisionSource {
        match self {
            EngineError::Policy(PolicyError::InvalidOperation { .. }) => DecisionSource::Validation,
            EngineError::Policy(_)
            | EngineError::ConfigIo { .. }
            | EngineError::ConfigParse { .. }
            | EngineError::PolicyRejected { .. } => DecisionSource::Config,
            EngineError::Guard(GuardError::Policy(_))
            | EngineError::Guard(GuardError::IoError { .. })
            | EngineError::Guard(GuardError::Audit(_)) => DecisionSource::Config,
            EngineError::Guard(_) => DecisionSource::Security,
            EngineError::RateLimited { .. } => DecisionSource::RateLimit,
            EngineError::Overloaded { .. } => DecisionSource::Overload,
            EngineError::Audit(_) | EngineError::Panic(_) | EngineError::ShutDown => {
                DecisionSource::Internal
            }
        }
    }
}
