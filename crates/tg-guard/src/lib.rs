//! # tg-guard
//!
//! The security veto layer that runs before any operation is classified.
//!
//! [`SecurityGuard`] composes four parts:
//!
//! - [`ConfigIntegrityVerifier`]: the policy file matches its recorded
//!   SHA-256, or was legitimately edited. Tampering restores the built-in
//!   default policy and raises the security level.
//! - [`ExternalRequestValidator`]: session token, user id, MCP server,
//!   command shape, and timestamp skew, combined into a weighted score.
//! - [`SuspiciousPatternDetector`]: content rules plus frequency,
//!   quiet-hours, and reset-then-force-push anomalies over a bounded history.
//! - [`SecurityStateMachine`]: the persisted security level and
//!   manual-approval mode.
//!
//! ## Key invariants
//!
//! - The security level only rises through `elevate_security_level` and only
//!   falls through an explicit `restore_security_level`.
//! - Manual approval mode and the level are independent; either can force a
//!   human into the loop.
//! - State changes are written to disk before the lock is released.

pub mod error;
pub mod external;
pub mod guard;
pub mod integrity;
pub mod patterns;
pub mod state;

pub use error::GuardError;
pub use external::{ExternalRequestValidator, RequestValidation, ValidationFailure, ValidatorConfig};
pub use guard::{GuardAction, GuardVerdict, PolicyChange, SecurityGuard};
pub use integrity::{canonical_hash, ConfigIntegrityVerifier, IntegrityOutcome};
pub use patterns::{
    DetectorConfig, PatternHit, RuleKind, Severity, SuspicionReport, SuspiciousPatternDetector,
};
pub use state::{
    SecurityIncident, SecurityLevel, SecurityState, SecurityStateMachine, SecurityStateStore,
};
