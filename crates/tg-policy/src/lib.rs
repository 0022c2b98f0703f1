//! # tg-policy
//!
//! Operation model, policy document, and classifier for trustgate.
//!
//! An AI agent proposes an [`Operation`] (git, file, CLI, script, or MCP
//! call). The [`OperationClassifier`] checks it against the active
//! [`Policy`] and produces a [`Classification`], which the engine turns into
//! a [`TrustDecision`]: approve automatically, or escalate to a human.
//!
//! ## Key invariants
//!
//! - **Destructive first**: deletion, force, and production-impact patterns
//!   are checked before any allow-list. A destructive operation is never
//!   auto-approved, whatever the allow-lists say.
//! - **Built-ins are permanent**: `rm -rf`, `branch -D`, `--force`, and
//!   friends escalate even if the policy file's manual lists are emptied.
//! - **Policy files never crash the caller**: [`PolicyStore::load`] falls
//!   back to [`Policy::default`] on a missing, corrupt, or invalid document.

pub mod classifier;
pub mod decision;
pub mod error;
pub mod operation;
pub mod policy;
pub mod store;

pub use classifier::{
    has_destructive_marker, is_read_only_tool, matches_pattern, pattern_tokens, Classification,
    MatchedRule, OperationClassifier,
};
pub use decision::{DecisionSource, RiskLevel, TrustDecision};
pub use error::PolicyError;
pub use operation::{Operation, OperationContext, OperationType};
pub use policy::{
    validate_document, AutoApprove, ManualApprove, Policy, PolicyDocument, ScriptExecution,
    SecuritySettings, UnmatchedMode, ValidationReport, POLICY_VERSION,
};
pub use store::{LoadedPolicy, PolicyOrigin, PolicyStore};
