//! # tg-engine
//!
//! The trust decision engine: should this agent operation run unattended,
//! or does a human need to look at it first?
//!
//! [`TrustDecisionEngine::evaluate`] runs every operation through the same
//! pipeline:
//!
//! 1. shape validation
//! 2. the [`tg_guard::SecurityGuard`] (policy integrity, request validation,
//!    suspicious patterns)
//! 3. the per-user [`RateLimiter`]
//! 4. the [`CacheLayer`] (exact memo, then normalized patterns)
//! 5. the [`tg_policy::OperationClassifier`], admitted by the
//!    [`LoadController`] under load
//!
//! and hands the decision to the audit and metrics sinks through a bounded
//! [`Dispatcher`].
//!
//! ## Key invariants
//!
//! - `evaluate()` always returns a decision. Errors and panics inside the
//!   pipeline become fail-closed escalations via the [`ErrorHandler`].
//! - Audit and metrics delivery never delays or changes a decision.
//! - A policy change invalidates both cache tiers atomically; a verdict
//!   computed under an older policy is never served.
//! - Queued classifications wait at most the configured deadline.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod load;
pub mod rate_limit;

pub use cache::{CacheLayer, CacheSettings, CacheStats, Fingerprint};
pub use config::{EngineConfig, EngineTuning, STATE_DIR};
pub use dispatch::{DispatchItem, DispatchStats, Dispatcher};
pub use engine::{EngineBuilder, EngineStats, TrustDecisionEngine};
pub use error::EngineError;
pub use fallback::{
    category_label, ErrorContext, ErrorHandler, FailClosedHandler, FallbackDecision,
    PipelineStage,
};
pub use load::{LoadController, LoadPermit, LoadStats, Priority};
pub use rate_limit::{RateLimitExceeded, RateLimiter};
