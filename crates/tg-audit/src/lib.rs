//! # tg-audit
//!
//! Where trustgate's decisions go after they are made.
//!
//! The engine hands each decision to an [`AuditLogger`] and each
//! evaluation's timing to a [`MetricsCollector`]. Both are fire-and-forget:
//! an error from either is logged and never changes a decision.
//!
//! - [`JsonlAuditLogger`]: append-only JSONL file where each line carries
//!   the SHA-256 of the previous one, so edits are detectable with
//!   [`JsonlAuditLogger::verify_chain`].
//! - [`MemoryMetrics`]: bounded in-memory samples plus running totals.
//! - [`hasher`]: the SHA-256 helpers also used for the policy checksum file.

pub mod error;
pub mod hasher;
pub mod log;
pub mod metrics;
pub mod record;
pub mod sink;

pub use error::AuditError;
pub use log::JsonlAuditLogger;
pub use metrics::{MemoryMetrics, MetricsSummary};
pub use record::{DecisionRecord, ExecutionResult, OperationSample, RecordKind};
pub use sink::{AuditLogger, MetricsCollector, NoopSink, TracingAuditLogger};
