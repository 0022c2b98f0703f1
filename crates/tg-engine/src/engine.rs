// engine.rs — TrustDecisionEngine: the orchestrator.
//
// One EngineContext owns every piece of shared state (policy, security
// state, rate windows, caches, load controller, dispatcher). The engine is a
// cheap handle around an Arc of it; clone it into as many tasks as needed.
//
// evaluate(op):
//   1. validate shape                  → "invalid operation"
//   2. SecurityGuard::check            → tamper / forged request / suspicious
//   3. RateLimiter                     → "rate limit exceeded"
//   4. memo, then pattern cache        → cached classifier verdict
//   5. LoadController::admit, classify → fresh verdict ("system overloaded"
//                                        when the admission deadline passes)
//   6. store in cache (same generation only)
//   7. manual-mode / CRITICAL override, then hand off to audit + metrics
//
// Every error and every panic in steps 1–5 goes through the ErrorHandler and
// comes back as a decision. Steps 6 and 7 run after the verdict is known; a
// failure there is logged and the verdict stands. `evaluate()` cannot fail.

use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use tg_audit::{
    AuditLogger, DecisionRecord, ExecutionResult, JsonlAuditLogger, MemoryMetrics,
    MetricsCollector, OperationSample, TracingAuditLogger,
};
use tg_guard::{
    ConfigIntegrityVerifier, ExternalRequestValidator, GuardVerdict, PolicyChange, SecurityGuard,
    SecurityLevel, SecurityState, SecurityStateMachine, SecurityStateStore,
    SuspiciousPatternDetector,
};
use tg_policy::{
    Operation, OperationClassifier, Policy, PolicyError, PolicyOrigin, PolicyStore, TrustDecision,
};

use crate::cache::{CacheLayer, CacheSettings, CacheStats};
use crate::config::EngineConfig;
use crate::dispatch::{DispatchItem, DispatchStats, Dispatcher};
use crate::error::EngineError;
use crate::fallback::{ErrorContext, ErrorHandler, FailClosedHandler, PipelineStage};
use crate::load::{LoadController, LoadStats, Priority};
use crate::rate_limit::RateLimiter;

/// How long `shutdown()` waits for the dispatcher to drain.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Counters across the whole engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub evaluations: u64,
    pub fallbacks: u64,
    pub rate_limited_users: usize,
    pub cache: CacheStats,
    pub load: LoadStats,
    pub dispatch: DispatchStats,
}

/// A failure somewhere in the pipeline, with the stage it came from.
struct Failure {
    error: EngineError,
    stage: PipelineStage,
}

/// Run a synchronous stage, turning errors and panics into a Failure.
fn guarded<T>(
    stage: PipelineStage,
    f: impl FnOnce() -> Result<T, EngineError>,
) -> Result<T, Failure> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(Failure { error, stage }),
        Err(payload) => Err(Failure {
            error: EngineError::Panic(panic_message(payload.as_ref())),
            stage,
        }),
    }
}

/// Run a side effect of an already-made decision. A panic is logged, never
/// propagated. Returns false if `f` panicked.
fn best_effort(what: &'static str, f: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            tracing::error!(what, panic = %panic_message(payload.as_ref()), "side effect panicked, decision kept");
            false
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

struct EngineContext {
    config: EngineConfig,
    store: PolicyStore,
    policy: RwLock<Arc<Policy>>,
    guard: SecurityGuard,
    rate_limiter: RateLimiter,
    cache: CacheLayer,
    load: Arc<LoadController>,
    classifier: OperationClassifier,
    dispatcher: Dispatcher,
    error_handler: Arc<dyn ErrorHandler>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
    evaluations: AtomicU64,
    fallbacks: AtomicU64,
}

impl EngineContext {
    fn policy(&self) -> Arc<Policy> {
        Arc::clone(&self.policy.read())
    }

    /// Swap the active policy, then re-key the cache. In that order: an
    /// evaluation that captured the old generation can never store a verdict
    /// for the new policy, and one that sees the new generation reads the new
    /// policy.
    fn install_policy(&self, policy: Policy) -> Arc<Policy> {
        let policy = Arc::new(policy);
        *self.policy.write() = Arc::clone(&policy);
        self.cache.reset(Arc::clone(&policy));
        policy
    }

    fn precompute(&self) -> usize {
        self.cache.precompute(&self.classifier)
    }
}

/// Builder for [`TrustDecisionEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    audit: Option<Arc<dyn AuditLogger>>,
    metrics: Option<Arc<dyn MetricsCollector>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            audit: None,
            metrics: None,
            error_handler: None,
        }
    }

    /// Replace the default JSONL audit log.
    pub fn audit_logger(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Replace the default in-memory metrics.
    pub fn metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replace the fail-closed error handler.
    pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn build(self) -> Result<TrustDecisionEngine, EngineError> {
        let config = self.config;
        let tuning = config.tuning.clone();

        let state_dir = config.state_dir();
        fs::create_dir_all(&state_dir).map_err(|source| EngineError::ConfigIo {
            path: state_dir.clone(),
            source,
        })?;

        let store = PolicyStore::new(&config.policy_path);
        let verifier = ConfigIntegrityVerifier::new(
            store.clone(),
            &config.checksum_path,
            tuning.integrity_debounce(),
        );
        if !store.exists() {
            store.save(&Policy::default())?;
            verifier.refresh()?;
            tracing::info!(path = %store.path().display(), "wrote default policy");
        }
        let loaded = store.load();
        if let PolicyOrigin::Default { reason } = &loaded.origin {
            tracing::warn!(reason = %reason, "starting with the default policy");
        }

        let guard = SecurityGuard::new(
            verifier,
            ExternalRequestValidator::new(tuning.validator.clone())?,
            SuspiciousPatternDetector::new(tuning.detector.clone())?,
            SecurityStateMachine::open(SecurityStateStore::new(&config.security_state_path)),
        );

        let audit: Arc<dyn AuditLogger> = match self.audit {
            Some(audit) => audit,
            None => match JsonlAuditLogger::open(&config.audit_log) {
                Ok(log) => Arc::new(log),
                Err(e) => {
                    tracing::warn!(error = %e, "audit log unavailable, logging decisions to tracing");
                    Arc::new(TracingAuditLogger)
                }
            },
        };
        let metrics: Arc<dyn MetricsCollector> = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(MemoryMetrics::default()),
        };

        let policy = Arc::new(loaded.policy);
        let cache = CacheLayer::new(
            CacheSettings {
                memo_capacity: tuning.memo_capacity,
                pattern_capacity: tuning.pattern_cache_capacity,
                ttl: tuning.cache_ttl(),
                min_confidence: tuning.pattern_cache_min_confidence,
                precompute_threshold: tuning.precompute_threshold,
                history_size: tuning.pattern_history_size,
            },
            Arc::clone(&policy),
        );

        tracing::info!(
            root = %config.project_root.display(),
            level = %guard.security_state().security_level,
            manual = guard.security_state().is_manual_approval_mode,
            "trust decision engine ready"
        );

        Ok(TrustDecisionEngine {
            ctx: Arc::new(EngineContext {
                store,
                policy: RwLock::new(policy),
                guard,
                rate_limiter: RateLimiter::new(tuning.rate_window()),
                cache,
                load: LoadController::new(tuning.high_load_threshold, tuning.queue_deadline()),
                classifier: OperationClassifier::new(),
                dispatcher: Dispatcher::new(tuning.dispatch_capacity, audit, metrics),
                error_handler: self.error_handler.unwrap_or_else(|| Arc::new(FailClosedHandler)),
                tasks: Mutex::new(Vec::new()),
                shut_down: AtomicBool::new(false),
                evaluations: AtomicU64::new(0),
                fallbacks: AtomicU64::new(0),
                config,
            }),
        })
    }
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct TrustDecisionEngine {
    ctx: Arc<EngineContext>,
}

impl TrustDecisionEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// `EngineConfig::load(root)` with default collaborators.
    pub fn open(project_root: impl AsRef<std::path::Path>) -> Result<Self, EngineError> {
        EngineBuilder::new(EngineConfig::load(project_root)?).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    /// The policy currently in force.
    pub fn policy(&self) -> Arc<Policy> {
        self.ctx.policy()
    }

    pub fn security_state(&self) -> SecurityState {
        self.ctx.guard.security_state()
    }

    /// Render a verdict. Never fails and never panics past this call.
    pub async fn evaluate(&self, op: &Operation) -> TrustDecision {
        let started = Instant::now();
        self.ctx.evaluations.fetch_add(1, Ordering::Relaxed);

        let decision = match self.run_pipeline(op).await {
            Ok(decision) => decision,
            Err(failure) => self.fallback(&failure, Some(op)),
        };

        let elapsed = started.elapsed();
        tracing::debug!(
            op_type = %op.op_type,
            command = %op.command_line(),
            user = %op.context.user,
            approved = decision.approved,
            manual = decision.requires_manual_approval,
            risk = %decision.risk_level,
            source = %decision.source,
            elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
            "decision"
        );
        best_effort("emit", || self.emit(op, &decision, elapsed));
        decision
    }

    /// Parse an untyped payload, then `evaluate()` it.
    pub async fn evaluate_value(&self, payload: &Value) -> TrustDecision {
        match Operation::from_value(payload) {
            Ok(op) => self.evaluate(&op).await,
            Err(e) => {
                self.ctx.evaluations.fetch_add(1, Ordering::Relaxed);
                self.fallback(
                    &Failure {
                        error: e.into(),
                        stage: PipelineStage::Validate,
                    },
                    None,
                )
            }
        }
    }

    async fn run_pipeline(&self, op: &Operation) -> Result<TrustDecision, Failure> {
        let ctx = &self.ctx;
        if ctx.shut_down.load(Ordering::SeqCst) {
            return Err(Failure {
                error: EngineError::ShutDown,
                stage: PipelineStage::Validate,
            });
        }

        guarded(PipelineStage::Validate, || Ok(op.validate()?))?;

        // Generation before policy: see install_policy().
        let generation = ctx.cache.generation();
        let policy = ctx.policy();

        let verdict = guarded(PipelineStage::Guard, || Ok(ctx.guard.check(op, &policy)?))?;
        let (policy, manual_override) = match verdict {
            GuardVerdict::Proceed {
                policy_change,
                manual_override,
            } => (self.apply_change(policy_change, policy), manual_override),
            GuardVerdict::Block {
                action,
                decision,
                policy_change,
            } => {
                self.apply_change(policy_change, policy);
                tracing::warn!(?action, reason = %decision.reason, "operation blocked by security guard");
                return Ok(decision);
            }
        };

        guarded(PipelineStage::RateLimit, || {
            let limit = policy.security.max_auto_approval_per_hour;
            ctx.rate_limiter
                .check_and_record(&op.context.user, limit)
                .map(|_| ())
                .map_err(|_| EngineError::RateLimited {
                    user: op.context.user.clone(),
                    limit,
                })
        })?;

        let hit = guarded(PipelineStage::Cache, || {
            Ok(ctx
                .cache
                .lookup(op)
                .map(|hit| with_override(hit, manual_override.as_deref())))
        })?;
        if let Some(hit) = hit {
            return Ok(hit);
        }

        let permit = ctx
            .load
            .admit(Priority::of(op))
            .await
            .map_err(|error| Failure {
                error,
                stage: PipelineStage::Admission,
            })?;
        let classification = guarded(PipelineStage::Classify, || {
            Ok(ctx.classifier.classify(op, &policy))
        })?;
        drop(permit);

        best_effort("cache store", || {
            ctx.cache.store(op, &classification, generation);
        });
        guarded(PipelineStage::Classify, || {
            Ok(with_override(
                classification.into_decision(),
                manual_override.as_deref(),
            ))
        })
    }

    fn apply_change(&self, change: Option<PolicyChange>, current: Arc<Policy>) -> Arc<Policy> {
        match change {
            Some(PolicyChange::Reloaded(policy)) => {
                tracing::info!(version = %policy.version, "policy reloaded from disk");
                self.ctx.install_policy(policy)
            }
            Some(PolicyChange::RestoredDefault(policy)) => {
                tracing::warn!("default policy restored after integrity failure");
                self.ctx.install_policy(policy)
            }
            None => current,
        }
    }

    fn fallback(&self, failure: &Failure, op: Option<&Operation>) -> TrustDecision {
        self.ctx.fallbacks.fetch_add(1, Ordering::Relaxed);
        let context = ErrorContext::new(failure.stage, op);
        let handled = catch_unwind(AssertUnwindSafe(|| {
            self.ctx.error_handler.handle_error(&failure.error, &context)
        }));
        match handled {
            Ok(fallback) => fallback.decision,
            // A broken handler still must not leak a panic.
            Err(_) => FailClosedHandler.handle_error(&failure.error, &context).decision,
        }
    }

    fn emit(&self, op: &Operation, decision: &TrustDecision, elapsed: Duration) {
        let log_all = self.ctx.policy.read().security.log_all_operations;
        let record = (log_all || decision.is_escalation())
            .then(|| DecisionRecord::decision(op, decision));
        self.ctx.dispatcher.enqueue(DispatchItem::Decision {
            record,
            sample: OperationSample::new(op, decision, elapsed),
        });
    }

    /// Forward the outcome of an executed operation to the audit log.
    pub fn report_execution(&self, op: &Operation, decision: &TrustDecision, result: ExecutionResult) {
        self.ctx
            .dispatcher
            .enqueue(DispatchItem::Execution(DecisionRecord::execution(op, decision, result)));
    }

    /// Validate, persist, and activate a new policy. Both cache tiers are
    /// invalidated atomically.
    pub fn update_policy(&self, policy: Policy) -> Result<Policy, EngineError> {
        let saved = self.ctx.store.save(&policy).map_err(|e| match e {
            PolicyError::Invalid { errors } => EngineError::PolicyRejected { errors },
            other => EngineError::Policy(other),
        })?;
        self.ctx.guard.verifier().refresh()?;
        self.ctx.install_policy(saved.clone());
        tracing::info!(version = %saved.version, "policy updated");
        Ok(saved)
    }

    /// `update_policy()` for a raw (possibly partial) document.
    pub fn update_policy_value(&self, document: &Value) -> Result<Policy, EngineError> {
        let (policy, report) = Policy::from_value(document).map_err(|e| match e {
            PolicyError::Invalid { errors } => EngineError::PolicyRejected { errors },
            other => EngineError::Policy(other),
        })?;
        for warning in &report.warnings {
            tracing::warn!("{}", warning);
        }
        self.update_policy(policy)
    }

    pub fn restore_auto_approval_mode(&self, reason: &str) -> Result<SecurityState, EngineError> {
        Ok(self.ctx.guard.state().restore_auto_approval_mode(reason)?)
    }

    pub fn restore_security_level(
        &self,
        level: SecurityLevel,
        reason: &str,
    ) -> Result<SecurityState, EngineError> {
        Ok(self.ctx.guard.state().restore_security_level(level, reason)?)
    }

    /// Run one precomputation pass now. Returns entries inserted.
    pub fn precompute_patterns(&self) -> usize {
        self.ctx.precompute()
    }

    /// Wait until queued audit and metrics items are delivered.
    pub async fn flush(&self, timeout: Duration) -> bool {
        self.ctx.dispatcher.flush(timeout).await
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            evaluations: self.ctx.evaluations.load(Ordering::Relaxed),
            fallbacks: self.ctx.fallbacks.load(Ordering::Relaxed),
            rate_limited_users: self.ctx.rate_limiter.tracked_users(),
            cache: self.ctx.cache.stats(),
            load: self.ctx.load.stats(),
            dispatch: self.ctx.dispatcher.stats(),
        }
    }

    /// Spawn the precompute and rate-window cleanup loops on the current
    /// tokio runtime. Calling it twice is a no-op.
    pub fn start_background_tasks(&self) {
        let mut tasks = self.ctx.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        let tuning = &self.ctx.config.tuning;

        let weak = Arc::downgrade(&self.ctx);
        let every = tuning.precompute_interval();
        tasks.push(tokio::spawn(periodic(weak, every, |ctx| {
            let inserted = ctx.precompute();
            if inserted > 0 {
                tracing::debug!(inserted, "precompute pass");
            }
        })));

        let weak = Arc::downgrade(&self.ctx);
        let every = tuning.rate_cleanup_interval();
        tasks.push(tokio::spawn(periodic(weak, every, |ctx| {
            let removed = ctx.rate_limiter.cleanup();
            if removed > 0 {
                tracing::debug!(removed, "expired rate windows removed");
            }
        })));
        tracing::info!("background tasks started");
    }

    /// Stop background tasks and drain the dispatcher. Later evaluations
    /// fail closed.
    pub async fn shutdown(&self) {
        self.ctx.shut_down.store(true, Ordering::SeqCst);
        let tasks: Vec<JoinHandle<()>> = self.ctx.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.ctx.dispatcher.shutdown(SHUTDOWN_DRAIN).await;
        tracing::info!("trust decision engine shut down");
    }
}

fn with_override(decision: TrustDecision, manual_override: Option<&str>) -> TrustDecision {
    match manual_override {
        Some(reason) => decision.require_manual(reason),
        None => decision,
    }
}

/// Run `tick` every `every` until the engine is dropped.
async fn periodic(weak: Weak<EngineContext>, every: Duration, tick: fn(&EngineContext)) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(ctx) = weak.upgrade() else {
            break;
        };
        tick(&ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineTuning;
    use tg_audit::NoopSink;
    use tg_policy::{DecisionSource, OperationContext, OperationType, RiskLevel};
    use tempfile::tempdir;

    fn engine(root: &std::path::Path) -> TrustDecisionEngine {
        let mut tuning = EngineTuning {
            integrity_debounce_ms: 0,
            ..EngineTuning::default()
        };
        tuning.detector.quiet_hours_start = 0;
        tuning.detector.quiet_hours_end = 0;
        TrustDecisionEngine::builder(EngineConfig::for_project(root).with_tuning(tuning))
            .audit_logger(Arc::new(NoopSink))
            .build()
            .unwrap()
    }

    fn git(args: &[&str]) -> Operation {
        Operation::new(
            OperationType::Git,
            "git",
            args.iter().copied(),
            OperationContext::new("/repo", "dev", "session-1234"),
        )
    }

    #[test]
    fn guarded_converts_panics() {
        let r: Result<(), Failure> = guarded(PipelineStage::Classify, || panic!("boom"));
        match r {
            Err(Failure {
                error: EngineError::Panic(msg),
                stage: PipelineStage::Classify,
            }) => assert_eq!(msg, "boom"),
            _ => panic!("expected a Panic failure"),
        }
    }

    #[test]
    fn best_effort_contains_panics() {
        let mut ran = false;
        assert!(best_effort("count", || ran = true));
        assert!(ran);
        assert!(!best_effort("explode", || panic!("sink exploded")));
    }

    #[test]
    fn build_writes_default_policy_and_checksum() {
        let dir = tempdir().unwrap();
        let e = engine(dir.path());
        assert!(e.config().policy_path.exists());
        assert!(e.config().checksum_path.exists());
        assert_eq!(e.policy().security.max_auto_approval_per_hour, 1000);
    }

    #[tokio::test]
    async fn second_identical_evaluation_hits_memo() {
        let dir = tempdir().unwrap();
        let e = engine(dir.path());
        let first = e.evaluate(&git(&["status"])).await;
        let second = e.evaluate(&git(&["status"])).await;
        assert_eq!(first.source, DecisionSource::Classifier);
        assert_eq!(second.source, DecisionSource::Memo);
        assert_eq!(first.approved, second.approved);
        assert_eq!(first.reason, second.reason);
        assert_eq!(e.stats().cache.memo_hits, 1);
    }

    #[tokio::test]
    async fn update_policy_invalidates_cache() {
        let dir = tempdir().unwrap();
        let e = engine(dir.path());
        assert!(e.evaluate(&git(&["status"])).await.approved);

        let mut policy = Policy::default();
        policy.auto_approve.git_operations.remove("status");
        policy.security.unmatched_operations = tg_policy::UnmatchedMode::RequireApproval;
        e.update_policy(policy).unwrap();

        let after = e.evaluate(&git(&["status"])).await;
        assert!(after.requires_manual_approval);
        assert_eq!(after.source, DecisionSource::Classifier);
        assert_eq!(e.stats().cache.generation, 1);
    }

    #[tokio::test]
    async fn invalid_update_is_rejected() {
        let dir = tempdir().unwrap();
        let e = engine(dir.path());
        let mut policy = Policy::default();
        policy.security.max_auto_approval_per_hour = 0;
        match e.update_policy(policy) {
            Err(EngineError::PolicyRejected { errors }) => assert!(!errors.is_empty()),
            other => panic!("expected PolicyRejected, got {:?}", other.map(|_| ())),
        }
        assert_eq!(e.policy().security.max_auto_approval_per_hour, 1000);
    }

    #[tokio::test]
    async fn shut_down_engine_fails_closed() {
        let dir = tempdir().unwrap();
        let e = engine(dir.path());
        e.shutdown().await;
        let d = e.evaluate(&git(&["status"])).await;
        assert!(d.requires_manual_approval);
        assert_eq!(d.source, DecisionSource::Internal);
        assert!(d.reason.starts_with("system error"));
    }

    #[tokio::test]
    async fn malformed_payload_is_invalid_operation() {
        let dir = tempdir().unwrap();
        let e = engine(dir.path());
        let d = e
            .evaluate_value(&serde_json::json!({"type": "GIT", "command": null, "args": []}))
            .await;
        assert!(!d.approved);
        assert!(d.reason.starts_with("invalid operation"));
        assert_eq!(d.source, DecisionSource::Validation);
        assert_eq!(d.risk_level, RiskLevel::Medium);
    }

    #[tokio::test]
    async fn background_tasks_start_once_and_stop() {
        let dir = tempdir().unwrap();
        let e = engine(dir.path());
        e.start_background_tasks();
        e.start_background_tasks();
        assert_eq!(e.ctx.tasks.lock().len(), 2);
        e.shutdown().await;
        assert!(e.ctx.tasks.lock().is_empty());
    }
}
