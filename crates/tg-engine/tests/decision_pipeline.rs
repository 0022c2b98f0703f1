// decision_pipeline.rs — End-to-end tests for the trust decision engine.
//
// Each test builds a fresh engine over a temp project directory, so policy,
// checksum, security state, and audit log are isolated:
//
//   - concrete scenarios: git status, branch -D, rm -rf, production MCP
//     write, rate limit at maxAutoApprovalPerHour + 1, invalid policy file
//   - properties: idempotence, monotonic risk, cache bound
//   - security flows: tamper recovery, suspicious burst → manual mode,
//     legitimate hot reload
//   - cache soundness: a warm pattern cache never answers differently from
//     a cold classifier, policy-specific patterns included
//   - plumbing: audit hash chain, execution reports, concurrent callers
//     under a tiny load threshold, custom error handler, failing sinks

use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde_json::json;
use tempfile::tempdir;

use tg_audit::{
    AuditError, ExecutionResult, JsonlAuditLogger, MetricsCollector, NoopSink, OperationSample,
    RecordKind,
};
use tg_engine::{
    EngineConfig, EngineError, EngineTuning, ErrorContext, ErrorHandler, FallbackDecision,
    TrustDecisionEngine,
};
use tg_guard::SecurityLevel;
use tg_policy::{
    DecisionSource, Operation, OperationClassifier, OperationContext, OperationType, Policy,
    PolicyStore, RiskLevel, TrustDecision, UnmatchedMode,
};

fn tuning() -> EngineTuning {
    let mut tuning = EngineTuning {
        integrity_debounce_ms: 0,
        ..EngineTuning::default()
    };
    // Keep the quiet-hours rule from firing when the suite runs at night.
    tuning.detector.quiet_hours_start = 0;
    tuning.detector.quiet_hours_end = 0;
    tuning
}

fn engine_with(root: &Path, tuning: EngineTuning) -> TrustDecisionEngine {
    TrustDecisionEngine::builder(EngineConfig::for_project(root).with_tuning(tuning))
        .audit_logger(Arc::new(NoopSink))
        .build()
        .unwrap()
}

fn engine(root: &Path) -> TrustDecisionEngine {
    engine_with(root, tuning())
}

fn ctx() -> OperationContext {
    OperationContext::new("/repo", "dev", "session-1234")
}

fn op(op_type: OperationType, command: &str, args: &[&str]) -> Operation {
    Operation::new(op_type, command, args.iter().copied(), ctx())
}

fn git(args: &[&str]) -> Operation {
    op(OperationType::Git, "git", args)
}

// ── Concrete scenarios ──

#[tokio::test]
async fn git_status_is_auto_approved() {
    let dir = tempdir().unwrap();
    let d = engine(dir.path()).evaluate(&git(&["status"])).await;
    assert!(d.approved);
    assert!(!d.requires_manual_approval);
}

#[tokio::test]
async fn force_branch_delete_needs_a_human() {
    let dir = tempdir().unwrap();
    let d = engine(dir.path())
        .evaluate(&git(&["branch", "-D", "feature"]))
        .await;
    assert!(!d.approved);
    assert!(d.requires_manual_approval);
    assert_eq!(d.risk_level, RiskLevel::High);
    assert!(d.reason.contains("deletion"));
}

#[tokio::test]
async fn recursive_delete_needs_a_human() {
    let dir = tempdir().unwrap();
    let d = engine(dir.path())
        .evaluate(&op(OperationType::Cli, "rm", &["-rf", "dir"]))
        .await;
    assert_eq!(d.risk_level, RiskLevel::High);
    assert!(d.requires_manual_approval);
}

#[tokio::test]
async fn production_write_needs_a_human() {
    let dir = tempdir().unwrap();
    let write = Operation::new(
        OperationType::Mcp,
        "execute_sql",
        ["DROP INDEX idx_users_email"],
        ctx().with_mcp("supabase", "execute_sql"),
    );
    let d = engine(dir.path()).evaluate(&write).await;
    assert_eq!(d.risk_level, RiskLevel::High);
    assert!(d.requires_manual_approval);
    assert!(d.reason.contains("production impact"));
}

#[tokio::test]
async fn operation_past_the_hourly_cap_is_rate_limited() {
    let dir = tempdir().unwrap();
    let e = engine(dir.path());
    // Identical repeats would otherwise trip the frequency detector first.
    let mut policy = Policy::default();
    policy.security.suspicious_pattern_detection = false;
    e.update_policy(policy).unwrap();

    let limit = e.policy().security.max_auto_approval_per_hour;
    assert_eq!(limit, 1000);
    for _ in 0..limit {
        assert!(e.evaluate(&git(&["status"])).await.approved);
    }
    let d = e.evaluate(&git(&["status"])).await;
    assert!(!d.approved);
    assert!(d.reason.contains("rate limit"));
    assert_eq!(d.source, DecisionSource::RateLimit);

    // Other users are unaffected.
    let mut other = git(&["status"]);
    other.context.user = "reviewer".to_string();
    assert!(e.evaluate(&other).await.approved);
}

#[tokio::test]
async fn schema_invalid_policy_file_still_yields_decisions() {
    let dir = tempdir().unwrap();
    let config = EngineConfig::for_project(dir.path()).with_tuning(tuning());
    fs::create_dir_all(config.state_dir()).unwrap();
    fs::write(
        &config.policy_path,
        r#"{"version": 7, "autoApprove": {"gitOperations": "everything"}}"#,
    )
    .unwrap();

    let e = TrustDecisionEngine::builder(config.clone())
        .audit_logger(Arc::new(NoopSink))
        .build()
        .unwrap();
    let first = e.evaluate(&git(&["status"])).await;
    assert!(first.requires_manual_approval);
    assert_eq!(first.source, DecisionSource::Config);
    assert!(first.reason.starts_with("configuration error"));

    let restored = PolicyStore::new(&config.policy_path).load();
    assert!(!restored.is_default());
    assert!(restored.report.is_valid);

    // Defaults are in force from here on.
    assert!(e.evaluate(&git(&["status"])).await.approved);
}

// ── Properties ──

#[tokio::test]
async fn repeated_evaluation_is_idempotent() {
    let dir = tempdir().unwrap();
    let e = engine(dir.path());
    let samples = [
        git(&["log", "--oneline"]),
        git(&["push", "--force"]),
        op(OperationType::File, "write", &["src/main.rs"]),
        op(OperationType::Cli, "cargo", &["test"]),
    ];
    for o in &samples {
        let a = e.evaluate(o).await;
        let b = e.evaluate(o).await;
        assert_eq!(
            (a.approved, a.requires_manual_approval, a.risk_level, &a.reason),
            (b.approved, b.requires_manual_approval, b.risk_level, &b.reason),
            "verdict changed for {}",
            o.command_line()
        );
    }
}

#[tokio::test]
async fn destructive_markers_are_always_high_and_manual() {
    let dir = tempdir().unwrap();
    let e = engine(dir.path());
    let markers: [&[&str]; 3] = [&["--force"], &["-D"], &["rm", "-rf"]];
    for op_type in [
        OperationType::Git,
        OperationType::File,
        OperationType::Cli,
        OperationType::Script,
        OperationType::Mcp,
        OperationType::Unknown,
    ] {
        for (i, marker) in markers.iter().enumerate() {
            let mut args = vec![format!("target{}", i)];
            args.extend(marker.iter().map(|s| s.to_string()));
            let context = if op_type == OperationType::Mcp {
                ctx().with_mcp("github", "run_workflow")
            } else {
                ctx()
            };
            let o = Operation::new(op_type, "tool", args, context);
            let d = e.evaluate(&o).await;
            assert_eq!(d.risk_level, RiskLevel::High, "{:?} {:?}", op_type, marker);
            assert!(d.requires_manual_approval, "{:?} {:?}", op_type, marker);
        }
    }
}

#[tokio::test]
async fn cache_never_exceeds_its_bounds() {
    let dir = tempdir().unwrap();
    let e = engine_with(
        dir.path(),
        EngineTuning {
            memo_capacity: 5,
            pattern_cache_capacity: 10,
            ..tuning()
        },
    );
    for i in 0..60 {
        let sub = format!("sub{}", i);
        e.evaluate(&op(OperationType::Cli, "tool", &[sub.as_str()]))
            .await;
        let stats = e.stats().cache;
        assert!(stats.memo_size <= 5);
        assert!(stats.pattern_size <= 10);
    }
    assert!(e.stats().cache.evictions > 0);
}

// ── Security flows ──

#[tokio::test]
async fn tampered_policy_is_restored_and_level_raised() {
    let dir = tempdir().unwrap();
    let e = engine(dir.path());
    assert!(e.evaluate(&git(&["status"])).await.approved);

    fs::write(&e.config().policy_path, "this is not json").unwrap();
    let d = e.evaluate(&git(&["status"])).await;
    assert_eq!(d.source, DecisionSource::Config);
    assert_eq!(d.risk_level, RiskLevel::Critical);
    assert!(d.requires_manual_approval);

    let restored = PolicyStore::new(&e.config().policy_path).load();
    assert!(restored.report.is_valid);
    assert!(!restored.is_default());
    assert_eq!(e.security_state().security_level, SecurityLevel::Elevated);
    assert_eq!(
        e.policy().auto_approve,
        Policy::default().auto_approve
    );
}

#[tokio::test]
async fn destructive_burst_switches_to_manual_mode() {
    let dir = tempdir().unwrap();
    let e = engine(dir.path());
    let burst = op(OperationType::Cli, "rm", &["-rf", "build"]);

    let mut last = None;
    for _ in 0..21 {
        last = Some(e.evaluate(&burst).await);
    }
    let last = last.unwrap();
    assert_eq!(last.source, DecisionSource::Security);
    assert!(last.reason.contains("suspicious activity"));
    assert!(e.security_state().is_manual_approval_mode);

    let status = e.evaluate(&git(&["status"])).await;
    assert!(status.requires_manual_approval);
    assert!(status.reason.contains("manual approval mode"));

    e.restore_auto_approval_mode("reviewed by on-call").unwrap();
    assert!(e.evaluate(&git(&["status"])).await.approved);
}

#[tokio::test]
async fn legitimate_edit_is_hot_reloaded() {
    let dir = tempdir().unwrap();
    let e = engine(dir.path());
    assert!(e.evaluate(&git(&["status"])).await.approved);

    // The edit must be newer than the recorded checksum.
    let checksum = File::options()
        .write(true)
        .open(&e.config().checksum_path)
        .unwrap();
    checksum
        .set_modified(SystemTime::now() - Duration::from_secs(60))
        .unwrap();
    drop(checksum);

    let mut edited = Policy::default();
    edited.auto_approve.git_operations.remove("status");
    edited.security.unmatched_operations = UnmatchedMode::RequireApproval;
    PolicyStore::new(&e.config().policy_path).save(&edited).unwrap();

    let d = e.evaluate(&git(&["status"])).await;
    assert!(d.requires_manual_approval);
    assert_eq!(d.source, DecisionSource::Classifier);
    assert!(!e.policy().auto_approve.git_operations.contains("status"));
    assert_eq!(e.security_state().security_level, SecurityLevel::Normal);
}

#[tokio::test]
async fn forged_request_is_denied_outright() {
    let dir = tempdir().unwrap();
    let e = engine(dir.path());
    let mut forged = git(&["status"]);
    forged.context = OperationContext::default();
    let d = e.evaluate(&forged).await;
    assert!(!d.approved);
    assert!(!d.requires_manual_approval);
    assert_eq!(d.source, DecisionSource::Security);
    assert_eq!(e.security_state().threat_count, 1);
}

// ── Cache soundness ──

/// Default policy plus patterns that name specific files and branches.
fn pinned_policy() -> Policy {
    let mut policy = Policy::default();
    policy
        .manual_approve
        .delete_operations
        .insert("rm secrets.env".to_string());
    policy
        .manual_approve
        .force_operations
        .insert("checkout release/2.0".to_string());
    policy
        .manual_approve
        .production_impact
        .insert("publish dist/prod.tgz".to_string());
    policy
}

#[tokio::test]
async fn warm_cache_does_not_leak_approval_to_pinned_file() {
    let dir = tempdir().unwrap();
    let e = engine(dir.path());
    e.update_policy(pinned_policy()).unwrap();

    let notes = e.evaluate(&op(OperationType::Cli, "rm", &["notes.txt"])).await;
    assert!(notes.approved);

    let d = e.evaluate(&op(OperationType::Cli, "rm", &["secrets.env"])).await;
    assert!(!d.approved);
    assert!(d.requires_manual_approval);
    assert_eq!(d.risk_level, RiskLevel::High);
    assert_eq!(d.source, DecisionSource::Classifier);
    assert!(d.reason.contains("'rm secrets.env'"), "{}", d.reason);
}

#[tokio::test]
async fn warm_cache_does_not_leak_approval_to_pinned_branch() {
    let dir = tempdir().unwrap();
    let e = engine(dir.path());
    e.update_policy(pinned_policy()).unwrap();

    assert!(e.evaluate(&git(&["checkout", "feature/x"])).await.approved);

    let d = e.evaluate(&git(&["checkout", "release/2.0"])).await;
    assert!(!d.approved);
    assert!(d.requires_manual_approval);
    assert_eq!(d.risk_level, RiskLevel::High);
    assert!(d.reason.contains("checkout release/2.0"), "{}", d.reason);
}

#[tokio::test]
async fn pattern_hit_reason_names_the_served_operation() {
    let dir = tempdir().unwrap();
    let e = engine(dir.path());
    e.evaluate(&op(OperationType::Cli, "rm", &["notes.txt"])).await;

    let d = e.evaluate(&op(OperationType::Cli, "rm", &["todo.md"])).await;
    assert_eq!(d.source, DecisionSource::PatternCache);
    assert!(d.reason.contains("'rm todo.md'"), "{}", d.reason);
    assert!(!d.reason.contains("notes.txt"), "{}", d.reason);
}

#[tokio::test]
async fn warm_cache_agrees_with_a_cold_classifier() {
    let mut tuning = tuning();
    tuning.detector.frequency_threshold = 10_000;
    let dir = tempdir().unwrap();
    let e = engine_with(dir.path(), tuning);
    let policy = e.update_policy(pinned_policy()).unwrap();

    // Each shape is filled with arguments that look alike to the cache but
    // may or may not hit a policy pattern.
    let shapes: &[(OperationType, &str, &[&str], &[&str])] = &[
        (
            OperationType::Cli,
            "rm",
            &[],
            &["notes.txt", "todo.md", "secrets.env", "Secrets.env", "build/out.log"],
        ),
        (
            OperationType::Git,
            "git",
            &["checkout"],
            &["main", "feature/x", "release/2.0", "Release/2.0", "hotfix/1.2"],
        ),
        (
            OperationType::Git,
            "git",
            &["show"],
            &["a1b2c3d", "0123abcd9", "HEAD"],
        ),
        (
            OperationType::File,
            "read",
            &[],
            &["src/a.rs", "src/b.rs", "README.md"],
        ),
        (OperationType::Cli, "gh", &["pr", "view"], &["12", "13"]),
        (OperationType::Cli, "gh", &["pr", "merge"], &["12", "13"]),
        (
            OperationType::Cli,
            "npm",
            &["publish"],
            &["dist/dev.tgz", "dist/prod.tgz", "dist/beta.tgz"],
        ),
        (
            OperationType::Script,
            "bash",
            &[],
            &["scripts/a.sh", "scripts/b.sh", "tools/c.py", "Scripts/d.sh"],
        ),
    ];
    let mut ops = Vec::new();
    for (op_type, command, prefix, fillers) in shapes {
        for filler in *fillers {
            let mut args = prefix.to_vec();
            args.push(*filler);
            ops.push(op(*op_type, command, &args));
        }
    }
    for tool in ["list_issues", "create_issue"] {
        for number in ["12", "13"] {
            ops.push(Operation::new(
                OperationType::Mcp,
                tool,
                [number],
                ctx().with_mcp("github", tool),
            ));
        }
    }

    let classifier = OperationClassifier::new();
    for round in 0..2 {
        for o in &ops {
            let served = e.evaluate(o).await;
            let cold = classifier.classify(o, &policy);
            assert_eq!(
                (served.approved, served.requires_manual_approval, served.risk_level),
                (cold.approved, cold.requires_manual_approval, cold.risk_level),
                "round {}: '{}' served from {}",
                round,
                o.command_line(),
                served.source
            );
            assert_eq!(served.reason, cold.reason, "'{}'", o.command_line());
        }
    }
    assert!(e.stats().cache.pattern_hits > 0);
}

// ── Plumbing ──

#[tokio::test]
async fn decisions_and_executions_reach_the_audit_chain() {
    let dir = tempdir().unwrap();
    let e = TrustDecisionEngine::builder(
        EngineConfig::for_project(dir.path()).with_tuning(tuning()),
    )
    .build()
    .unwrap();

    let status = git(&["status"]);
    let d = e.evaluate(&status).await;
    e.evaluate(&git(&["push", "--force"])).await;
    e.report_execution(&status, &d, ExecutionResult::success().with_exit_code(0));
    assert!(e.flush(Duration::from_secs(5)).await);

    let path = &e.config().audit_log;
    assert_eq!(JsonlAuditLogger::verify_chain(path).unwrap(), 3);
    let records = JsonlAuditLogger::read_all(path).unwrap();
    assert_eq!(records[0].decision, d);
    assert!(records[1].decision.requires_manual_approval);
    assert_eq!(records[2].kind, RecordKind::Execution);
    assert_eq!(records[2].user.as_deref(), Some("dev"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_all_get_decisions() {
    let dir = tempdir().unwrap();
    let e = engine_with(
        dir.path(),
        EngineTuning {
            high_load_threshold: 2,
            queue_deadline_ms: 10_000,
            ..tuning()
        },
    );

    let mut handles = Vec::new();
    for i in 0..64 {
        let e = e.clone();
        handles.push(tokio::spawn(async move {
            let path = format!("src/module_{}.rs", i);
            let o = op(OperationType::File, "read", &[path.as_str()]);
            e.evaluate(&o).await
        }));
    }
    for h in handles {
        let d = h.await.unwrap();
        assert!(d.approved, "{}", d.reason);
    }
    let stats = e.stats();
    assert_eq!(stats.evaluations, 64);
    assert_eq!(stats.load.active, 0);
    assert_eq!(stats.load.timed_out, 0);
}

struct DenyEverything;

impl ErrorHandler for DenyEverything {
    fn handle_error(&self, error: &EngineError, _context: &ErrorContext<'_>) -> FallbackDecision {
        let reason = format!("denied: {}", error);
        FallbackDecision {
            decision: TrustDecision::deny(RiskLevel::High, reason.clone(), error.category()),
            reason,
            fallback_applied: true,
        }
    }
}

#[tokio::test]
async fn custom_error_handler_is_used() {
    let dir = tempdir().unwrap();
    let e = TrustDecisionEngine::builder(
        EngineConfig::for_project(dir.path()).with_tuning(tuning()),
    )
    .audit_logger(Arc::new(NoopSink))
    .error_handler(Arc::new(DenyEverything))
    .build()
    .unwrap();

    let d = e.evaluate_value(&json!({"args": ["status"]})).await;
    assert!(!d.approved);
    assert!(!d.requires_manual_approval);
    assert!(d.reason.starts_with("denied: "));
    assert_eq!(e.stats().fallbacks, 1);
}

#[tokio::test]
async fn json_policy_update_applies_immediately() {
    let dir = tempdir().unwrap();
    let e = engine(dir.path());
    assert!(e.evaluate(&git(&["status"])).await.approved);

    let mut doc = serde_json::to_value(Policy::default()).unwrap();
    doc["autoApprove"]["gitOperations"] = json!(["log", "diff"]);
    doc["security"]["unmatchedOperations"] = json!("requireApproval");
    let installed = e.update_policy_value(&doc).unwrap();
    assert!(!installed.auto_approve.git_operations.contains("status"));

    let d = e.evaluate(&git(&["status"])).await;
    assert!(d.requires_manual_approval);
    assert!(d.reason.contains("no rule matched"));
    assert!(e.evaluate(&git(&["diff"])).await.approved);

    match e.update_policy_value(&json!({"version": 3})) {
        Err(EngineError::PolicyRejected { errors }) => assert!(!errors.is_empty()),
        other => panic!("expected PolicyRejected, got {:?}", other.map(|_| ())),
    }
    assert!(!e.policy().auto_approve.git_operations.contains("status"));
}

struct ExplodingMetrics;

impl MetricsCollector for ExplodingMetrics {
    fn record_operation(&self, _sample: &OperationSample) -> Result<(), AuditError> {
        panic!("metrics backend went away")
    }
}

#[tokio::test]
async fn panicking_metrics_sink_does_not_cost_a_decision() {
    let dir = tempdir().unwrap();
    let e = TrustDecisionEngine::builder(
        EngineConfig::for_project(dir.path()).with_tuning(tuning()),
    )
    .audit_logger(Arc::new(NoopSink))
    .metrics(Arc::new(ExplodingMetrics))
    .build()
    .unwrap();

    for _ in 0..3 {
        let d = e.evaluate(&git(&["status"])).await;
        assert!(d.approved);
    }
    e.flush(Duration::from_secs(5)).await;
    assert!(e.evaluate(&git(&["log"])).await.approved);
    assert_eq!(e.stats().fallbacks, 0);
}
