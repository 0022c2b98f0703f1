// audit.rs — Audit subcommands: verify, tail.

use std::path::PathBuf;

use clap::Subcommand;

use tg_audit::{AuditError, DecisionRecord, JsonlAuditLogger, RecordKind};
use tg_engine::EngineConfig;

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Verify the decision log hash chain.
    Verify {
        /// Path to the log (defaults to .trustgate/audit.jsonl).
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Show recent decisions.
    Tail {
        /// Path to the log (defaults to .trustgate/audit.jsonl).
        #[arg(long)]
        log: Option<PathBuf>,
        /// Number of records to show.
        #[arg(short, default_value = "10")]
        n: usize,
    },
}

pub fn execute(cmd: &AuditCommands, config: &EngineConfig) -> anyhow::Result<()> {
    match cmd {
        AuditCommands::Verify { log } => {
            let path = log.clone().unwrap_or_else(|| config.audit_log.clone());
            if !path.exists() {
                println!("No audit log found at {}", path.display());
                return Ok(());
            }
            match JsonlAuditLogger::verify_chain(&path) {
                Ok(count) => {
                    println!("Audit log verified: {} record(s), hash chain intact.", count);
                }
                Err(AuditError::IntegrityViolation {
                    line,
                    expected,
                    actual,
                }) => {
                    println!("INTEGRITY VIOLATION at line {}:", line);
                    println!("  Expected previous_hash: {}", expected);
                    println!("  Actual previous_hash:   {}", actual);
                    anyhow::bail!("audit log integrity check failed");
                }
                Err(e) => return Err(e.into()),
            }
        }
        AuditCommands::Tail { log, n } => {
            let path = log.clone().unwrap_or_else(|| config.audit_log.clone());
            if !path.exists() {
                println!("No audit log found at {}", path.display());
                return Ok(());
            }
            let records = JsonlAuditLogger::read_all(&path)?;
            let recent = &records[records.len().saturating_sub(*n)..];
            if recent.is_empty() {
                println!("No audit records.");
                return Ok(());
            }
            println!(
                "{:<20} {:<12} {:<10} {:<8} COMMAND",
                "TIMESTAMP", "USER", "VERDICT", "RISK"
            );
            println!("{}", "-".repeat(80));
            for record in recent {
                println!(
                    "{:<20} {:<12} {:<10} {:<8} {}",
                    record.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                    record.user.as_deref().unwrap_or("-"),
                    verdict(record),
                    record.decision.risk_level,
                    record.operation.command_line(),
                );
            }
        }
    }
    Ok(())
}

fn verdict(record: &DecisionRecord) -> &'static str {
    match (&record.kind, &record.execution_result) {
        (RecordKind::Execution, Some(result)) if result.success => "ran",
        (RecordKind::Execution, _) => "failed",
        _ if record.decision.approved => "approved",
        _ if record.decision.requires_manual_approval => "manual",
        _ => "denied",
    }
}
