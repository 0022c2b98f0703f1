// security.rs — Security subcommands: status, restore.
//
// `status` only reads security-state.json. `restore` goes through the engine
// so the change is persisted the same way the guard persists it.

use clap::Subcommand;

use tg_engine::{EngineConfig, TrustDecisionEngine};
use tg_guard::{SecurityLevel, SecurityState, SecurityStateStore};

#[derive(Subcommand)]
pub enum SecurityCommands {
    /// Show the current security level and approval mode.
    Status,
    /// Leave manual approval mode and/or lower the security level.
    Restore {
        /// Why the restore is safe (recorded in the state file).
        #[arg(long)]
        reason: String,
        /// Lower the level to this value (normal, elevated, high).
        #[arg(long)]
        level: Option<SecurityLevel>,
        /// Keep manual approval mode on; only change the level.
        #[arg(long)]
        keep_manual: bool,
    },
}

pub fn execute(cmd: &SecurityCommands, config: &EngineConfig) -> anyhow::Result<()> {
    match cmd {
        SecurityCommands::Status => {
            let state = SecurityStateStore::new(&config.security_state_path)
                .load()?
                .unwrap_or_default();
            print_state(&state);
            Ok(())
        }
        SecurityCommands::Restore {
            reason,
            level,
            keep_manual,
        } => {
            let engine = TrustDecisionEngine::builder(config.clone()).build()?;
            let mut state = engine.security_state();
            if !keep_manual {
                state = engine.restore_auto_approval_mode(reason)?;
            }
            if let Some(level) = level {
                state = engine.restore_security_level(*level, reason)?;
            }
            print_state(&state);
            Ok(())
        }
    }
}

fn print_state(state: &SecurityState) {
    println!("Security level:       {}", state.security_level);
    println!(
        "Approval mode:        {}",
        if state.is_manual_approval_mode {
            "manual"
        } else {
            "auto"
        }
    );
    println!("Threats recorded:     {}", state.threat_count);
    println!(
        "Last change:          {}",
        state.last_state_change.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(incident) = &state.last_security_incident {
        println!(
            "Last incident:        {} ({} -> {}) {}",
            incident.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            incident.previous_level,
            incident.new_level,
            incident.reason
        );
    }
}
