// policy.rs — Policy subcommands: validate, show.

use std::path::{Path, PathBuf};

use clap::Subcommand;
use serde_json::json;

use tg_engine::EngineConfig;
use tg_policy::{validate_document, PolicyOrigin, PolicyStore, ValidationReport};

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// Check a policy document against the schema.
    Validate {
        /// Path to the policy (defaults to .trustgate/policy.json).
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Print the policy the engine would run with.
    Show {
        /// Path to the policy (defaults to .trustgate/policy.json).
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

pub fn execute(cmd: &PolicyCommands, config: &EngineConfig) -> anyhow::Result<()> {
    match cmd {
        PolicyCommands::Validate { file } => {
            let path = file.as_deref().unwrap_or(&config.policy_path);
            let report = validate_file(path)?;
            for warning in &report.warnings {
                println!("warning: {}", warning);
            }
            if report.is_valid {
                println!("Policy at {} is valid.", path.display());
                Ok(())
            } else {
                for error in &report.errors {
                    println!("error: {}", error);
                }
                anyhow::bail!("policy at {} is invalid", path.display())
            }
        }
        PolicyCommands::Show { file } => {
            let path = file.as_deref().unwrap_or(&config.policy_path);
            let loaded = PolicyStore::new(path).load();
            let origin = match &loaded.origin {
                PolicyOrigin::File => json!({ "source": "file", "path": path }),
                PolicyOrigin::Default { reason } => {
                    json!({ "source": "default", "reason": reason })
                }
            };
            let out = json!({ "origin": origin, "policy": loaded.policy });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
    }
}

fn validate_file(path: &Path) -> anyhow::Result<ValidationReport> {
    if !path.exists() {
        anyhow::bail!("no policy found at {}", path.display());
    }
    let text = std::fs::read_to_string(path)?;
    Ok(match serde_json::from_str(&text) {
        Ok(value) => validate_document(&value),
        Err(e) => ValidationReport {
            is_valid: false,
            errors: vec![format!("not valid JSON: {}", e)],
            warnings: Vec::new(),
        },
    })
}
