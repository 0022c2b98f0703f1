//! # tg-cli
//!
//! Command-line host for the trustgate decision engine.
//!
//! - `trustgate evaluate`: run one operation through the engine and print the decision
//! - `trustgate policy validate/show`: check or display the active policy
//! - `trustgate security status/restore`: inspect or reset the security state
//! - `trustgate audit verify/tail`: inspect the hash-chained decision log

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tg_engine::EngineConfig;

/// Trustgate: decide which agent operations may run unattended.
#[derive(Parser)]
#[command(name = "trustgate", version, about)]
struct Cli {
    /// Project root directory (defaults to current directory).
    #[arg(long, default_value = ".")]
    project_root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a single operation.
    Evaluate(commands::evaluate::EvaluateArgs),
    /// Validate or display the policy.
    Policy {
        #[command(subcommand)]
        command: commands::policy::PolicyCommands,
    },
    /// Inspect or restore the security state.
    Security {
        #[command(subcommand)]
        command: commands::security::SecurityCommands,
    },
    /// Inspect the decision log.
    Audit {
        #[command(subcommand)]
        command: commands::audit::AuditCommands,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Decisions go to stdout; logs stay on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tg_engine=info".parse()?)
                .add_directive("tg_guard=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let project_root = cli.project_root.canonicalize().unwrap_or(cli.project_root);
    let config = EngineConfig::load(&project_root)?;

    match &cli.command {
        Commands::Evaluate(args) => commands::evaluate::execute(args, &config).await,
        Commands::Policy { command } => commands::policy::execute(command, &config),
        Commands::Security { command } => commands::security::execute(command, &config),
        Commands::Audit { command } => commands::audit::execute(command, &config),
    }
}
