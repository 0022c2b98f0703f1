// evaluate.rs — Run one operation through the engine and print the decision.
//
// Either build the operation from flags:
//   trustgate evaluate --type git git push --force
// or pass the raw payload an agent would send:
//   trustgate evaluate --json '{"type":"GIT","command":"git","args":["status"],...}'
//   echo '{...}' | trustgate evaluate --json -
//
// The decision is printed as JSON on stdout. The exit code is 0 when the
// operation was auto-approved, 2 when it needs a human, and 3 when denied.

use std::io::Read;
use std::time::Duration;

use clap::Args;
use serde_json::Value;

use tg_engine::{EngineConfig, TrustDecisionEngine};
use tg_policy::{Operation, OperationContext, OperationType, TrustDecision};

#[derive(Args)]
pub struct EvaluateArgs {
    /// Operation type: git, file, cli, script, mcp, unknown.
    #[arg(long = "type", value_parser = parse_type, default_value = "unknown")]
    op_type: OperationType,
    /// Acting user (defaults to $USER).
    #[arg(long)]
    user: Option<String>,
    /// Session id (defaults to one derived from this process).
    #[arg(long)]
    session: Option<String>,
    /// External service id, for MCP operations.
    #[arg(long)]
    mcp_server: Option<String>,
    /// Tool name on the external service, for MCP operations.
    #[arg(long)]
    mcp_tool: Option<String>,
    /// Target environment ("production", "staging").
    #[arg(long)]
    environment: Option<String>,
    /// Raw JSON payload instead of flags; "-" reads stdin.
    #[arg(long, conflicts_with = "command")]
    json: Option<String>,
    /// Program followed by its arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

pub async fn execute(args: &EvaluateArgs, config: &EngineConfig) -> anyhow::Result<()> {
    let engine = TrustDecisionEngine::builder(config.clone()).build()?;

    let decision = match &args.json {
        Some(source) => {
            let payload = read_payload(source)?;
            engine.evaluate_value(&payload).await
        }
        None => {
            let op = build_operation(args, config)?;
            engine.evaluate(&op).await
        }
    };

    if !engine.flush(Duration::from_secs(5)).await {
        tracing::warn!("audit records still queued at exit");
    }
    engine.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&decision)?);
    let code = exit_code(&decision);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn build_operation(args: &EvaluateArgs, config: &EngineConfig) -> anyhow::Result<Operation> {
    let Some((command, rest)) = args.command.split_first() else {
        anyhow::bail!("nothing to evaluate: pass a command or --json");
    };
    let user = args
        .user
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "agent".to_string());
    let session = args
        .session
        .clone()
        .unwrap_or_else(|| format!("cli-{}", std::process::id()));

    let mut context = OperationContext::new(
        config.project_root.display().to_string(),
        user,
        session,
    );
    if let (Some(server), Some(tool)) = (&args.mcp_server, &args.mcp_tool) {
        context = context.with_mcp(server.as_str(), tool.as_str());
    } else if args.mcp_server.is_some() || args.mcp_tool.is_some() {
        anyhow::bail!("--mcp-server and --mcp-tool must be given together");
    }
    if let Some(env) = &args.environment {
        context = context.with_environment(env.as_str());
    }
    Ok(Operation::new(args.op_type, command.as_str(), rest.iter().cloned(), context))
}

fn read_payload(source: &str) -> anyhow::Result<Value> {
    let text = if source == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        source.to_string()
    };
    Ok(serde_json::from_str(&text)?)
}

fn parse_type(s: &str) -> Result<OperationType, String> {
    serde_json::from_value(Value::String(s.to_uppercase()))
        .map_err(|_| format!("unknown operation type '{}'", s))
}

fn exit_code(decision: &TrustDecision) -> i32 {
    if decision.approved {
        0
    } else if decision.requires_manual_approval {
        2
    } else {
        3
    }
}
