// classifier.rs — OperationClassifier: operation + policy → provisional verdict.
//
// A pure function of (operation, policy). Checks run in priority order and
// the first one that fires decides:
//
// 1. Deletion patterns (rm -rf, branch -D, push --delete, ...) → HIGH, manual
// 2. Force patterns (--force, -f, reset --hard) → HIGH, manual
// 3. Production impact (write-scope calls to production services,
//    production deploys / env changes) → HIGH, manual
// 4. Per-type allow-list (git subcommand, file verb, CLI tool + subcommand
//    prefix, script extension + path, read-only MCP) → approve
// 5. Nothing matched → `security.unmatchedOperations` decides
//
// Steps 1–3 combine built-in patterns with the policy's manualApprove lists.
// The built-ins cannot be removed by editing the policy file: an empty
// `deleteOperations` still escalates `rm -rf`.
//
// Pattern semantics: a pattern is split into lowercase tokens and matches
// when those tokens appear in order within the operation's normalized
// tokens. `push --delete` therefore matches `git push origin --delete x`.
// Patterns starting with `mcp:` are globs over `mcp:<server>:<tool>`.
//
// The reason text is rendered from the verdict and the operation, never
// stored with the verdict alone: `Classification::explained_for()` re-renders
// it when a verdict is reused for another operation of the same shape.

use std::collections::HashSet;

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::decision::{DecisionSource, RiskLevel, TrustDecision};
use crate::operation::{Operation, OperationType};
use crate::policy::{Policy, UnmatchedMode};

/// Deletion markers that apply regardless of policy content.
const BUILTIN_DELETION: &[&str] = &[
    "rm -rf",
    "branch -d",
    "branch --delete",
    "push --delete",
    "env rm",
    "domain rm",
];

/// Force markers that apply regardless of policy content.
const BUILTIN_FORCE: &[&str] = &["--force", "-f", "reset --hard"];

/// Tool-name segments that make an MCP call write-scoped.
const WRITE_VERBS: &[&str] = &[
    "create", "update", "delete", "remove", "write", "insert", "upsert", "apply", "execute",
    "deploy", "push", "merge", "set", "put", "patch", "post", "drop", "send", "publish", "rename",
    "move", "run", "add", "edit", "cancel", "close",
];

/// Tool-name segments that mark an MCP call as read-only.
const READ_VERBS: &[&str] = &[
    "get", "list", "search", "read", "fetch", "view", "describe", "show", "find", "lookup",
    "status", "logs",
];

/// Environments whose MCP writes count as production impact.
const PRODUCTION_ENVIRONMENTS: &[&str] = &["production", "prod"];

/// Which rule produced a classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MatchedRule {
    Deletion,
    Force,
    ProductionImpact,
    AllowList,
    ReadOnlyMcp,
    Unmatched,
}

/// Output of `OperationClassifier::classify()`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Classification {
    pub risk_level: RiskLevel,
    pub approved: bool,
    pub requires_manual_approval: bool,
    pub rule: MatchedRule,
    /// The escalation or allow-list patterns that fired.
    pub matched_patterns: Vec<String>,
    pub reason: String,
}

impl Classification {
    fn escalate(rule: MatchedRule, matched: Vec<String>) -> Self {
        Self {
            risk_level: RiskLevel::High,
            approved: false,
            requires_manual_approval: true,
            rule,
            matched_patterns: matched,
            reason: String::new(),
        }
    }

    fn approve(risk_level: RiskLevel, rule: MatchedRule, matched: Vec<String>) -> Self {
        Self {
            risk_level,
            approved: true,
            requires_manual_approval: false,
            rule,
            matched_patterns: matched,
            reason: String::new(),
        }
    }

    /// Keep the verdict, re-render the reason for `op`.
    pub fn explained_for(mut self, op: &Operation) -> Self {
        self.reason = explain(
            self.rule,
            &self.matched_patterns,
            self.requires_manual_approval,
            op,
        );
        self
    }

    /// Convert into the decision handed back to the caller.
    pub fn into_decision(self) -> TrustDecision {
        TrustDecision {
            approved: self.approved,
            requires_manual_approval: self.requires_manual_approval,
            reason: self.reason,
            risk_level: self.risk_level,
            source: DecisionSource::Classifier,
        }
    }
}

/// Stateless classifier. All inputs arrive through `classify()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationClassifier;

impl OperationClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify an operation against a policy.
    ///
    /// The caller is expected to have run `Operation::validate()` first.
    pub fn classify(&self, op: &Operation, policy: &Policy) -> Classification {
        verdict(op, policy).explained_for(op)
    }
}

fn verdict(op: &Operation, policy: &Policy) -> Classification {
    let tokens: Vec<String> = op.raw_tokens().iter().map(|t| t.to_lowercase()).collect();

    // Step 1: deletion.
    let mut deletion: Vec<String> = BUILTIN_DELETION
        .iter()
        .map(|p| p.to_string())
        .chain(policy.manual_approve.delete_operations.iter().cloned())
        .filter(|p| matches_pattern(p, &tokens))
        .collect();
    if op.raw_tokens().contains(&"-D") {
        deletion.push("-D".to_string());
    }
    if is_recursive_force_rm(&tokens) && deletion.is_empty() {
        deletion.push("rm -r -f".to_string());
    }
    if !deletion.is_empty() {
        dedup(&mut deletion);
        return Classification::escalate(MatchedRule::Deletion, deletion);
    }

    // Step 2: force.
    let mut force: Vec<String> = BUILTIN_FORCE
        .iter()
        .map(|p| p.to_string())
        .chain(policy.manual_approve.force_operations.iter().cloned())
        .filter(|p| matches_pattern(p, &tokens))
        .collect();
    if !force.is_empty() {
        dedup(&mut force);
        return Classification::escalate(MatchedRule::Force, force);
    }

    // Step 3: production impact.
    let production = production_matches(op, policy, &tokens);
    if !production.is_empty() {
        return Classification::escalate(MatchedRule::ProductionImpact, production);
    }

    // Step 4: allow-lists.
    if let Some(approved) = allow_list_match(op, policy, &tokens) {
        return approved;
    }

    // Step 5: nothing matched.
    match policy.security.unmatched_operations {
        UnmatchedMode::AutoApprove => {
            Classification::approve(RiskLevel::Low, MatchedRule::Unmatched, Vec::new())
        }
        UnmatchedMode::RequireApproval => Classification {
            risk_level: RiskLevel::Medium,
            approved: false,
            requires_manual_approval: true,
            rule: MatchedRule::Unmatched,
            matched_patterns: Vec::new(),
            reason: String::new(),
        },
    }
}

fn explain(rule: MatchedRule, matched: &[String], manual: bool, op: &Operation) -> String {
    let command_line = op
        .raw_tokens()
        .iter()
        .map(|t| t.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    let first = matched.first().map(String::as_str).unwrap_or_default();
    match rule {
        MatchedRule::Deletion => format!(
            "deletion operation requires manual approval: '{}' matched {}",
            command_line,
            quote_list(matched)
        ),
        MatchedRule::Force => format!(
            "force operation requires manual approval: '{}' matched {}",
            command_line,
            quote_list(matched)
        ),
        MatchedRule::ProductionImpact => format!(
            "production impact requires manual approval: '{}' matched {}",
            describe(op, &command_line),
            quote_list(matched)
        ),
        MatchedRule::AllowList => match op.effective_type() {
            OperationType::Git => format!("git {} is auto-approved by policy", first),
            OperationType::File => format!("file {} is auto-approved by policy", first),
            OperationType::Script => format!(
                "script {} is under allowed path '{}'",
                script_under(op, first),
                first
            ),
            _ => format!("{} is auto-approved by policy", first),
        },
        MatchedRule::ReadOnlyMcp => format!(
            "read-only MCP call {} is auto-approved",
            describe(op, mcp_tool(op))
        ),
        MatchedRule::Unmatched if manual => format!(
            "no rule matched {} operation '{}'; policy requires approval for unmatched operations",
            op.effective_type(),
            describe(op, &command_line)
        ),
        MatchedRule::Unmatched => format!(
            "no rule matched {} operation '{}'; treated as low risk",
            op.effective_type(),
            describe(op, &command_line)
        ),
    }
}

/// Lowercase tokens that a classification under `policy` can hinge on.
///
/// No escalation or allow-list check compares the text of any other
/// non-flag token.
pub fn pattern_tokens(policy: &Policy) -> HashSet<String> {
    let auto = &policy.auto_approve;
    let manual = &policy.manual_approve;
    let cli = auto
        .cli_operations
        .iter()
        .flat_map(|(tool, prefixes)| std::iter::once(tool).chain(prefixes.iter()));
    let mut tokens: HashSet<String> = BUILTIN_DELETION
        .iter()
        .chain(BUILTIN_FORCE.iter())
        .map(|p| p.to_string())
        .chain(manual.delete_operations.iter().cloned())
        .chain(manual.force_operations.iter().cloned())
        .chain(
            manual
                .production_impact
                .iter()
                .filter(|p| !p.starts_with("mcp:"))
                .cloned(),
        )
        .chain(auto.git_operations.iter().cloned())
        .chain(auto.file_operations.iter().cloned())
        .chain(cli.cloned())
        .flat_map(|p| {
            p.split_whitespace()
                .map(str::to_lowercase)
                .collect::<Vec<_>>()
        })
        .collect();
    tokens.extend(["git", "rm", "--recursive", "--force"].map(String::from));
    tokens
}

/// Ordered-subsequence token match (see module docs).
pub fn matches_pattern(pattern: &str, tokens: &[String]) -> bool {
    let wanted: Vec<String> = pattern.split_whitespace().map(str::to_lowercase).collect();
    if wanted.is_empty() {
        return false;
    }
    let mut remaining = tokens.iter();
    wanted
        .iter()
        .all(|w| remaining.by_ref().any(|t| t == w))
}

/// True when any deletion or force marker is present, ignoring policy.
///
/// Used by detectors that need "is this destructive?" without a policy.
pub fn has_destructive_marker(op: &Operation) -> bool {
    let tokens: Vec<String> = op.raw_tokens().iter().map(|t| t.to_lowercase()).collect();
    op.raw_tokens().contains(&"-D")
        || is_recursive_force_rm(&tokens)
        || BUILTIN_DELETION
            .iter()
            .chain(BUILTIN_FORCE.iter())
            .any(|p| matches_pattern(p, &tokens))
}

/// Whether an MCP tool name reads rather than writes.
pub fn is_read_only_tool(tool: &str) -> bool {
    let segments: Vec<String> = tool
        .split(|c: char| c == '_' || c == '-' || c == '.' || c == '/')
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
        .collect();
    let writes = segments.iter().any(|s| WRITE_VERBS.contains(&s.as_str()));
    let reads = segments.iter().any(|s| READ_VERBS.contains(&s.as_str()));
    reads && !writes
}

/// `rm` with both recursive and force flags, in any spelling (-rf, -fr, -r -f, -Rf).
fn is_recursive_force_rm(tokens: &[String]) -> bool {
    let Some(pos) = tokens.iter().position(|t| t == "rm") else {
        return false;
    };
    let flags: String = tokens[pos + 1..]
        .iter()
        .filter(|t| t.starts_with('-') && !t.starts_with("--"))
        .map(|t| t.trim_start_matches('-'))
        .collect();
    let long = |name: &str| tokens[pos + 1..].iter().any(|t| t == name);
    (flags.contains('r') || long("--recursive")) && (flags.contains('f') || long("--force"))
}

fn production_matches(op: &Operation, policy: &Policy, tokens: &[String]) -> Vec<String> {
    let mut matched = Vec::new();
    let mcp_key = op.mcp_key();
    let write_scope = op.effective_type() == OperationType::Mcp && !is_read_only_tool(mcp_tool(op));

    for pattern in &policy.manual_approve.production_impact {
        if let Some(glob) = pattern.strip_prefix("mcp:") {
            // Only write-scoped MCP calls count; reads of production data are fine.
            if let (Some(key), true) = (mcp_key.as_deref(), write_scope) {
                if glob_match(&format!("mcp:{}", glob.to_lowercase()), key) {
                    matched.push(pattern.clone());
                }
            }
        } else if matches_pattern(pattern, tokens) {
            matched.push(pattern.clone());
        }
    }

    if write_scope && matched.is_empty() {
        if let Some(env) = op.context.environment.as_deref() {
            if PRODUCTION_ENVIRONMENTS.contains(&env.to_lowercase().as_str()) {
                matched.push(format!("environment={}", env.to_lowercase()));
            }
        }
    }
    matched
}

fn allow_list_match(op: &Operation, policy: &Policy, tokens: &[String]) -> Option<Classification> {
    let auto = &policy.auto_approve;
    match op.effective_type() {
        OperationType::Git => {
            let sub = git_subcommand(tokens)?;
            auto.git_operations.contains(sub).then(|| {
                Classification::approve(RiskLevel::Medium, MatchedRule::AllowList, vec![sub.to_string()])
            })
        }
        OperationType::File => {
            let verb = tokens.first()?;
            auto.file_operations.contains(verb).then(|| {
                Classification::approve(RiskLevel::Low, MatchedRule::AllowList, vec![verb.clone()])
            })
        }
        OperationType::Cli => {
            let (tool, rest) = tokens.split_first()?;
            let prefixes = auto.cli_operations.get(tool)?;
            let rest_line = rest.join(" ");
            let prefix = prefixes.iter().find(|p| {
                let p = p.to_lowercase();
                rest_line == p || rest_line.starts_with(&format!("{} ", p))
            })?;
            Some(Classification::approve(
                RiskLevel::Medium,
                MatchedRule::AllowList,
                vec![format!("{} {}", tool, prefix)],
            ))
        }
        OperationType::Script => {
            let script = op
                .raw_tokens()
                .into_iter()
                .find(|t| script_extension(t).is_some_and(|ext| auto.script_execution.extensions.contains(&ext)))?;
            let allowed = script_path_allowed(
                script,
                &op.context.working_directory,
                auto.script_execution.allowed_paths.iter(),
            )?;
            Some(Classification::approve(
                RiskLevel::Medium,
                MatchedRule::AllowList,
                vec![allowed],
            ))
        }
        OperationType::Mcp => {
            let tool = mcp_tool(op);
            is_read_only_tool(tool).then(|| {
                Classification::approve(RiskLevel::Low, MatchedRule::ReadOnlyMcp, vec![tool.to_string()])
            })
        }
        OperationType::Unknown => None,
    }
}

/// First non-flag token after `git`, skipping `-C <dir>` / `-c <k=v>` (lowercased).
fn git_subcommand(tokens: &[String]) -> Option<&str> {
    let mut iter = tokens.iter();
    if tokens.first().map(String::as_str) == Some("git") {
        iter.next();
    }
    while let Some(t) = iter.next() {
        if t == "-c" {
            iter.next();
            continue;
        }
        if t.starts_with('-') {
            continue;
        }
        return Some(t.as_str());
    }
    None
}

fn script_extension(token: &str) -> Option<String> {
    let name = token.rsplit('/').next()?;
    let dot = name.rfind('.')?;
    if dot == 0 {
        return None;
    }
    Some(name[dot..].to_lowercase())
}

/// Returns the allowed prefix the script lives under, if any.
fn script_path_allowed<'a>(
    script: &str,
    working_directory: &str,
    allowed: impl Iterator<Item = &'a String>,
) -> Option<String> {
    if script.contains("..") {
        return None;
    }
    let wd = working_directory.trim_end_matches('/');
    let relative = if !wd.is_empty() && script.starts_with(&format!("{}/", wd)) {
        &script[wd.len() + 1..]
    } else {
        script.trim_start_matches("./")
    };
    if relative.starts_with('/') {
        return None;
    }
    allowed
        .map(|p| p.trim_start_matches("./").to_string())
        .find(|p| relative.starts_with(p.as_str()))
}

fn glob_match(pattern: &str, target: &str) -> bool {
    match Pattern::new(pattern) {
        Ok(p) => p.matches(target),
        Err(_) => false, // Invalid patterns never match (fail-closed at the caller)
    }
}

fn dedup(items: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    items.retain(|i| seen.insert(i.to_lowercase()));
}

fn quote_list(items: &[String]) -> String {
    items
        .iter()
        .map(|i| format!("'{}'", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe(op: &Operation, command_line: &str) -> String {
    op.mcp_key().unwrap_or_else(|| command_line.to_string())
}

fn mcp_tool(op: &Operation) -> &str {
    op.context.mcp_tool.as_deref().unwrap_or(op.command.as_str())
}

/// The script token that lives under `allowed`.
fn script_under(op: &Operation, allowed: &str) -> String {
    let allowed = [allowed.to_string()];
    op.raw_tokens()
        .into_iter()
        .find(|t| {
            script_extension(t).is_some()
                && script_path_allowed(t, &op.context.working_directory, allowed.iter()).is_some()
        })
        .unwrap_or(op.command.as_str())
        .to_string()
}
