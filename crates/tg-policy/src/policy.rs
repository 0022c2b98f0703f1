// policy.rs — The declarative allow/escalate rule set.
//
// Two shapes of the same document live here:
//
// - `Policy` is fully resolved: every field has a value. The classifier only
//   ever sees this shape.
// - `PolicyDocument` is what sits on disk: every field is optional. A missing
//   field is not an error, it falls back to the hard-coded default through
//   `Policy::merge()`, one field at a time.
//
// `validate_document()` checks the raw JSON before either shape is built, so
// a wrong type (e.g. `"gitOperations": "status"`) is reported as an error
// instead of silently disappearing during deserialization.
//
// On disk (`.trustgate/policy.json`):
// ```json
// {
//   "version": "1.0.0",
//   "lastUpdated": "2026-01-01T00:00:00Z",
//   "autoApprove": {
//     "gitOperations": ["status", "log", "diff"],
//     "fileOperations": ["read", "write"],
//     "cliOperations": { "gh": ["pr view", "pr list"] },
//     "scriptExecution": { "extensions": [".sh"], "allowedPaths": ["scripts/"] }
//   },
//   "manualApprove": {
//     "deleteOperations": ["rm -rf"],
//     "forceOperations": ["--force"],
//     "productionImpact": ["mcp:vercel:*"]
//   },
//   "security": {
//     "maxAutoApprovalPerHour": 1000,
//     "suspiciousPatternDetection": true,
//     "logAllOperations": true
//   }
// }
// ```

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current schema version written by `Policy::default()`.
pub const POLICY_VERSION: &str = "1.0.0";

/// What to do with a well-formed operation that matches no rule at all.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum UnmatchedMode {
    /// Treat as benign: LOW risk, auto-approved.
    #[default]
    AutoApprove,
    /// Fail closed: MEDIUM risk, escalated to a human.
    RequireApproval,
}

/// Script runs that may be auto-approved.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScriptExecution {
    /// Extensions including the dot (".sh", ".py").
    pub extensions: BTreeSet<String>,
    /// Relative path prefixes scripts must live under ("scripts/").
    pub allowed_paths: BTreeSet<String>,
}

/// Allow-lists consulted after the escalation patterns.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AutoApprove {
    /// Git subcommands ("status", "commit").
    pub git_operations: BTreeSet<String>,
    /// File verbs ("read", "write").
    pub file_operations: BTreeSet<String>,
    /// Tool → allowed subcommand prefixes ("gh" → {"pr view"}).
    pub cli_operations: BTreeMap<String, BTreeSet<String>>,
    pub script_execution: ScriptExecution,
}

/// Command patterns that always require a human.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManualApprove {
    pub delete_operations: BTreeSet<String>,
    pub force_operations: BTreeSet<String>,
    /// Plain command patterns, or `mcp:<server>:<tool>` globs.
    pub production_impact: BTreeSet<String>,
}

/// Global safety knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySettings {
    pub max_auto_approval_per_hour: u32,
    pub suspicious_pattern_detection: bool,
    pub log_all_operations: bool,
    #[serde(default)]
    pub unmatched_operations: UnmatchedMode,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            max_auto_approval_per_hour: 1000,
            suspicious_pattern_detection: true,
            log_all_operations: true,
            unmatched_operations: UnmatchedMode::AutoApprove,
        }
    }
}

/// A fully-resolved policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub version: String,
    pub last_updated: DateTime<Utc>,
    pub auto_approve: AutoApprove,
    pub manual_approve: ManualApprove,
    pub security: SecuritySettings,
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for Policy {
    /// The hard-coded minimal-safe policy.
    ///
    /// Substituted for a missing, invalid, or tampered policy file, and used
    /// as the base every on-disk document is merged onto.
    fn default() -> Self {
        let mut cli_operations = BTreeMap::new();
        cli_operations.insert(
            "cargo".to_string(),
            set(&["build", "check", "test", "fmt", "clippy", "doc", "tree"]),
        );
        cli_operations.insert(
            "npm".to_string(),
            set(&["install", "ci", "test", "run", "ls", "outdated"]),
        );
        cli_operations.insert("pnpm".to_string(), set(&["install", "test", "run"]));
        cli_operations.insert(
            "gh".to_string(),
            set(&[
                "pr view",
                "pr list",
                "pr create",
                "pr checks",
                "issue view",
                "issue list",
                "repo view",
            ]),
        );
        cli_operations.insert(
            "vercel".to_string(),
            set(&["ls", "logs", "inspect", "env ls"]),
        );
        cli_operations.insert(
            "supabase".to_string(),
            set(&["status", "db diff", "migration list"]),
        );

        Self {
            version: POLICY_VERSION.to_string(),
            last_updated: DateTime::<Utc>::default(),
            auto_approve: AutoApprove {
                git_operations: set(&[
                    "status", "log", "diff", "show", "branch", "checkout", "switch", "add",
                    "commit", "fetch", "pull", "push", "stash", "tag", "remote", "rev-parse",
                    "blame", "ls-files",
                ]),
                file_operations: set(&[
                    "read", "write", "create", "edit", "update", "append", "copy", "move",
                    "mkdir", "list",
                ]),
                cli_operations,
                script_execution: ScriptExecution {
                    extensions: set(&[".sh", ".py", ".js", ".ts"]),
                    allowed_paths: set(&["scripts/", "tools/"]),
                },
            },
            manual_approve: ManualApprove {
                delete_operations: set(&[
                    "rm -rf",
                    "rm -fr",
                    "branch -d",
                    "push --delete",
                    "env rm",
                    "domain rm",
                    "project rm",
                    "db reset",
                    "drop table",
                    "drop database",
                ]),
                force_operations: set(&[
                    "--force",
                    "-f",
                    "--force-with-lease",
                    "reset --hard",
                    "clean -fd",
                ]),
                production_impact: set(&[
                    "mcp:supabase:*",
                    "mcp:vercel:*",
                    "mcp:stripe:*",
                    "--prod",
                    "deploy --prod",
                    "env add production",
                    "env set",
                    "db push",
                ]),
            },
            security: SecuritySettings::default(),
        }
    }
}

impl Policy {
    /// Field-by-field merge: every field present in `doc` wins, every absent
    /// field keeps the value from `base`. Pure; neither input is modified.
    pub fn merge(base: &Policy, doc: &PolicyDocument) -> Policy {
        let auto = doc.auto_approve.as_ref();
        let scripts = auto.and_then(|a| a.script_execution.as_ref());
        let manual = doc.manual_approve.as_ref();
        let security = doc.security.as_ref();

        Policy {
            version: doc.version.clone().unwrap_or_else(|| base.version.clone()),
            last_updated: doc.last_updated.unwrap_or(base.last_updated),
            auto_approve: AutoApprove {
                git_operations: pick(
                    auto.and_then(|a| a.git_operations.as_ref()),
                    &base.auto_approve.git_operations,
                ),
                file_operations: pick(
                    auto.and_then(|a| a.file_operations.as_ref()),
                    &base.auto_approve.file_operations,
                ),
                cli_operations: pick(
                    auto.and_then(|a| a.cli_operations.as_ref()),
                    &base.auto_approve.cli_operations,
                ),
                script_execution: ScriptExecution {
                    extensions: pick(
                        scripts.and_then(|s| s.extensions.as_ref()),
                        &base.auto_approve.script_execution.extensions,
                    ),
                    allowed_paths: pick(
                        scripts.and_then(|s| s.allowed_paths.as_ref()),
                        &base.auto_approve.script_execution.allowed_paths,
                    ),
                },
            },
            manual_approve: ManualApprove {
                delete_operations: pick(
                    manual.and_then(|m| m.delete_operations.as_ref()),
                    &base.manual_approve.delete_operations,
                ),
                force_operations: pick(
                    manual.and_then(|m| m.force_operations.as_ref()),
                    &base.manual_approve.force_operations,
                ),
                production_impact: pick(
                    manual.and_then(|m| m.production_impact.as_ref()),
                    &base.manual_approve.production_impact,
                ),
            },
            security: SecuritySettings {
                max_auto_approval_per_hour: security
                    .and_then(|s| s.max_auto_approval_per_hour)
                    .unwrap_or(base.security.max_auto_approval_per_hour),
                suspicious_pattern_detection: security
                    .and_then(|s| s.suspicious_pattern_detection)
                    .unwrap_or(base.security.suspicious_pattern_detection),
                log_all_operations: security
                    .and_then(|s| s.log_all_operations)
                    .unwrap_or(base.security.log_all_operations),
                unmatched_operations: security
                    .and_then(|s| s.unmatched_operations)
                    .unwrap_or(base.security.unmatched_operations),
            },
        }
    }

    /// Build a policy from a raw document: validate, then merge onto defaults.
    pub fn from_value(value: &Value) -> Result<(Policy, ValidationReport), crate::PolicyError> {
        let report = validate_document(value);
        if !report.is_valid {
            return Err(crate::PolicyError::Invalid {
                errors: report.errors,
            });
        }
        let doc: PolicyDocument = serde_json::from_value(value.clone())?;
        Ok((Policy::merge(&Policy::default(), &doc), report))
    }
}

fn pick<T: Clone>(value: Option<&T>, fallback: &T) -> T {
    value.cloned().unwrap_or_else(|| fallback.clone())
}

// ── On-disk partial form ──

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScriptExecutionDocument {
    pub extensions: Option<BTreeSet<String>>,
    pub allowed_paths: Option<BTreeSet<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AutoApproveDocument {
    pub git_operations: Option<BTreeSet<String>>,
    pub file_operations: Option<BTreeSet<String>>,
    pub cli_operations: Option<BTreeMap<String, BTreeSet<String>>>,
    pub script_execution: Option<ScriptExecutionDocument>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManualApproveDocument {
    pub delete_operations: Option<BTreeSet<String>>,
    pub force_operations: Option<BTreeSet<String>>,
    pub production_impact: Option<BTreeSet<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityDocument {
    pub max_auto_approval_per_hour: Option<u32>,
    pub suspicious_pattern_detection: Option<bool>,
    pub log_all_operations: Option<bool>,
    pub unmatched_operations: Option<UnmatchedMode>,
}

/// A policy as written by a human: any field may be missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument {
    pub version: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub auto_approve: Option<AutoApproveDocument>,
    pub manual_approve: Option<ManualApproveDocument>,
    pub security: Option<SecurityDocument>,
}

// ── Validation ──

/// Outcome of `validate_document()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    /// Problems that make the document unusable.
    pub errors: Vec<String>,
    /// Problems that are tolerated (defaults substituted).
    pub warnings: Vec<String>,
}

const TOP_LEVEL_KEYS: &[&str] = &[
    "version",
    "lastUpdated",
    "autoApprove",
    "manualApprove",
    "security",
];

/// Above this, the hourly cap is almost certainly a typo.
const SUSPICIOUSLY_HIGH_RATE: u64 = 100_000;

/// Structurally validate a raw policy document.
pub fn validate_document(value: &Value) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let Some(root) = value.as_object() else {
        return ValidationReport {
            is_valid: false,
            errors: vec!["policy root must be a JSON object".to_string()],
            warnings,
        };
    };

    match root.get("version") {
        Some(Value::String(v)) if !v.trim().is_empty() => {}
        Some(_) => errors.push("version must be a non-empty string".to_string()),
        None => errors.push("missing required field: version".to_string()),
    }

    if let Some(ts) = root.get("lastUpdated") {
        let parsed = ts
            .as_str()
            .map(|s| DateTime::parse_from_rfc3339(s).is_ok())
            .unwrap_or(false);
        if !parsed {
            errors.push("lastUpdated must be an RFC 3339 timestamp".to_string());
        }
    }

    match root.get("autoApprove") {
        None => warnings.push("autoApprove missing; defaults substituted".to_string()),
        Some(Value::Object(auto)) => {
            check_string_list(auto.get("gitOperations"), "autoApprove.gitOperations", &mut errors);
            check_string_list(
                auto.get("fileOperations"),
                "autoApprove.fileOperations",
                &mut errors,
            );
            match auto.get("cliOperations") {
                None => {}
                Some(Value::Object(tools)) => {
                    for (tool, prefixes) in tools {
                        check_string_list(
                            Some(prefixes),
                            &format!("autoApprove.cliOperations.{}", tool),
                            &mut errors,
                        );
                    }
                }
                Some(_) => errors.push("autoApprove.cliOperations must be an object".to_string()),
            }
            match auto.get("scriptExecution") {
                None => {}
                Some(Value::Object(scripts)) => {
                    let exts = scripts.get("extensions");
                    check_string_list(exts, "autoApprove.scriptExecution.extensions", &mut errors);
                    if let Some(Value::Array(items)) = exts {
                        for ext in items.iter().filter_map(Value::as_str) {
                            if !ext.starts_with('.') {
                                errors.push(format!(
                                    "script extension '{}' must start with '.'",
                                    ext
                                ));
                            }
                        }
                    }
                    let paths = scripts.get("allowedPaths");
                    check_string_list(
                        paths,
                        "autoApprove.scriptExecution.allowedPaths",
                        &mut errors,
                    );
                    if let Some(Value::Array(items)) = paths {
                        for path in items.iter().filter_map(Value::as_str) {
                            if path.contains("..") {
                                errors.push(format!(
                                    "allowed script path '{}' must not contain '..'",
                                    path
                                ));
                            }
                        }
                    }
                }
                Some(_) => {
                    errors.push("autoApprove.scriptExecution must be an object".to_string())
                }
            }
        }
        Some(_) => errors.push("autoApprove must be an object".to_string()),
    }

    match root.get("manualApprove") {
        None => warnings.push("manualApprove missing; defaults substituted".to_string()),
        Some(Value::Object(manual)) => {
            for key in ["deleteOperations", "forceOperations", "productionImpact"] {
                let field = manual.get(key);
                check_string_list(field, &format!("manualApprove.{}", key), &mut errors);
                if let Some(Value::Array(items)) = field {
                    if items.is_empty() {
                        warnings.push(format!(
                            "manualApprove.{} is empty; built-in patterns still apply",
                            key
                        ));
                    }
                }
            }
        }
        Some(_) => errors.push("manualApprove must be an object".to_string()),
    }

    match root.get("security") {
        None => warnings.push("security missing; defaults substituted".to_string()),
        Some(Value::Object(security)) => {
            match security.get("maxAutoApprovalPerHour") {
                None => {}
                Some(v) => match v.as_u64() {
                    Some(0) => errors
                        .push("security.maxAutoApprovalPerHour must be at least 1".to_string()),
                    Some(n) if n > u64::from(u32::MAX) => errors
                        .push("security.maxAutoApprovalPerHour is out of range".to_string()),
                    Some(n) if n > SUSPICIOUSLY_HIGH_RATE => warnings.push(format!(
                        "security.maxAutoApprovalPerHour = {} effectively disables rate limiting",
                        n
                    )),
                    Some(_) => {}
                    None => errors.push(
                        "security.maxAutoApprovalPerHour must be a positive integer".to_string(),
                    ),
                },
            }
            for key in ["suspiciousPatternDetection", "logAllOperations"] {
                if let Some(v) = security.get(key) {
                    if !v.is_boolean() {
                        errors.push(format!("security.{} must be a boolean", key));
                    }
                }
            }
            if security.get("suspiciousPatternDetection") == Some(&Value::Bool(false)) {
                warnings.push("suspicious pattern detection is disabled".to_string());
            }
            if let Some(v) = security.get("unmatchedOperations") {
                if serde_json::from_value::<UnmatchedMode>(v.clone()).is_err() {
                    errors.push(
                        "security.unmatchedOperations must be \"autoApprove\" or \"requireApproval\""
                            .to_string(),
                    );
                }
            }
        }
        Some(_) => errors.push("security must be an object".to_string()),
    }

    for key in root.keys() {
        if !TOP_LEVEL_KEYS.contains(&key.as_str()) {
            warnings.push(format!("unknown top-level field '{}' ignored", key));
        }
    }

    ValidationReport {
        is_valid: errors.is_empty(),
        errors,
        warnings,
    }
}

fn check_string_list(value: Option<&Value>, field: &str, errors: &mut Vec<String>) {
    match value {
        None => {}
        Some(Value::Array(items)) => {
            if !items.iter().all(Value::is_string) {
                errors.push(format!("{} must contain only strings", field));
            }
        }
        Some(_) => errors.push(format!("{} must be an array of strings", field)),
    }
}
