// external.rs — ExternalRequestValidator: is this request plausibly genuine?
//
// Operations arrive from an agent process we do not fully trust. Before any
// policy logic runs, the request itself is checked for signs of forgery or
// corruption. Each failed check adds a weight to a risk score; the request
// is rejected when the score reaches 0.5.
//
//   check                     weight
//   session token format       0.3
//   user identifier charset    0.3
//   MCP server allowlist       0.5
//   command well-formedness    0.6
//   timestamp skew             0.5

use std::collections::BTreeSet;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use tg_policy::{Operation, OperationType};

use crate::error::GuardError;

const SESSION_WEIGHT: f64 = 0.3;
const USER_WEIGHT: f64 = 0.3;
const SOURCE_WEIGHT: f64 = 0.5;
const COMMAND_WEIGHT: f64 = 0.6;
const TIMESTAMP_WEIGHT: f64 = 0.5;

/// Score at or above which a request is rejected.
pub const REJECT_THRESHOLD: f64 = 0.5;

/// Limits for the external-request checks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Commands (with args) must be strictly shorter than this.
    pub max_command_length: usize,
    pub max_future_skew_secs: i64,
    pub max_staleness_secs: i64,
    /// External-service ids MCP operations may target.
    pub known_mcp_servers: BTreeSet<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_command_length: 10_000,
            max_future_skew_secs: 60,
            max_staleness_secs: 300,
            known_mcp_servers: [
                "github",
                "gitlab",
                "filesystem",
                "supabase",
                "vercel",
                "stripe",
                "linear",
                "slack",
                "notion",
                "sentry",
                "postgres",
                "playwright",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// One failed check.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ValidationFailure {
    pub check: &'static str,
    pub weight: f64,
    pub detail: String,
}

/// Result of validating one request.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RequestValidation {
    pub failures: Vec<ValidationFailure>,
    /// Sum of failure weights, capped at 1.0.
    pub risk_score: f64,
    pub is_valid: bool,
}

impl RequestValidation {
    pub fn summary(&self) -> String {
        self.failures
            .iter()
            .map(|f| format!("{}: {}", f.check, f.detail))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub struct ExternalRequestValidator {
    config: ValidatorConfig,
    session_token: Regex,
    user_id: Regex,
}

impl ExternalRequestValidator {
    pub fn new(config: ValidatorConfig) -> Result<Self, GuardError> {
        Ok(Self {
            config,
            session_token: Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:-]{2,127}$")?,
            user_id: Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._@+-]{0,63}$")?,
        })
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validate against the current time.
    pub fn validate(&self, op: &Operation) -> RequestValidation {
        self.validate_at(op, Utc::now())
    }

    pub fn validate_at(&self, op: &Operation, now: DateTime<Utc>) -> RequestValidation {
        let mut failures = Vec::new();
        let mut fail = |check: &'static str, weight: f64, detail: String| {
            failures.push(ValidationFailure {
                check,
                weight,
                detail,
            })
        };

        let session = &op.context.session_id;
        if !self.session_token.is_match(session) {
            fail(
                "session",
                SESSION_WEIGHT,
                if session.is_empty() {
                    "missing session id".to_string()
                } else {
                    "malformed session id".to_string()
                },
            );
        }

        let user = &op.context.user;
        if !self.user_id.is_match(user) {
            fail(
                "user",
                USER_WEIGHT,
                if user.is_empty() {
                    "missing user".to_string()
                } else {
                    format!("user '{}' contains disallowed characters", printable(user))
                },
            );
        }

        if op.op_type == OperationType::Mcp || op.context.mcp_server.is_some() {
            match op.context.mcp_server.as_deref() {
                None => fail("source", SOURCE_WEIGHT, "MCP operation without a server".to_string()),
                Some(server) if !self.config.known_mcp_servers.contains(&server.to_lowercase()) => {
                    fail(
                        "source",
                        SOURCE_WEIGHT,
                        format!("unknown MCP server '{}'", printable(server)),
                    )
                }
                Some(_) => {}
            }
        }

        if let Some(problem) = self.command_problem(op) {
            fail("command", COMMAND_WEIGHT, problem);
        }

        let future = ChronoDuration::seconds(self.config.max_future_skew_secs);
        let stale = ChronoDuration::seconds(self.config.max_staleness_secs);
        if op.timestamp > now + future {
            fail(
                "timestamp",
                TIMESTAMP_WEIGHT,
                format!("timestamp {} is in the future", op.timestamp.to_rfc3339()),
            );
        } else if op.timestamp < now - stale {
            fail(
                "timestamp",
                TIMESTAMP_WEIGHT,
                format!("timestamp {} is stale", op.timestamp.to_rfc3339()),
            );
        }

        let risk_score = failures.iter().map(|f| f.weight).sum::<f64>().min(1.0);
        RequestValidation {
            is_valid: risk_score < REJECT_THRESHOLD,
            risk_score,
            failures,
        }
    }

    fn command_problem(&self, op: &Operation) -> Option<String> {
        if op.command.trim().is_empty() {
            return Some("empty command".to_string());
        }
        let length: usize =
            op.command.chars().count() + op.args.iter().map(|a| a.chars().count() + 1).sum::<usize>();
        if length >= self.config.max_command_length {
            return Some(format!(
                "command is {} chars (limit {})",
                length, self.config.max_command_length
            ));
        }
        let has_control = std::iter::once(&op.command)
            .chain(op.args.iter())
            .any(|s| s.chars().any(|c| c.is_control() && c != '\t'));
        if has_control {
            return Some("command contains control characters".to_string());
        }
        None
    }
}

/// Escape control characters for safe inclusion in a reason string.
fn printable(s: &str) -> String {
    s.chars().take(64).flat_map(char::escape_debug).collect()
}
