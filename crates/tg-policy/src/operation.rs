// operation.rs — The unit of work the engine renders a verdict on.
//
// An Operation is one agent-initiated action: a git command, a file
// mutation, a CLI tool call, a script run, or an MCP (external service)
// tool call. Callers build one per action; the engine never mutates it.
//
// Hosts that receive untyped payloads go through `Operation::from_value()`,
// which reports a missing or `null` command/args as InvalidOperation instead
// of letting a half-formed operation reach the classifier.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// Which family of action an operation belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Git,
    File,
    Cli,
    Script,
    Mcp,
    Unknown,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Git => write!(f, "git"),
            OperationType::File => write!(f, "file"),
            OperationType::Cli => write!(f, "cli"),
            OperationType::Script => write!(f, "script"),
            OperationType::Mcp => write!(f, "mcp"),
            OperationType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Where and on whose behalf an operation runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct OperationContext {
    pub working_directory: String,
    pub user: String,
    pub session_id: String,
    /// External service id for MCP operations (e.g., "github", "supabase").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_server: Option<String>,
    /// Tool name on the external service (e.g., "create_issue").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

impl OperationContext {
    pub fn new(
        working_directory: impl Into<String>,
        user: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            working_directory: working_directory.into(),
            user: user.into(),
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    /// Attach the external service and tool for an MCP call.
    pub fn with_mcp(mut self, server: impl Into<String>, tool: impl Into<String>) -> Self {
        self.mcp_server = Some(server.into());
        self.mcp_tool = Some(tool.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }
}

/// A single agent-initiated action awaiting a verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub command: String,
    pub args: Vec<String>,
    pub context: OperationContext,
    pub timestamp: DateTime<Utc>,
}

impl Operation {
    /// Create an operation timestamped now.
    pub fn new<I, S>(
        op_type: OperationType,
        command: impl Into<String>,
        args: I,
        context: OperationContext,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            op_type,
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            context,
            timestamp: Utc::now(),
        }
    }

    /// Override the timestamp (useful for replay and for tests).
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Parse an untyped payload into an Operation.
    ///
    /// `command` and `args` must be present and non-null. A missing `type`
    /// becomes `UNKNOWN`, a missing `timestamp` becomes now, and a missing
    /// `context` becomes an empty one (the external-request validator deals
    /// with empty identities).
    pub fn from_value(value: &serde_json::Value) -> Result<Self, PolicyError> {
        let obj = value.as_object().ok_or_else(|| PolicyError::InvalidOperation {
            reason: "operation must be a JSON object".to_string(),
        })?;

        let command = match obj.get("command") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => {
                return Err(PolicyError::InvalidOperation {
                    reason: "missing command".to_string(),
                })
            }
            Some(_) => {
                return Err(PolicyError::InvalidOperation {
                    reason: "command must be a string".to_string(),
                })
            }
        };

        let args = match obj.get("args") {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| PolicyError::InvalidOperation {
                            reason: "args must contain only strings".to_string(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(serde_json::Value::Null) | None => {
                return Err(PolicyError::InvalidOperation {
                    reason: "missing args".to_string(),
                })
            }
            Some(_) => {
                return Err(PolicyError::InvalidOperation {
                    reason: "args must be an array".to_string(),
                })
            }
        };

        let op_type = match obj.get("type") {
            Some(t) if !t.is_null() => serde_json::from_value(t.clone()).map_err(|e| {
                PolicyError::InvalidOperation {
                    reason: format!("unknown operation type: {}", e),
                }
            })?,
            _ => OperationType::Unknown,
        };

        let context = match obj.get("context") {
            Some(c) if !c.is_null() => serde_json::from_value(c.clone()).map_err(|e| {
                PolicyError::InvalidOperation {
                    reason: format!("malformed context: {}", e),
                }
            })?,
            _ => OperationContext::default(),
        };

        let timestamp = match obj.get("timestamp") {
            Some(t) if !t.is_null() => serde_json::from_value(t.clone()).map_err(|e| {
                PolicyError::InvalidOperation {
                    reason: format!("malformed timestamp: {}", e),
                }
            })?,
            _ => Utc::now(),
        };

        let op = Self {
            op_type,
            command,
            args,
            context,
            timestamp,
        };
        op.validate()?;
        Ok(op)
    }

    /// Shape check run before anything else touches the operation.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.command.trim().is_empty() {
            return Err(PolicyError::InvalidOperation {
                reason: "command is empty".to_string(),
            });
        }
        Ok(())
    }

    /// All whitespace-separated tokens of command + args, in order.
    ///
    /// Case is preserved; see `normalized()` for the matching form.
    pub fn raw_tokens(&self) -> Vec<&str> {
        self.command
            .split_whitespace()
            .chain(self.args.iter().flat_map(|a| a.split_whitespace()))
            .collect()
    }

    /// Lowercased, whitespace-collapsed `command args...` string.
    pub fn normalized(&self) -> String {
        self.raw_tokens()
            .iter()
            .map(|t| t.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Full command line as the agent would run it (for logs and detectors).
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }

    /// The effective type: `UNKNOWN` operations whose program is `git` are
    /// treated as git operations.
    pub fn effective_type(&self) -> OperationType {
        if self.op_type == OperationType::Unknown
            && self.command.split_whitespace().next() == Some("git")
        {
            OperationType::Git
        } else {
            self.op_type
        }
    }

    /// `mcp:<server>:<tool>` key used by production-impact patterns.
    pub fn mcp_key(&self) -> Option<String> {
        let server = self.context.mcp_server.as_deref()?;
        let tool = self
            .context
            .mcp_tool
            .as_deref()
            .unwrap_or(self.command.as_str());
        Some(format!("mcp:{}:{}", server.to_lowercase(), tool.to_lowercase()))
    }
}
