// store.rs — PolicyStore: load, validate, and persist the policy file.
//
// The policy lives as a single JSON file (`.trustgate/policy.json`). Loading
// never fails outright: a missing, unparsable, or invalid file yields the
// hard-coded default together with the reason it was substituted, so the
// engine can keep rendering (fail-closed) decisions.
//
// Writes go through a temp file + rename so a crash mid-write cannot leave a
// half-written policy behind for the integrity verifier to flag.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;

use crate::error::PolicyError;
use crate::policy::{validate_document, Policy, ValidationReport};

/// Where the active policy came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyOrigin {
    /// Parsed and merged from the on-disk document.
    File,
    /// Hard-coded default substituted; `reason` says why.
    Default { reason: String },
}

/// Result of `PolicyStore::load()`.
#[derive(Debug, Clone)]
pub struct LoadedPolicy {
    pub policy: Policy,
    pub origin: PolicyOrigin,
    /// Validation output for the on-disk document (empty when no file).
    pub report: ValidationReport,
}

impl LoadedPolicy {
    pub fn is_default(&self) -> bool {
        matches!(self.origin, PolicyOrigin::Default { .. })
    }
}

/// Reads and writes the policy JSON file.
#[derive(Debug, Clone)]
pub struct PolicyStore {
    path: PathBuf,
}

impl PolicyStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the policy, substituting the default for anything unusable.
    pub fn load(&self) -> LoadedPolicy {
        let value = match self.read_raw() {
            Ok(Some(value)) => value,
            Ok(None) => {
                return LoadedPolicy {
                    policy: Policy::default(),
                    origin: PolicyOrigin::Default {
                        reason: format!("no policy file at {}", self.path.display()),
                    },
                    report: ValidationReport::default(),
                }
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "policy unreadable, using default");
                return LoadedPolicy {
                    policy: Policy::default(),
                    origin: PolicyOrigin::Default {
                        reason: e.to_string(),
                    },
                    report: ValidationReport {
                        is_valid: false,
                        errors: vec![e.to_string()],
                        warnings: Vec::new(),
                    },
                };
            }
        };

        match Policy::from_value(&value) {
            Ok((policy, report)) => {
                for warning in &report.warnings {
                    tracing::warn!(path = %self.path.display(), "{}", warning);
                }
                LoadedPolicy {
                    policy,
                    origin: PolicyOrigin::File,
                    report,
                }
            }
            Err(e) => {
                let report = validate_document(&value);
                tracing::warn!(path = %self.path.display(), error = %e, "policy invalid, using default");
                LoadedPolicy {
                    policy: Policy::default(),
                    origin: PolicyOrigin::Default {
                        reason: e.to_string(),
                    },
                    report,
                }
            }
        }
    }

    /// Validate a raw document without touching disk.
    pub fn validate(&self, doc: &Value) -> ValidationReport {
        validate_document(doc)
    }

    /// Read the raw JSON document. `Ok(None)` when the file does not exist.
    pub fn read_raw(&self) -> Result<Option<Value>, PolicyError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path).map_err(|source| PolicyError::Io {
            path: self.path.clone(),
            source,
        })?;
        let value = serde_json::from_str(&text).map_err(|source| PolicyError::Parse {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(value))
    }

    /// Validate and persist a policy, stamping `lastUpdated` with the current time.
    ///
    /// Returns the policy exactly as written.
    pub fn save(&self, policy: &Policy) -> Result<Policy, PolicyError> {
        let mut stamped = policy.clone();
        stamped.last_updated = Utc::now();

        let value = serde_json::to_value(&stamped)?;
        let report = validate_document(&value);
        if !report.is_valid {
            return Err(PolicyError::Invalid {
                errors: report.errors,
            });
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| PolicyError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let json = serde_json::to_string_pretty(&value)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|source| PolicyError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| PolicyError::Io {
            path: self.path.clone(),
            source,
        })?;

        tracing::info!(path = %self.path.display(), version = %stamped.version, "policy saved");
        Ok(stamped)
    }
}
