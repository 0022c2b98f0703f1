// state.rs — Persisted security posture: level + manual-approval mode.
//
// SecurityState is a durable singleton owned by the guard. Two independent
// knobs live here:
//
//   securityLevel:  NORMAL → ELEVATED → HIGH → CRITICAL
//                   Raised one step at a time by `elevate_security_level`,
//                   lowered only by an explicit `restore_security_level`.
//   manual mode:    On/off. Switched on by high-severity suspicious activity,
//                   switched off only by `restore_auto_approval_mode`.
//
// Every transition happens under one mutex and is written to disk before the
// lock is released, so concurrent evaluations never lose an update and a
// restart resumes the same posture.
//
// Raising is always applied in memory, even if the write fails (the error is
// logged). Lowering is only applied once it has been persisted.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::GuardError;

/// Escalation posture. Ordered: `Normal < Critical`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecurityLevel {
    Normal = 1,
    Elevated = 2,
    High = 3,
    Critical = 4,
}

impl SecurityLevel {
    /// One step up, capped at Critical.
    pub fn next(self) -> Self {
        match self {
            SecurityLevel::Normal => SecurityLevel::Elevated,
            SecurityLevel::Elevated => SecurityLevel::High,
            SecurityLevel::High | SecurityLevel::Critical => SecurityLevel::Critical,
        }
    }

    /// Restores may stay put or go down, never up.
    pub fn can_restore_to(self, target: SecurityLevel) -> bool {
        target <= self
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityLevel::Normal => write!(f, "NORMAL"),
            SecurityLevel::Elevated => write!(f, "ELEVATED"),
            SecurityLevel::High => write!(f, "HIGH"),
            SecurityLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl std::str::FromStr for SecurityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NORMAL" | "1" => Ok(SecurityLevel::Normal),
            "ELEVATED" | "2" => Ok(SecurityLevel::Elevated),
            "HIGH" | "3" => Ok(SecurityLevel::High),
            "CRITICAL" | "4" => Ok(SecurityLevel::Critical),
            other => Err(format!("unknown security level '{}'", other)),
        }
    }
}

/// The most recent posture change and why it happened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityIncident {
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub previous_level: SecurityLevel,
    pub new_level: SecurityLevel,
}

/// The persisted document (`security-state.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityState {
    pub security_level: SecurityLevel,
    pub is_manual_approval_mode: bool,
    #[serde(default)]
    pub last_security_incident: Option<SecurityIncident>,
    #[serde(default)]
    pub threat_count: u32,
    pub last_state_change: DateTime<Utc>,
}

impl Default for SecurityState {
    fn default() -> Self {
        Self {
            security_level: SecurityLevel::Normal,
            is_manual_approval_mode: false,
            last_security_incident: None,
            threat_count: 0,
            last_state_change: Utc::now(),
        }
    }
}

impl SecurityState {
    /// Why every operation currently needs a human, if it does.
    pub fn manual_reason(&self) -> Option<String> {
        if self.is_manual_approval_mode {
            Some("security: manual approval mode is active".to_string())
        } else if self.security_level == SecurityLevel::Critical {
            Some("security: security level is CRITICAL".to_string())
        } else {
            None
        }
    }

    fn note(&mut self, reason: &str, previous_level: SecurityLevel) {
        let now = Utc::now();
        self.last_security_incident = Some(SecurityIncident {
            reason: reason.to_string(),
            timestamp: now,
            previous_level,
            new_level: self.security_level,
        });
        self.last_state_change = now;
    }
}

/// Reads and writes the security-state file.
#[derive(Debug, Clone)]
pub struct SecurityStateStore {
    path: PathBuf,
}

impl SecurityStateStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when the file does not exist.
    pub fn load(&self) -> Result<Option<SecurityState>, GuardError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&self.path).map_err(|source| GuardError::IoError {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    /// Write via temp file + rename.
    pub fn save(&self, state: &SecurityState) -> Result<(), GuardError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| GuardError::IoError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|source| GuardError::IoError {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| GuardError::IoError {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }
}

/// Linearizable owner of the SecurityState.
pub struct SecurityStateMachine {
    store: SecurityStateStore,
    state: Mutex<SecurityState>,
}

impl SecurityStateMachine {
    /// Load persisted state. Never fails.
    ///
    /// A missing file starts at NORMAL. An unreadable or corrupt file starts
    /// at ELEVATED with manual approval on: somebody touched it.
    pub fn open(store: SecurityStateStore) -> Self {
        let state = match store.load() {
            Ok(Some(state)) => state,
            Ok(None) => SecurityState::default(),
            Err(e) => {
                tracing::warn!(
                    path = %store.path().display(),
                    error = %e,
                    "security state unreadable, starting ELEVATED in manual approval mode"
                );
                let mut state = SecurityState {
                    security_level: SecurityLevel::Elevated,
                    is_manual_approval_mode: true,
                    threat_count: 1,
                    ..SecurityState::default()
                };
                state.note(
                    &format!("security state file unreadable: {}", e),
                    SecurityLevel::Normal,
                );
                if let Err(e) = store.save(&state) {
                    tracing::error!(error = %e, "failed to rewrite security state");
                }
                state
            }
        };
        Self {
            store,
            state: Mutex::new(state),
        }
    }

    pub fn snapshot(&self) -> SecurityState {
        self.state.lock().clone()
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Raise the level one step (capped at CRITICAL) and record the incident.
    pub fn elevate_security_level(&self, reason: &str) -> SecurityState {
        let mut state = self.state.lock();
        let previous = state.security_level;
        state.security_level = previous.next();
        state.threat_count = state.threat_count.saturating_add(1);
        state.note(reason, previous);
        tracing::warn!(from = %previous, to = %state.security_level, reason, "security level elevated");
        self.persist_raise(&state);
        state.clone()
    }

    /// Count a threat without changing the level.
    pub fn record_threat(&self, reason: &str) -> SecurityState {
        let mut state = self.state.lock();
        state.threat_count = state.threat_count.saturating_add(1);
        let level = state.security_level;
        state.note(reason, level);
        self.persist_raise(&state);
        state.clone()
    }

    /// Turn manual approval mode on or off.
    ///
    /// Turning it off goes through `restore_auto_approval_mode`.
    pub fn set_manual_approval_mode(
        &self,
        enabled: bool,
        reason: &str,
    ) -> Result<SecurityState, GuardError> {
        if !enabled {
            return self.restore_auto_approval_mode(reason);
        }
        let mut state = self.state.lock();
        if !state.is_manual_approval_mode {
            state.is_manual_approval_mode = true;
            let level = state.security_level;
            state.note(reason, level);
            tracing::warn!(reason, "manual approval mode enabled");
            self.persist_raise(&state);
        }
        Ok(state.clone())
    }

    /// Leave manual approval mode. The level is left as it is.
    pub fn restore_auto_approval_mode(&self, reason: &str) -> Result<SecurityState, GuardError> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        next.is_manual_approval_mode = false;
        let level = next.security_level;
        next.note(reason, level);
        self.store.save(&next)?;
        *state = next;
        tracing::info!(reason, "auto-approval mode restored");
        Ok(state.clone())
    }

    /// Lower the level to `target`. Manual mode is left as it is.
    pub fn restore_security_level(
        &self,
        target: SecurityLevel,
        reason: &str,
    ) -> Result<SecurityState, GuardError> {
        let mut state = self.state.lock();
        let previous = state.security_level;
        if !previous.can_restore_to(target) {
            return Err(GuardError::InvalidRestore {
                from: previous,
                to: target,
            });
        }
        let mut next = state.clone();
        next.security_level = target;
        next.note(reason, previous);
        self.store.save(&next)?;
        *state = next;
        tracing::info!(from = %previous, to = %target, reason, "security level restored");
        Ok(state.clone())
    }

    fn persist_raise(&self, state: &SecurityState) {
        if let Err(e) = self.store.save(state) {
            tracing::error!(
                path = %self.store.path().display(),
                error = %e,
                "failed to persist security state; keeping raised posture in memory"
            );
        }
    }
}
