// config.rs — Engine configuration.
//
// EngineConfig decides where the engine keeps its state (policy, checksum,
// security state, audit log) and how its caches, limits, and detectors are
// tuned. `for_project()` lays everything out under `.trustgate/` in the
// project root; `load()` additionally reads `.trustgate/engine.toml` when it
// exists. Every tunable has a default, so the file may set only a few keys:
//
//   pattern_cache_capacity = 10000
//   high_load_threshold = 50
//
//   [detector]
//   frequency_threshold = 30
//
//   [validator]
//   known_mcp_servers = ["github", "internal-tools"]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tg_guard::{DetectorConfig, ValidatorConfig};

use crate::error::EngineError;

/// Name of the state directory inside a project.
pub const STATE_DIR: &str = ".trustgate";

/// File locations plus tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    pub project_root: PathBuf,
    /// The policy document (`policy.json`).
    pub policy_path: PathBuf,
    /// Hex SHA-256 of the canonicalized policy (`policy.sha256`).
    pub checksum_path: PathBuf,
    /// Persisted SecurityState (`security-state.json`).
    pub security_state_path: PathBuf,
    /// Hash-chained decision log (`audit.jsonl`).
    pub audit_log: PathBuf,
    /// Optional tuning overrides (`engine.toml`).
    pub tuning_path: PathBuf,
    #[serde(default)]
    pub tuning: EngineTuning,
}

/// Knobs for every stage of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineTuning {
    /// Length of a rate-limit window.
    pub rate_window_secs: u64,
    /// Max entries in the normalized-pattern cache.
    pub pattern_cache_capacity: usize,
    /// Max entries in the exact-operation memo.
    pub memo_capacity: usize,
    pub cache_ttl_secs: u64,
    /// Pattern-cache hits below this confidence are ignored.
    pub pattern_cache_min_confidence: f64,
    pub precompute_interval_secs: u64,
    /// Fingerprints seen at least this often are precomputed.
    pub precompute_threshold: usize,
    /// Fingerprints remembered for precomputation.
    pub pattern_history_size: usize,
    /// Concurrent classifications before callers start queueing.
    pub high_load_threshold: usize,
    /// Longest a queued caller waits before falling back to manual approval.
    pub queue_deadline_ms: u64,
    /// Minimum interval between policy integrity checks on the hot path.
    pub integrity_debounce_ms: u64,
    /// Decisions buffered for the audit/metrics task before dropping the oldest.
    pub dispatch_capacity: usize,
    pub rate_cleanup_interval_secs: u64,
    pub detector: DetectorConfig,
    pub validator: ValidatorConfig,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            rate_window_secs: 3600,
            pattern_cache_capacity: 5000,
            memo_capacity: 1000,
            cache_ttl_secs: 300,
            pattern_cache_min_confidence: 0.8,
            precompute_interval_secs: 30,
            precompute_threshold: 5,
            pattern_history_size: 1000,
            high_load_threshold: 100,
            queue_deadline_ms: 250,
            integrity_debounce_ms: 5000,
            dispatch_capacity: 1024,
            rate_cleanup_interval_secs: 300,
            detector: DetectorConfig::default(),
            validator: ValidatorConfig::default(),
        }
    }
}

impl EngineTuning {
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn precompute_interval(&self) -> Duration {
        Duration::from_secs(self.precompute_interval_secs.max(1))
    }

    pub fn queue_deadline(&self) -> Duration {
        Duration::from_millis(self.queue_deadline_ms)
    }

    pub fn integrity_debounce(&self) -> Duration {
        Duration::from_millis(self.integrity_debounce_ms)
    }

    pub fn rate_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.rate_cleanup_interval_secs.max(1))
    }
}

impl EngineConfig {
    /// Standard `.trustgate/` layout with default tuning.
    pub fn for_project(project_root: impl AsRef<Path>) -> Self {
        let root = project_root.as_ref().to_path_buf();
        let dir = root.join(STATE_DIR);
        Self {
            project_root: root,
            policy_path: dir.join("policy.json"),
            checksum_path: dir.join("policy.sha256"),
            security_state_path: dir.join("security-state.json"),
            audit_log: dir.join("audit.jsonl"),
            tuning_path: dir.join("engine.toml"),
            tuning: EngineTuning::default(),
        }
    }

    /// `for_project()` plus `engine.toml` overrides, if the file exists.
    pub fn load(project_root: impl AsRef<Path>) -> Result<Self, EngineError> {
        let mut config = Self::for_project(project_root);
        if config.tuning_path.exists() {
            config.tuning = EngineTuning::from_file(&config.tuning_path)?;
            tracing::info!(path = %config.tuning_path.display(), "loaded engine tuning");
        }
        Ok(config)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.project_root.join(STATE_DIR)
    }

    pub fn with_tuning(mut self, tuning: EngineTuning) -> Self {
        self.tuning = tuning;
        self
    }
}

impl EngineTuning {
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let text = fs::read_to_string(path).map_err(|source| EngineError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| EngineError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }
}
