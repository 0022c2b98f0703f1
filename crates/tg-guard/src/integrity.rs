// integrity.rs — ConfigIntegrityVerifier: detect tampering with the policy file.
//
// The verifier keeps a SHA-256 of the canonicalized policy document in a
// checksum file next to it (`policy.sha256`). On each verification:
//
//   no checksum yet      → trust on first use (only if the document is valid)
//   hash matches         → verified
//   hash differs, document valid, policy mtime newer than checksum mtime
//                        → legitimate edit: refresh the checksum, hand back
//                          the reloaded policy
//   anything else        → tampered: overwrite the policy with the built-in
//                          default and rewrite the checksum
//
// "Canonicalized" means parsed and re-serialized with sorted keys, so
// reformatting a file does not look like an edit. Unparsable files are
// hashed as raw bytes.
//
// The hot path must not touch the disk. `check()` does nothing until the
// debounce interval has passed; after that it stats the file and only reads
// and hashes it when the mtime or size changed.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde_json::Value;

use tg_audit::hasher;
use tg_policy::{validate_document, Policy, PolicyStore, ValidationReport};

use crate::error::GuardError;

/// Result of one verification.
#[derive(Debug, Clone, PartialEq)]
pub enum IntegrityOutcome {
    /// Debounced, or the file is unchanged since the last full check.
    Unchanged,
    /// File hashed and matched the stored checksum.
    Verified,
    /// No checksum existed; the current (valid) document was trusted.
    FirstRun,
    /// The file was legitimately edited; the new policy is attached.
    Updated {
        policy: Policy,
        report: ValidationReport,
    },
    /// The file was missing, invalid, or changed out of band. The default
    /// policy has been written back and is attached.
    Tampered { reason: String, restored: Policy },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
}

struct VerifierState {
    last_check: Option<Instant>,
    last_stamp: Option<FileStamp>,
}

/// Verifies the policy file against its checksum.
pub struct ConfigIntegrityVerifier {
    store: PolicyStore,
    checksum_path: PathBuf,
    debounce: Duration,
    state: Mutex<VerifierState>,
}

impl ConfigIntegrityVerifier {
    pub fn new(store: PolicyStore, checksum_path: impl AsRef<Path>, debounce: Duration) -> Self {
        Self {
            store,
            checksum_path: checksum_path.as_ref().to_path_buf(),
            debounce,
            state: Mutex::new(VerifierState {
                last_check: None,
                last_stamp: None,
            }),
        }
    }

    pub fn checksum_path(&self) -> &Path {
        &self.checksum_path
    }

    pub fn policy_path(&self) -> &Path {
        self.store.path()
    }

    /// Debounced verification for the evaluation hot path.
    pub fn check(&self) -> Result<IntegrityOutcome, GuardError> {
        let mut state = self.state.lock();
        if let Some(last) = state.last_check {
            if last.elapsed() < self.debounce {
                return Ok(IntegrityOutcome::Unchanged);
            }
        }
        state.last_check = Some(Instant::now());

        let current = stamp(self.store.path());
        if current.is_some() && current == state.last_stamp {
            return Ok(IntegrityOutcome::Unchanged);
        }
        self.verify_locked(&mut state)
    }

    /// Full verification, ignoring the debounce.
    pub fn verify_now(&self) -> Result<IntegrityOutcome, GuardError> {
        let mut state = self.state.lock();
        self.verify_locked(&mut state)
    }

    /// Record the current file as trusted (after a legitimate save).
    pub fn refresh(&self) -> Result<String, GuardError> {
        let mut state = self.state.lock();
        self.refresh_locked(&mut state)
    }

    fn verify_locked(&self, state: &mut VerifierState) -> Result<IntegrityOutcome, GuardError> {
        let outcome = self.compare(state)?;
        state.last_stamp = stamp(self.store.path());
        Ok(outcome)
    }

    fn compare(&self, state: &mut VerifierState) -> Result<IntegrityOutcome, GuardError> {
        let policy_path = self.store.path();
        if !policy_path.exists() {
            return self.restore_default(
                state,
                format!("policy file {} is missing", policy_path.display()),
            );
        }

        let bytes = fs::read(policy_path).map_err(|source| GuardError::IoError {
            path: policy_path.to_path_buf(),
            source,
        })?;
        let parsed: Option<Value> = serde_json::from_slice(&bytes).ok();
        let current = canonical_hash(&bytes, parsed.as_ref());
        let report = match &parsed {
            Some(value) => validate_document(value),
            None => ValidationReport {
                is_valid: false,
                errors: vec!["policy file is not valid JSON".to_string()],
                warnings: Vec::new(),
            },
        };

        let Some(stored) = self.read_checksum()? else {
            if report.is_valid {
                self.write_checksum(&current)?;
                tracing::info!(path = %policy_path.display(), "policy checksum recorded (first run)");
                return Ok(IntegrityOutcome::FirstRun);
            }
            return self.restore_default(
                state,
                format!(
                    "policy file is invalid and has no recorded checksum: {}",
                    report.errors.join("; ")
                ),
            );
        };

        if stored == current {
            return Ok(IntegrityOutcome::Verified);
        }

        if report.is_valid && self.policy_newer_than_checksum()? {
            if let Some(value) = parsed.as_ref() {
                let (policy, report) = Policy::from_value(value)?;
                self.write_checksum(&current)?;
                tracing::info!(path = %policy_path.display(), "policy file updated, checksum refreshed");
                return Ok(IntegrityOutcome::Updated { policy, report });
            }
        }

        let reason = if report.is_valid {
            "policy checksum mismatch without a newer modification time".to_string()
        } else {
            format!(
                "policy checksum mismatch and document is invalid: {}",
                report.errors.join("; ")
            )
        };
        self.restore_default(state, reason)
    }

    fn refresh_locked(&self, state: &mut VerifierState) -> Result<String, GuardError> {
        let bytes = fs::read(self.store.path()).map_err(|source| GuardError::IoError {
            path: self.store.path().to_path_buf(),
            source,
        })?;
        let parsed: Option<Value> = serde_json::from_slice(&bytes).ok();
        let hash = canonical_hash(&bytes, parsed.as_ref());
        self.write_checksum(&hash)?;
        state.last_stamp = stamp(self.store.path());
        Ok(hash)
    }

    /// The stored checksum, if any.
    pub fn read_checksum(&self) -> Result<Option<String>, GuardError> {
        if !self.checksum_path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.checksum_path).map_err(|source| GuardError::IoError {
            path: self.checksum_path.clone(),
            source,
        })?;
        let text = text.trim();
        // A mangled checksum file is treated like a mismatch, not as absent.
        if !hasher::is_hex_digest(text) {
            tracing::warn!(path = %self.checksum_path.display(), "checksum file is not a SHA-256 digest");
        }
        Ok(Some(text.to_string()))
    }

    fn write_checksum(&self, hash: &str) -> Result<(), GuardError> {
        if let Some(parent) = self.checksum_path.parent() {
            fs::create_dir_all(parent).map_err(|source| GuardError::IoError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&self.checksum_path, format!("{}\n", hash)).map_err(|source| {
            GuardError::IoError {
                path: self.checksum_path.clone(),
                source,
            }
        })
    }

    fn policy_newer_than_checksum(&self) -> Result<bool, GuardError> {
        let modified = |path: &Path| -> Result<SystemTime, GuardError> {
            fs::metadata(path)
                .and_then(|m| m.modified())
                .map_err(|source| GuardError::IoError {
                    path: path.to_path_buf(),
                    source,
                })
        };
        Ok(modified(self.store.path())? > modified(&self.checksum_path)?)
    }

    fn restore_default(
        &self,
        state: &mut VerifierState,
        reason: String,
    ) -> Result<IntegrityOutcome, GuardError> {
        tracing::error!(
            path = %self.store.path().display(),
            reason = %reason,
            "policy integrity failure, restoring default policy"
        );
        let restored = self.store.save(&Policy::default())?;
        self.refresh_locked(state)?;
        Ok(IntegrityOutcome::Tampered { reason, restored })
    }
}

/// SHA-256 of the sorted-key JSON form, or of the raw bytes if unparsable.
pub fn canonical_hash(bytes: &[u8], parsed: Option<&Value>) -> String {
    // serde_json's default Map is a BTreeMap, so to_string sorts keys.
    match parsed.and_then(|v| serde_json::to_string(v).ok()) {
        Some(canonical) => hasher::hash_str(&canonical),
        None => hasher::hash_bytes(bytes),
    }
}

fn stamp(path: &Path) -> Option<FileStamp> {
    let meta = fs::metadata(path).ok()?;
    Some(FileStamp {
        modified: meta.modified().ok()?,
        len: meta.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    fn setup(dir: &Path, debounce: Duration) -> ConfigIntegrityVerifier {
        let store = PolicyStore::new(dir.join("policy.json"));
        store.save(&Policy::default()).unwrap();
        ConfigIntegrityVerifier::new(store, dir.join("policy.sha256"), debounce)
    }

    fn backdate(path: &Path, secs: u64) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn first_run_trusts_valid_file() {
        let dir = tempdir().unwrap();
        let v = setup(dir.path(), Duration::ZERO);
        assert_eq!(v.verify_now().unwrap(), IntegrityOutcome::FirstRun);
        assert!(tg_audit::hasher::is_hex_digest(
            &v.read_checksum().unwrap().unwrap()
        ));
        assert_eq!(v.verify_now().unwrap(), IntegrityOutcome::Verified);
    }

    #[test]
    fn reformatting_is_not_an_edit() {
        let dir = tempdir().unwrap();
        let v = setup(dir.path(), Duration::ZERO);
        v.verify_now().unwrap();

        let path = dir.path().join("policy.json");
        let value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        fs::write(&path, serde_json::to_string(&value).unwrap()).unwrap();
        assert_eq!(v.verify_now().unwrap(), IntegrityOutcome::Verified);
    }

    #[test]
    fn newer_valid_edit_is_an_update() {
        let dir = tempdir().unwrap();
        let v = setup(dir.path(), Duration::ZERO);
        v.verify_now().unwrap();
        backdate(v.checksum_path(), 60);

        let path = dir.path().join("policy.json");
        let mut value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        value["security"]["maxAutoApprovalPerHour"] = 7.into();
        fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();

        match v.verify_now().unwrap() {
            IntegrityOutcome::Updated { policy, .. } => {
                assert_eq!(policy.security.max_auto_approval_per_hour, 7)
            }
            other => panic!("expected Updated, got {:?}", other),
        }
        assert_eq!(v.verify_now().unwrap(), IntegrityOutcome::Verified);
    }

    #[test]
    fn edit_older_than_checksum_is_tamper() {
        let dir = tempdir().unwrap();
        let v = setup(dir.path(), Duration::ZERO);
        v.verify_now().unwrap();

        let path = dir.path().join("policy.json");
        let mut value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        value["security"]["maxAutoApprovalPerHour"] = 99999.into();
        fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
        backdate(&path, 3600);

        match v.verify_now().unwrap() {
            IntegrityOutcome::Tampered { restored, .. } => assert_eq!(
                restored.security.max_auto_approval_per_hour,
                Policy::default().security.max_auto_approval_per_hour
            ),
            other => panic!("expected Tampered, got {:?}", other),
        }
    }

    #[test]
    fn invalid_document_is_restored_and_passes_validation() {
        let dir = tempdir().unwrap();
        let v = setup(dir.path(), Duration::ZERO);
        v.verify_now().unwrap();
        backdate(v.checksum_path(), 60);

        let path = dir.path().join("policy.json");
        fs::write(&path, r#"{"version": "", "security": {"maxAutoApprovalPerHour": "lots"}}"#)
            .unwrap();

        match v.verify_now().unwrap() {
            IntegrityOutcome::Tampered { reason, .. } => assert!(reason.contains("invalid")),
            other => panic!("expected Tampered, got {:?}", other),
        }
        let restored: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(validate_document(&restored).is_valid);
        assert_eq!(v.verify_now().unwrap(), IntegrityOutcome::Verified);
    }

    #[test]
    fn missing_file_is_restored() {
        let dir = tempdir().unwrap();
        let v = setup(dir.path(), Duration::ZERO);
        v.verify_now().unwrap();
        fs::remove_file(dir.path().join("policy.json")).unwrap();

        assert!(matches!(
            v.verify_now().unwrap(),
            IntegrityOutcome::Tampered { .. }
        ));
        assert!(dir.path().join("policy.json").exists());
    }

    #[test]
    fn invalid_file_without_checksum_is_not_trusted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("policy.json");
        fs::write(&path, "not json at all").unwrap();
        let v = ConfigIntegrityVerifier::new(
            PolicyStore::new(&path),
            dir.path().join("policy.sha256"),
            Duration::ZERO,
        );
        assert!(matches!(
            v.verify_now().unwrap(),
            IntegrityOutcome::Tampered { .. }
        ));
    }

    #[test]
    fn check_is_debounced() {
        let dir = tempdir().unwrap();
        let v = setup(dir.path(), Duration::from_secs(3600));
        assert_eq!(v.check().unwrap(), IntegrityOutcome::FirstRun);

        // Within the interval nothing is read, even if the file is garbage now.
        fs::write(dir.path().join("policy.json"), "garbage").unwrap();
        assert_eq!(v.check().unwrap(), IntegrityOutcome::Unchanged);
        // A forced check still sees it.
        assert!(matches!(
            v.verify_now().unwrap(),
            IntegrityOutcome::Tampered { .. }
        ));
    }

    #[test]
    fn check_skips_hash_when_stat_unchanged() {
        let dir = tempdir().unwrap();
        let v = setup(dir.path(), Duration::ZERO);
        assert_eq!(v.check().unwrap(), IntegrityOutcome::FirstRun);
        assert_eq!(v.check().unwrap(), IntegrityOutcome::Unchanged);
    }
}
