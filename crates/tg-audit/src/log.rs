// log.rs — Append-only, hash-chained JSONL decision log.
//
// One DecisionRecord per line. Each record's `previous_hash` is the SHA-256
// of the previous line exactly as written, so inserting, deleting, or
// editing a line breaks the chain and `verify_chain` reports where.
//
// Rotation is not handled here; point a new logger at a new path.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::AuditError;
use crate::hasher;
use crate::record::DecisionRecord;
use crate::sink::AuditLogger;

struct ChainWriter {
    writer: BufWriter<File>,
    /// Hash of the last line written; becomes the next record's `previous_hash`.
    last_hash: Option<String>,
}

/// JSONL audit logger safe to share across threads.
pub struct JsonlAuditLogger {
    path: PathBuf,
    inner: Mutex<ChainWriter>,
}

impl JsonlAuditLogger {
    /// Open (or create) a log, recovering the chain head from existing content.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| AuditError::OpenFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let last_hash = if path.exists() {
            read_last_hash(&path)?
        } else {
            None
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| AuditError::OpenFailed {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            inner: Mutex::new(ChainWriter {
                writer: BufWriter::new(file),
                last_hash,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record, linking it to the previous line. Flushes before returning.
    pub fn append(&self, record: &DecisionRecord) -> Result<(), AuditError> {
        let mut inner = self.inner.lock();
        let mut linked = record.clone();
        linked.previous_hash = inner.last_hash.clone();

        let json = serde_json::to_string(&linked)?;
        writeln!(inner.writer, "{}", json)?;
        inner.writer.flush()?;
        inner.last_hash = Some(hasher::hash_str(&json));
        Ok(())
    }

    /// Read every record, oldest first. Blank lines are skipped.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<DecisionRecord>, AuditError> {
        let file = File::open(path.as_ref()).map_err(|source| AuditError::OpenFailed {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    /// Check every `previous_hash` link. `Ok(n)` is the number of records verified.
    pub fn verify_chain(path: impl AsRef<Path>) -> Result<usize, AuditError> {
        let file = File::open(path.as_ref()).map_err(|source| AuditError::OpenFailed {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        let mut previous_hash: Option<String> = None;
        let mut count = 0;

        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: DecisionRecord = serde_json::from_str(&line)?;
            if record.previous_hash != previous_hash {
                return Err(AuditError::IntegrityViolation {
                    line: line_num + 1,
                    expected: previous_hash.unwrap_or_else(|| "None".to_string()),
                    actual: record.previous_hash.unwrap_or_else(|| "None".to_string()),
                });
            }
            // Hash the raw line; re-serializing could reorder fields.
            previous_hash = Some(hasher::hash_str(&line));
            count += 1;
        }
        Ok(count)
    }
}

impl AuditLogger for JsonlAuditLogger {
    fn log_decision(&self, record: &DecisionRecord) -> Result<(), AuditError> {
        self.append(record)
    }
}

fn read_last_hash(path: &Path) -> Result<Option<String>, AuditError> {
    let file = File::open(path).map_err(|source| AuditError::OpenFailed {
        path: path.to_path_buf(),
        source,
    })?;
    let mut last_line: Option<String> = None;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            last_line = Some(line);
        }
    }
    Ok(last_line.map(|line| hasher::hash_str(&line)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ExecutionResult, RecordKind};
    use tempfile::tempdir;
    use tg_policy::{Operation, OperationContext, OperationType, RiskLevel, TrustDecision};

    fn record(cmd: &str) -> DecisionRecord {
        let op = Operation::new(
            OperationType::Git,
            "git",
            [cmd],
            OperationContext::new("/repo", "dev", "session-1234"),
        );
        DecisionRecord::decision(&op, &TrustDecision::approve(RiskLevel::Medium, "ok"))
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = JsonlAuditLogger::open(&path).unwrap();
        log.append(&record("status")).unwrap();
        log.append(&record("diff")).unwrap();

        let records = JsonlAuditLogger::read_all(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].previous_hash.is_none());
        assert!(records[1].previous_hash.is_some());
        assert_eq!(records[1].operation.args, vec!["diff".to_string()]);
    }

    #[test]
    fn chain_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.jsonl");
        {
            let log = JsonlAuditLogger::open(&path).unwrap();
            log.append(&record("status")).unwrap();
        }
        {
            let log = JsonlAuditLogger::open(&path).unwrap();
            let op = record("push").operation;
            let d = TrustDecision::approve(RiskLevel::Medium, "ok");
            log.log_decision(&DecisionRecord::execution(&op, &d, ExecutionResult::success()))
                .unwrap();
        }
        assert_eq!(JsonlAuditLogger::verify_chain(&path).unwrap(), 2);
        let records = JsonlAuditLogger::read_all(&path).unwrap();
        assert_eq!(records[1].kind, RecordKind::Execution);
    }

    #[test]
    fn edited_line_breaks_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = JsonlAuditLogger::open(&path).unwrap();
        for cmd in ["status", "diff", "log"] {
            log.append(&record(cmd)).unwrap();
        }
        drop(log);

        let content = fs::read_to_string(&path).unwrap();
        let tampered = content.replacen("\"diff\"", "\"push\"", 1);
        fs::write(&path, tampered).unwrap();

        match JsonlAuditLogger::verify_chain(&path) {
            Err(AuditError::IntegrityViolation { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected IntegrityViolation, got {:?}", other),
        }
    }

    #[test]
    fn concurrent_appends_keep_chain_intact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = std::sync::Arc::new(JsonlAuditLogger::open(&path).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        log.append(&record(&format!("cmd-{}", i))).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(JsonlAuditLogger::verify_chain(&path).unwrap(), 100);
    }
}
