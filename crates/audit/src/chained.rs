//! JSON-lines audit log where every line carries the SHA-256 of its
//! predecessor, so edits and deletions are detectable.

use crate::{AuditError, AuditRecord, AuditTrail};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const GENESIS: &str = "genesis";

#[derive(Serialize, Deserialize, Clone)]
struct ChainedEntry {
    entry_hash: String,
    prev_hash: String,
    #[serde(flatten)]
    record: AuditRecord,
}

struct ChainState {
    file: File,
    last_hash: String,
}

pub struct JsonlAuditTrail {
    log_path: PathBuf,
    state: Mutex<ChainState>,
}

fn entry_hash(prev_hash: &str, record: &AuditRecord) -> Result<String, AuditError> {
    let record_json = serde_json::to_string(record)?;
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(&record_json);
    Ok(format!("{:x}", hasher.finalize()))
}

impl JsonlAuditTrail {
    /// Opens (or creates) the log and verifies the existing chain.
    pub fn new<P: AsRef<Path>>(log_path: P) -> Result<Self, AuditError> {
        let log_path = log_path.as_ref().to_path_buf();

        if let Some(parent) = log_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let last_hash = Self::walk_chain(&log_path)?.1;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        Ok(Self {
            log_path,
            state: Mutex::new(ChainState { file, last_hash }),
        })
    }

    pub fn verify_integrity(&self) -> Result<(), AuditError> {
        let _guard = self.state.lock();
        Self::walk_chain(&self.log_path)?;
        Ok(())
    }

    /// Verified records in file order plus the hash of the last one.
    fn walk_chain(log_path: &Path) -> Result<(Vec<AuditRecord>, String), AuditError> {
        if !log_path.exists() {
            return Ok((Vec::new(), GENESIS.to_string()));
        }

        let reader = BufReader::new(File::open(log_path)?);
        let mut prev_hash = GENESIS.to_string();
        let mut records = Vec::new();

        for (index, line) in reader.lines().enumerate() {
            let line_num = index + 1;
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let entry: ChainedEntry = serde_json::from_str(&line).map_err(|e| {
                AuditError::IntegrityViolation(format!("Line {}: Invalid JSON: {}", line_num, e))
            })?;

            if entry.prev_hash != prev_hash {
                return Err(AuditError::IntegrityViolation(format!(
                    "Line {}: Hash chain broken. Expected prev_hash '{}', got '{}'",
                    line_num, prev_hash, entry.prev_hash
                )));
            }

            let computed = entry_hash(&prev_hash, &entry.record)?;
            if computed != entry.entry_hash {
                return Err(AuditError::IntegrityViolation(format!(
                    "Line {}: Hash mismatch. Expected '{}', got '{}'",
                    line_num, computed, entry.entry_hash
                )));
            }

            prev_hash = entry.entry_hash;
            records.push(entry.record);
        }

        Ok((records, prev_hash))
    }
}

impl AuditTrail for JsonlAuditTrail {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut state = self.state.lock();

        let hash = entry_hash(&state.last_hash, record)?;
        let entry = ChainedEntry {
            entry_hash: hash.clone(),
            prev_hash: state.last_hash.clone(),
            record: record.clone(),
        };

        // One write per line so a record is never split.
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        state.file.write_all(line.as_bytes())?;
        state.file.sync_all()?;

        state.last_hash = hash;
        Ok(())
    }

    fn recent(&self, limit: usize, offset: usize) -> Result<Vec<AuditRecord>, AuditError> {
        let _guard = self.state.lock();
        let (records, _) = Self::walk_chain(&self.log_path)?;
        Ok(records.into_iter().rev().skip(offset).take(limit).collect())
    }
}
