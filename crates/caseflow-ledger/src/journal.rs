//! Append-only JSONL journal of ledger entries.
//!
//! Every accepted status or amendment entry can be mirrored to a JSON Lines
//! file (one record per line). With the hash chain enabled each record
//! carries `hash_prev` + `hash_self`, so an edited or deleted line is
//! detectable with [`verify_journal`].

use anyhow::{Context, Result};
use caseflow_schemas::{AmendmentEntry, CaseId, Country, StatusHistoryEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// One journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub country: Country,
    pub case_id: CaseId,
    /// `"status"` | `"amendment"`
    pub kind: String,
    pub payload: Value,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

/// Append-only journal writer.
pub struct LedgerJournal {
    path: PathBuf,
    hash_chain: bool,
    last_hash: Option<String>,
    seq: u64,
}

impl LedgerJournal {
    /// Create the journal (parent dirs included). An existing file is appended to
    /// but its chain state is NOT restored; use [`LedgerJournal::resume`] for that.
    pub fn new(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create_dir_all {:?}", parent))?;
        }

        Ok(Self {
            path,
            hash_chain,
            last_hash: None,
            seq: 0,
        })
    }

    /// Reopen an existing journal, restoring `seq` and the last hash from its tail.
    pub fn resume(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        let mut journal = Self::new(path, hash_chain)?;
        if journal.path.exists() {
            let content = fs::read_to_string(&journal.path)
                .with_context(|| format!("read journal {:?}", journal.path))?;
            let mut count = 0u64;
            let mut last: Option<JournalRecord> = None;
            for (i, line) in content.lines().enumerate() {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let rec: JournalRecord = serde_json::from_str(trimmed)
                    .with_context(|| format!("parse journal record at line {}", i + 1))?;
                count += 1;
                last = Some(rec);
            }
            journal.seq = count;
            journal.last_hash = last.and_then(|r| r.hash_self);
        }
        Ok(journal)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn last_hash(&self) -> Option<String> {
        self.last_hash.clone()
    }

    pub fn append_status(
        &mut self,
        country: &Country,
        entry: &StatusHistoryEntry,
    ) -> Result<JournalRecord> {
        let payload = serde_json::to_value(entry).context("serialize status entry failed")?;
        self.append(country, &entry.case_id, "status", payload)
    }

    pub fn append_amendment(
        &mut self,
        country: &Country,
        entry: &AmendmentEntry,
    ) -> Result<JournalRecord> {
        let payload = serde_json::to_value(entry).context("serialize amendment failed")?;
        self.append(country, &entry.case_id, "amendment", payload)
    }

    fn append(
        &mut self,
        country: &Country,
        case_id: &CaseId,
        kind: &str,
        payload: Value,
    ) -> Result<JournalRecord> {
        let mut rec = JournalRecord {
            seq: self.seq,
            recorded_at: Utc::now(),
            country: country.clone(),
            case_id: case_id.clone(),
            kind: kind.to_string(),
            payload,
            hash_prev: None,
            hash_self: None,
        };

        if self.hash_chain {
            rec.hash_prev = self.last_hash.clone();
            let self_hash = compute_record_hash(&rec)?;
            rec.hash_self = Some(self_hash.clone());
            self.last_hash = Some(self_hash);
        }

        let line = canonical_json_line(&rec)?;
        append_line(&self.path, &line)?;
        self.seq += 1;

        Ok(rec)
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open journal {:?}", path))?;
    f.write_all(line.as_bytes())
        .context("write journal line failed")?;
    f.write_all(b"\n").context("write newline failed")?;
    Ok(())
}

/// Compact JSON with recursively sorted keys.
fn canonical_json_line<T: Serialize>(v: &T) -> Result<String> {
    let raw = serde_json::to_value(v).context("serialize journal record failed")?;
    serde_json::to_string(&sort_keys(&raw)).context("json stringify failed")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Hash of the canonical record with `hash_self` cleared.
pub fn compute_record_hash(rec: &JournalRecord) -> Result<String> {
    let mut clone = rec.clone();
    clone.hash_self = None;

    let canonical = canonical_json_line(&clone)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Valid { records: usize },
    Broken { line: usize, reason: String },
}

impl VerifyResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, VerifyResult::Valid { .. })
    }
}

pub fn verify_journal(path: impl AsRef<Path>) -> Result<VerifyResult> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read journal {:?}", path.as_ref()))?;
    verify_journal_str(&content)
}

/// Check sequence continuity, `hash_prev` linkage and every `hash_self`.
pub fn verify_journal_str(content: &str) -> Result<VerifyResult> {
    let mut prev_hash: Option<String> = None;
    let mut count = 0usize;

    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let rec: JournalRecord = serde_json::from_str(trimmed)
            .with_context(|| format!("parse journal record at line {}", i + 1))?;

        if rec.seq != count as u64 {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: format!("seq gap: expected {}, got {}", count, rec.seq),
            });
        }

        if rec.hash_prev != prev_hash {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: format!(
                    "hash_prev mismatch: expected {:?}, got {:?}",
                    prev_hash, rec.hash_prev
                ),
            });
        }

        if let Some(ref claimed) = rec.hash_self {
            let recomputed = compute_record_hash(&rec)?;
            if *claimed != recomputed {
                return Ok(VerifyResult::Broken {
                    line: i + 1,
                    reason: format!(
                        "hash_self mismatch: claimed {}, recomputed {}",
                        claimed, recomputed
                    ),
                });
            }
        }

        prev_hash = rec.hash_self.clone();
        count += 1;
    }

    Ok(VerifyResult::Valid { records: count })
}
