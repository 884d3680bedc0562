//! Tamper-evident audit log.
//!
//! Entries are chained per agent: each new entry records the previous
//! entry's `log_id` and a SHA-256 over the previous `chain_hash` plus its
//! own canonical serialization. Appends happen under a per-agent serializer
//! so the read-latest / hash / write triple is atomic for that agent while
//! unrelated agents proceed in parallel. The WAL file is the durable truth;
//! verification re-reads it rather than trusting the in-memory index.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::{compute_entry_hash, CryptoError};
use crate::proto::{AuditEntry, AuditResult};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Fields of an entry before chain linkage is computed.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub agent_id: String,
    pub action: String,
    pub resource: Option<String>,
    pub context: Option<serde_json::Value>,
    pub allowed: bool,
    pub result: AuditResult,
    pub metadata: Option<serde_json::Value>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChainVerification {
    pub valid: bool,
    pub total_entries: usize,
    pub broken_at: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct LogQuery {
    pub agent_id: Option<String>,
    pub action: Option<String>,
    pub allowed: Option<bool>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

pub struct AuditLedger {
    path: PathBuf,
    /// serializes WAL file appends across agents
    file: Mutex<()>,
    /// per-agent chains; the inner mutex is the per-agent write serializer
    chains: RwLock<HashMap<String, Arc<Mutex<Vec<AuditEntry>>>>>,
}

impl AuditLedger {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            OpenOptions::new().create(true).append(true).open(&path)?;
        }

        let mut chains: HashMap<String, Vec<AuditEntry>> = HashMap::new();
        for entry in read_entries(&path)? {
            chains.entry(entry.agent_id.clone()).or_default().push(entry);
        }

        Ok(Self {
            path,
            file: Mutex::new(()),
            chains: RwLock::new(
                chains
                    .into_iter()
                    .map(|(agent, entries)| (agent, Arc::new(Mutex::new(entries))))
                    .collect(),
            ),
        })
    }

    /// Cheap readiness probe: the WAL must still be reachable.
    pub fn ping(&self) -> Result<(), LedgerError> {
        fs::metadata(&self.path)?;
        Ok(())
    }

    fn chain_for(&self, agent_id: &str) -> Arc<Mutex<Vec<AuditEntry>>> {
        if let Some(chain) = self
            .chains
            .read()
            .expect("chains lock poisoned")
            .get(agent_id)
        {
            return chain.clone();
        }
        self.chains
            .write()
            .expect("chains lock poisoned")
            .entry(agent_id.to_string())
            .or_default()
            .clone()
    }

    /// Append one entry with chain linkage, atomically for its agent.
    ///
    /// The WAL write happens while the per-agent serializer is held; an I/O
    /// failure aborts the append entirely so no out-of-order link can ever
    /// become observable.
    pub fn append(&self, new: NewEntry) -> Result<AuditEntry, LedgerError> {
        let chain = self.chain_for(&new.agent_id);
        let mut entries = chain.lock().expect("chain lock poisoned");

        let (prev_log_id, prev_hash) = match entries.last() {
            Some(prev) => (Some(prev.log_id.clone()), prev.chain_hash.clone()),
            None => (None, String::new()),
        };

        let mut entry = AuditEntry {
            log_id: Uuid::new_v4().to_string(),
            agent_id: new.agent_id,
            timestamp: Utc::now(),
            action: new.action,
            resource: new.resource,
            context: new.context,
            allowed: new.allowed,
            result: new.result,
            metadata: new.metadata,
            request_id: new.request_id,
            prev_log_id,
            chain_hash: String::new(),
        };
        entry.chain_hash = compute_entry_hash(&prev_hash, &entry)?;

        {
            let _file_guard = self.file.lock().expect("file lock poisoned");
            let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            let line = serde_json::to_string(&entry)?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }

        entries.push(entry.clone());
        Ok(entry)
    }

    pub fn entry_count(&self, agent_id: &str) -> usize {
        self.chains
            .read()
            .expect("chains lock poisoned")
            .get(agent_id)
            .map(|c| c.lock().expect("chain lock poisoned").len())
            .unwrap_or(0)
    }

    /// Every entry at or after `start`, across all agents, in no particular
    /// order. Used by the reporting aggregations.
    pub fn entries_since(&self, start: DateTime<Utc>) -> Vec<AuditEntry> {
        self.chains
            .read()
            .expect("chains lock poisoned")
            .values()
            .flat_map(|c| c.lock().expect("chain lock poisoned").clone())
            .filter(|e| e.timestamp >= start)
            .collect()
    }

    /// Filtered query over the in-memory index, newest first.
    pub fn query(&self, query: &LogQuery) -> Vec<AuditEntry> {
        let chains = self.chains.read().expect("chains lock poisoned");

        let mut entries: Vec<AuditEntry> = match &query.agent_id {
            Some(agent_id) => chains
                .get(agent_id)
                .map(|c| c.lock().expect("chain lock poisoned").clone())
                .unwrap_or_default(),
            None => chains
                .values()
                .flat_map(|c| c.lock().expect("chain lock poisoned").clone())
                .collect(),
        };

        entries.retain(|e| {
            query.action.as_deref().map_or(true, |a| e.action == a)
                && query.allowed.map_or(true, |allowed| e.allowed == allowed)
                && query.start_time.map_or(true, |t| e.timestamp >= t)
                && query.end_time.map_or(true, |t| e.timestamp <= t)
        });
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.log_id.cmp(&a.log_id)));

        let limit = if query.limit == 0 { 100 } else { query.limit };
        entries.into_iter().skip(query.offset).take(limit).collect()
    }

    /// Walk an agent's entries as persisted, recomputing every link. The
    /// first mismatch (hash or predecessor id) names the broken entry.
    pub fn verify_chain(&self, agent_id: &str) -> Result<ChainVerification, LedgerError> {
        let entries: Vec<AuditEntry> = read_entries(&self.path)?
            .into_iter()
            .filter(|e| e.agent_id == agent_id)
            .collect();

        let total_entries = entries.len();
        let mut prev_hash = String::new();
        let mut prev_log_id: Option<String> = None;

        for entry in &entries {
            let expected = compute_entry_hash(&prev_hash, entry)?;
            if entry.prev_log_id != prev_log_id || entry.chain_hash != expected {
                return Ok(ChainVerification {
                    valid: false,
                    total_entries,
                    broken_at: Some(entry.log_id.clone()),
                });
            }
            prev_hash = entry.chain_hash.clone();
            prev_log_id = Some(entry.log_id.clone());
        }

        Ok(ChainVerification {
            valid: true,
            total_entries,
            broken_at: None,
        })
    }
}

fn read_entries(path: &Path) -> Result<Vec<AuditEntry>, LedgerError> {
    let file = OpenOptions::new().read(true).open(path)?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str::<AuditEntry>(&line)?);
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn new_entry(agent_id: &str, action: &str) -> NewEntry {
        NewEntry {
            agent_id: agent_id.to_string(),
            action: action.to_string(),
            resource: Some("a.txt".to_string()),
            context: None,
            allowed: true,
            result: AuditResult::Success,
            metadata: None,
            request_id: None,
        }
    }

    #[test]
    fn chain_links_and_verifies() {
        let dir = tempdir().expect("tempdir");
        let ledger = AuditLedger::new(dir.path().join("audit.wal")).expect("ledger");

        let first = ledger.append(new_entry("agt_1", "read:file")).expect("append 1");
        let second = ledger.append(new_entry("agt_1", "write:file")).expect("append 2");

        assert_eq!(first.prev_log_id, None);
        assert_eq!(second.prev_log_id.as_deref(), Some(first.log_id.as_str()));
        assert_ne!(first.chain_hash, second.chain_hash);

        let verification = ledger.verify_chain("agt_1").expect("verify");
        assert!(verification.valid);
        assert_eq!(verification.total_entries, 2);
    }

    #[test]
    fn empty_chain_is_valid() {
        let dir = tempdir().expect("tempdir");
        let ledger = AuditLedger::new(dir.path().join("audit.wal")).expect("ledger");

        let verification = ledger.verify_chain("agt_nobody").expect("verify");
        assert!(verification.valid);
        assert_eq!(verification.total_entries, 0);
    }

    #[test]
    fn tampering_names_the_first_bad_entry() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("audit.wal");
        let ledger = AuditLedger::new(&path).expect("ledger");

        ledger.append(new_entry("agt_1", "read:file")).expect("append 1");
        let second = ledger.append(new_entry("agt_1", "write:file")).expect("append 2");
        ledger.append(new_entry("agt_1", "delete:file")).expect("append 3");

        // rewrite the second line with a different action, keeping the rest
        let content = fs::read_to_string(&path).expect("read wal");
        let tampered: Vec<String> = content
            .lines()
            .map(|line| {
                let mut value: serde_json::Value = serde_json::from_str(line).expect("parse");
                if value["log_id"] == serde_json::json!(second.log_id.as_str()) {
                    value["action"] = serde_json::json!("exfiltrate:file");
                }
                value.to_string()
            })
            .collect();
        fs::write(&path, tampered.join("\n") + "\n").expect("write wal");

        let verification = ledger.verify_chain("agt_1").expect("verify");
        assert!(!verification.valid);
        assert_eq!(verification.total_entries, 3);
        assert_eq!(verification.broken_at.as_deref(), Some(second.log_id.as_str()));
    }

    #[test]
    fn agents_chain_independently() {
        let dir = tempdir().expect("tempdir");
        let ledger = AuditLedger::new(dir.path().join("audit.wal")).expect("ledger");

        ledger.append(new_entry("agt_a", "read:file")).expect("a1");
        ledger.append(new_entry("agt_b", "read:file")).expect("b1");
        let a2 = ledger.append(new_entry("agt_a", "write:file")).expect("a2");

        // agt_b's entry sits between agt_a's two in the WAL but does not
        // participate in agt_a's chain
        let a_first = ledger
            .query(&LogQuery {
                agent_id: Some("agt_a".to_string()),
                ..Default::default()
            })
            .pop()
            .expect("oldest a entry");
        assert_eq!(a2.prev_log_id.as_deref(), Some(a_first.log_id.as_str()));

        assert!(ledger.verify_chain("agt_a").expect("verify a").valid);
        assert!(ledger.verify_chain("agt_b").expect("verify b").valid);
        assert_eq!(ledger.entry_count("agt_a"), 2);
        assert_eq!(ledger.entry_count("agt_b"), 1);
    }

    #[test]
    fn reload_continues_the_chain() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("audit.wal");

        let last = {
            let ledger = AuditLedger::new(&path).expect("ledger");
            ledger.append(new_entry("agt_1", "read:file")).expect("append 1");
            ledger.append(new_entry("agt_1", "write:file")).expect("append 2")
        };

        let reopened = AuditLedger::new(&path).expect("reopen");
        let third = reopened.append(new_entry("agt_1", "delete:file")).expect("append 3");
        assert_eq!(third.prev_log_id.as_deref(), Some(last.log_id.as_str()));
        assert!(reopened.verify_chain("agt_1").expect("verify").valid);
    }

    #[test]
    fn query_filters_and_orders() {
        let dir = tempdir().expect("tempdir");
        let ledger = AuditLedger::new(dir.path().join("audit.wal")).expect("ledger");

        ledger.append(new_entry("agt_1", "read:file")).expect("1");
        let mut denied = new_entry("agt_1", "delete:database");
        denied.allowed = false;
        denied.result = AuditResult::Denied;
        ledger.append(denied).expect("2");

        let only_denied = ledger.query(&LogQuery {
            agent_id: Some("agt_1".to_string()),
            allowed: Some(false),
            ..Default::default()
        });
        assert_eq!(only_denied.len(), 1);
        assert_eq!(only_denied[0].action, "delete:database");

        let all = ledger.query(&LogQuery {
            agent_id: Some("agt_1".to_string()),
            ..Default::default()
        });
        assert_eq!(all.len(), 2);
        // newest first
        assert_eq!(all[0].action, "delete:database");
    }
}
