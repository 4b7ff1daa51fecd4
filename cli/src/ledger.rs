// Commitment Ledger — file-backed anchoring service
//
// Every sent message's (id, from, to, hash, timestamp) lands here. The file
// is plain JSON, loaded once on start and rewritten after each commit.
// A message id can be committed once; a second commit is rejected rather
// than overwriting the first.
//
// The rewrite runs on the blocking pool, outside the in-memory lock. Saves
// are serialized so an older snapshot never lands after a newer one.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use parley_core::{Anchor, AnchorError, CommitmentRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const LEDGER_VERSION: u32 = 1;

/// On-disk ledger contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitmentLedger {
    /// Format version
    pub version: u32,

    /// Commitments keyed by message id
    pub entries: HashMap<String, CommitmentRecord>,

    /// Unix timestamp of last save
    pub last_saved: u64,
}

impl Default for CommitmentLedger {
    fn default() -> Self {
        Self {
            version: LEDGER_VERSION,
            entries: HashMap::new(),
            last_saved: 0,
        }
    }
}

impl CommitmentLedger {
    /// Load ledger from `path`, or start empty
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read ledger file")?;
            let ledger: CommitmentLedger =
                serde_json::from_str(&contents).context("Failed to parse ledger file")?;
            tracing::info!("Loaded commitment ledger: {} entries", ledger.entries.len());
            Ok(ledger)
        } else {
            tracing::info!("No existing ledger at {}, starting fresh", path.display());
            Ok(Self::default())
        }
    }

    /// Stamp and save ledger to `path`
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.stamp();
        self.write_to(path)
    }

    fn stamp(&mut self) {
        self.last_saved = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
    }

    fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create ledger directory")?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize ledger")?;
        std::fs::write(path, contents).context("Failed to write ledger file")?;

        tracing::debug!("Saved ledger ({} entries)", self.entries.len());
        Ok(())
    }

    /// Commitments involving `address`, newest first
    pub fn for_address(&self, address: &str) -> Vec<&CommitmentRecord> {
        let mut records: Vec<&CommitmentRecord> = self
            .entries
            .values()
            .filter(|r| r.from == address || r.to == address)
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records
    }
}

/// Anchor backed by a [`CommitmentLedger`] file
pub struct LedgerAnchor {
    path: PathBuf,
    ledger: Mutex<CommitmentLedger>,
    save_gate: tokio::sync::Mutex<()>,
}

impl LedgerAnchor {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::with_ledger(path, CommitmentLedger::load(path)?))
    }

    fn with_ledger(path: &Path, ledger: CommitmentLedger) -> Self {
        Self {
            path: path.to_path_buf(),
            ledger: Mutex::new(ledger),
            save_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.ledger.lock().entries.len()
    }
}

#[async_trait]
impl Anchor for LedgerAnchor {
    async fn commit(&self, record: CommitmentRecord) -> Result<(), AnchorError> {
        let _saving = self.save_gate.lock().await;

        let message_id = record.message_id.clone();
        let snapshot = {
            let mut ledger = self.ledger.lock();
            if ledger.entries.contains_key(&message_id) {
                return Err(AnchorError::Duplicate(message_id));
            }
            ledger.entries.insert(message_id.clone(), record);
            ledger.stamp();
            ledger.clone()
        };

        let path = self.path.clone();
        let saved = tokio::task::spawn_blocking(move || snapshot.write_to(&path))
            .await
            .map_err(|e| anyhow::anyhow!("Ledger save task failed: {}", e))
            .and_then(|r| r);

        if let Err(e) = saved {
            self.ledger.lock().entries.remove(&message_id);
            return Err(AnchorError::Unavailable(format!("{:#}", e)));
        }
        Ok(())
    }

    async fn verify(&self, message_id: &str, expected_hash: &str) -> Result<bool, AnchorError> {
        Ok(self
            .ledger
            .lock()
            .entries
            .get(message_id)
            .map_or(false, |r| r.hash == expected_hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{anchor, Message};

    fn record(message: &Message) -> CommitmentRecord {
        CommitmentRecord::for_message(message)
    }

    #[tokio::test]
    async fn test_commit_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let msg = Message::new("ALICE", "BOB", "hi");

        let ledger = LedgerAnchor::open(&path).unwrap();
        ledger.commit(record(&msg)).await.unwrap();
        assert!(path.exists());

        let reopened = LedgerAnchor::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(reopened.verify(&msg.id, &msg.hash).await.unwrap());
        assert!(!reopened.verify(&msg.id, "00").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = LedgerAnchor::open(&dir.path().join("ledger.json")).unwrap();
        let msg = Message::new("ALICE", "BOB", "hi");

        ledger.commit(record(&msg)).await.unwrap();
        let mut forged = record(&msg);
        forged.hash = "ff".repeat(32);

        let result = ledger.commit(forged).await;
        assert!(matches!(result, Err(AnchorError::Duplicate(_))));
        assert_eq!(ledger.ledger.lock().entries[&msg.id].hash, msg.hash);
    }

    #[tokio::test]
    async fn test_unwritable_path_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be.
        let path = dir.path().join("ledger.json");
        std::fs::create_dir_all(&path).unwrap();

        let ledger = LedgerAnchor::with_ledger(&path, CommitmentLedger::default());
        let msg = Message::new("ALICE", "BOB", "hi");

        let result = ledger.commit(record(&msg)).await;
        assert!(matches!(result, Err(AnchorError::Unavailable(_))));
        assert_eq!(ledger.len(), 0);
    }

    #[tokio::test]
    async fn test_three_way_verification() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = LedgerAnchor::open(&dir.path().join("ledger.json")).unwrap();
        let msg = Message::new("ALICE", "BOB", "hi");

        let fields = msg.fields();
        assert_eq!(
            anchor::verify(&ledger, &msg.hash, &fields).await.unwrap(),
            parley_core::Verification::Unanchored
        );

        ledger.commit(record(&msg)).await.unwrap();
        assert_eq!(
            anchor::verify(&ledger, &msg.hash, &fields).await.unwrap(),
            parley_core::Verification::Anchored
        );
    }

    #[test]
    fn test_for_address_newest_first() {
        let mut ledger = CommitmentLedger::default();
        for (id, ts, from, to) in [("a", 1, "ALICE", "BOB"), ("b", 3, "BOB", "ALICE"), ("c", 2, "CAROL", "DAVE")] {
            ledger.entries.insert(
                id.to_string(),
                CommitmentRecord {
                    message_id: id.to_string(),
                    from: from.to_string(),
                    to: to.to_string(),
                    hash: String::new(),
                    timestamp: ts,
                },
            );
        }

        let ids: Vec<&str> = ledger
            .for_address("ALICE")
            .iter()
            .map(|r| r.message_id.as_str())
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_commits_all_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let ledger = std::sync::Arc::new(LedgerAnchor::open(&path).unwrap());

        let messages: Vec<Message> = (0..16)
            .map(|i| Message::new("ALICE", "BOB", &format!("m{}", i)))
            .collect();
        let commits: Vec<_> = messages
            .iter()
            .map(|msg| {
                let ledger = std::sync::Arc::clone(&ledger);
                let record = record(msg);
                tokio::spawn(async move { ledger.commit(record).await })
            })
            .collect();
        for commit in commits {
            commit.await.unwrap().unwrap();
        }

        let on_disk = CommitmentLedger::load(&path).unwrap();
        assert_eq!(on_disk.entries.len(), messages.len());
        for msg in &messages {
            assert_eq!(on_disk.entries[&msg.id].hash, msg.hash);
        }
    }

    #[tokio::test]
    async fn test_verify_answers_during_commit() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = LedgerAnchor::open(&dir.path().join("ledger.json")).unwrap();
        let first = Message::new("ALICE", "BOB", "first");
        let second = Message::new("ALICE", "BOB", "second");
        ledger.commit(record(&first)).await.unwrap();

        let (committed, verified) = tokio::join!(
            ledger.commit(record(&second)),
            ledger.verify(&first.id, &first.hash)
        );
        committed.unwrap();
        assert!(verified.unwrap());
    }
}
