//! Anchoring — commit message fingerprints to an external ledger and check
//! them later.
//!
//! The ledger is a collaborator: it stores `(message_id, hash)` commitments
//! and answers whether a given id was committed with a given hash. It never
//! sees plaintext and never recomputes anything.

use crate::message::MessageFields;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnchorError {
    #[error("Message {0} already committed")]
    Duplicate(String),
    #[error("Anchoring service unavailable: {0}")]
    Unavailable(String),
}

/// What gets committed for every sent message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitmentRecord {
    pub message_id: String,
    pub from: String,
    pub to: String,
    pub hash: String,
    pub timestamp: u64,
}

impl CommitmentRecord {
    pub fn for_message(message: &crate::message::Message) -> Self {
        Self {
            message_id: message.id.clone(),
            from: message.from.clone(),
            to: message.to.clone(),
            hash: message.hash.clone(),
            timestamp: message.timestamp,
        }
    }
}

/// External anchoring service contract
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Anchor: Send + Sync {
    /// Record a commitment
    async fn commit(&self, record: CommitmentRecord) -> Result<(), AnchorError>;

    /// Whether `message_id` was committed with exactly `expected_hash`
    async fn verify(&self, message_id: &str, expected_hash: &str) -> Result<bool, AnchorError>;
}

/// In-process anchor keyed by message id
#[derive(Debug, Default)]
pub struct MemoryAnchor {
    records: RwLock<HashMap<String, CommitmentRecord>>,
}

impl MemoryAnchor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, message_id: &str) -> Option<CommitmentRecord> {
        self.records.read().get(message_id).cloned()
    }
}

#[async_trait]
impl Anchor for MemoryAnchor {
    async fn commit(&self, record: CommitmentRecord) -> Result<(), AnchorError> {
        let mut records = self.records.write();
        if records.contains_key(&record.message_id) {
            return Err(AnchorError::Duplicate(record.message_id));
        }
        records.insert(record.message_id.clone(), record);
        Ok(())
    }

    async fn verify(&self, message_id: &str, expected_hash: &str) -> Result<bool, AnchorError> {
        Ok(self
            .records
            .read()
            .get(message_id)
            .map_or(false, |record| record.hash == expected_hash))
    }
}

/// Outcome of checking a message against its claimed hash and the ledger.
///
/// `Unanchored` is a valid fingerprint that was never committed; it is kept
/// apart from `Anchored` on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verification {
    /// The fields do not fingerprint to the hash
    Mismatch,
    /// Fingerprint matches, no commitment on record
    Unanchored,
    /// Fingerprint matches and the ledger holds it
    Anchored,
}

impl Verification {
    /// The single boolean answer: valid and anchored
    pub fn is_verified(self) -> bool {
        self == Verification::Anchored
    }

    pub fn is_intact(self) -> bool {
        self != Verification::Mismatch
    }
}

impl std::fmt::Display for Verification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verification::Mismatch => write!(f, "mismatch"),
            Verification::Unanchored => write!(f, "valid but unanchored"),
            Verification::Anchored => write!(f, "valid and anchored"),
        }
    }
}

/// Recompute the fingerprint of `fields`, compare with `hash`, then ask the
/// anchor whether that commitment exists.
pub async fn verify(
    anchor: &dyn Anchor,
    hash: &str,
    fields: &MessageFields,
) -> Result<Verification, AnchorError> {
    if fields.fingerprint() != hash {
        return Ok(Verification::Mismatch);
    }

    if anchor.verify(&fields.id, hash).await? {
        Ok(Verification::Anchored)
    } else {
        Ok(Verification::Unanchored)
    }
}

/// Commit on a background task. Failures are logged, never surfaced.
pub fn spawn_commit(anchor: Arc<dyn Anchor>, record: CommitmentRecord) {
    tokio::spawn(async move {
        let message_id = record.message_id.clone();
        match anchor.commit(record).await {
            Ok(()) => debug!("Committed message {}", message_id),
            Err(e) => warn!("Commit for message {} failed: {}", message_id, e),
        }
    });
}
