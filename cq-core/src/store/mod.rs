//! Durable per-conversation batch storage.
//!
//! Every operation is atomic for a single key. Nothing spans keys; sweeps are
//! loops over independent single-key operations.

mod memory;
mod sqlite;

pub use memory::MemoryQueueStore;
pub use sqlite::SqliteStore;

use crate::batch::ConversationBatch;
use crate::error::{QueueError, Result};
use crate::types::ConversationKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Read-modify-write step applied under the store's per-key atomicity.
/// Returning `None` deletes the record.
pub type BatchMutation =
    Box<dyn FnOnce(Option<ConversationBatch>) -> Option<ConversationBatch> + Send>;

/// Boxes a closure as a [`BatchMutation`], letting the closure signature be inferred.
pub fn mutation<F>(f: F) -> BatchMutation
where
    F: FnOnce(Option<ConversationBatch>) -> Option<ConversationBatch> + Send + 'static,
{
    Box::new(f)
}

#[derive(Debug, Clone)]
pub struct Modification {
    pub before: Option<ConversationBatch>,
    pub after: Option<ConversationBatch>,
}

impl Modification {
    pub fn changed(&self) -> bool {
        self.before != self.after
    }
}

#[derive(Debug, Clone)]
pub enum StoredEntry {
    Batch(ConversationBatch),
    /// Undecodable record, left exactly as stored.
    Corrupt {
        storage_key: String,
        raw: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct QuarantinedEntry {
    pub storage_key: String,
    pub raw: String,
    pub reason: String,
    pub quarantined_at: DateTime<Utc>,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Current batch for the key. A corrupt record yields `CorruptEntry` and is left in place.
    async fn load(&self, key: &ConversationKey) -> Result<Option<ConversationBatch>>;

    /// Atomic read-modify-write. An unchanged result is not written back.
    ///
    /// A corrupt record is moved verbatim to quarantine and the mutation sees `None`,
    /// so the conversation keeps flowing without losing the original bytes.
    async fn modify(&self, key: &ConversationKey, mutation: BatchMutation) -> Result<Modification>;

    /// All live records, corrupt ones included.
    async fn scan(&self) -> Result<Vec<StoredEntry>>;

    /// Keys recorded in the active-key index. May include keys whose record is gone.
    async fn indexed_keys(&self) -> Result<Vec<String>>;

    /// Whether a live record (decodable or not) exists under the storage key.
    async fn contains(&self, storage_key: &str) -> Result<bool>;

    async fn prune_index(&self, storage_key: &str) -> Result<bool>;

    async fn quarantined(&self) -> Result<Vec<QuarantinedEntry>>;
}

pub(crate) fn decode_batch(storage_key: &str, raw: &str) -> Result<ConversationBatch> {
    serde_json::from_str(raw).map_err(|e| QueueError::CorruptEntry {
        key: storage_key.to_string(),
        raw: raw.to_string(),
        reason: e.to_string(),
    })
}

pub(crate) fn encode_batch(batch: &ConversationBatch) -> Result<String> {
    serde_json::to_string(batch)
        .map_err(|e| QueueError::Internal(format!("encode batch {}: {e}", batch.key)))
}
