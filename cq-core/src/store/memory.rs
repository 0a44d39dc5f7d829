use super::{
    BatchMutation, Modification, QuarantinedEntry, QueueStore, StoredEntry, decode_batch,
    encode_batch,
};
use crate::batch::ConversationBatch;
use crate::clock::{Clock, to_chrono};
use crate::error::{QueueError, Result};
use crate::types::ConversationKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredRecord {
    raw: String,
    expires_at: DateTime<Utc>,
}

/// Process-local store. DashMap entry guards provide the per-key atomicity.
pub struct MemoryQueueStore {
    records: DashMap<String, StoredRecord>,
    index: DashMap<String, DateTime<Utc>>,
    quarantine: Mutex<Vec<QuarantinedEntry>>,
    entry_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl MemoryQueueStore {
    pub fn new(entry_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            index: DashMap::new(),
            quarantine: Mutex::new(Vec::new()),
            entry_ttl,
            clock,
        }
    }

    /// Writes raw record text as-is, bypassing encoding. Used by import tooling and tests.
    pub fn insert_raw(&self, storage_key: &str, raw: impl Into<String>) {
        let now = self.clock.now();
        self.records.insert(
            storage_key.to_string(),
            StoredRecord {
                raw: raw.into(),
                expires_at: now + to_chrono(self.entry_ttl),
            },
        );
        self.index.insert(storage_key.to_string(), now);
    }

    fn push_quarantine(&self, storage_key: &str, raw: String, reason: String, now: DateTime<Utc>) {
        tracing::error!(
            conversation_key = %storage_key,
            %reason,
            raw_len = raw.len(),
            "corrupt batch record moved to quarantine"
        );
        let mut guard = self.quarantine.lock().unwrap_or_else(|e| e.into_inner());
        guard.push(QuarantinedEntry {
            storage_key: storage_key.to_string(),
            raw,
            reason,
            quarantined_at: now,
        });
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn load(&self, key: &ConversationKey) -> Result<Option<ConversationBatch>> {
        let storage_key = key.storage_key();
        let now = self.clock.now();
        let Some(record) = self.records.get(&storage_key) else {
            return Ok(None);
        };
        if record.expires_at <= now {
            return Ok(None);
        }
        decode_batch(&storage_key, &record.raw).map(Some)
    }

    async fn modify(&self, key: &ConversationKey, mutation: BatchMutation) -> Result<Modification> {
        let storage_key = key.storage_key();
        let now = self.clock.now();
        let expires_at = now + to_chrono(self.entry_ttl);

        let modification = match self.records.entry(storage_key.clone()) {
            Entry::Occupied(mut occupied) => {
                let before = if occupied.get().expires_at <= now {
                    None
                } else {
                    match decode_batch(&storage_key, &occupied.get().raw) {
                        Ok(batch) => Some(batch),
                        Err(QueueError::CorruptEntry { raw, reason, .. }) => {
                            self.push_quarantine(&storage_key, raw, reason, now);
                            None
                        }
                        Err(e) => return Err(e),
                    }
                };
                let after = mutation(before.clone());
                match &after {
                    Some(batch) if before.as_ref() != Some(batch) => {
                        occupied.insert(StoredRecord {
                            raw: encode_batch(batch)?,
                            expires_at,
                        });
                    }
                    Some(_) => {}
                    None => {
                        occupied.remove();
                    }
                }
                Modification { before, after }
            }
            Entry::Vacant(vacant) => {
                let after = mutation(None);
                if let Some(batch) = &after {
                    vacant.insert(StoredRecord {
                        raw: encode_batch(batch)?,
                        expires_at,
                    });
                }
                Modification {
                    before: None,
                    after,
                }
            }
        };

        if modification.after.is_some() {
            self.index.entry(storage_key).or_insert(now);
        }
        Ok(modification)
    }

    async fn scan(&self) -> Result<Vec<StoredEntry>> {
        let now = self.clock.now();
        let mut entries = Vec::new();
        for record in self.records.iter() {
            if record.expires_at <= now {
                continue;
            }
            match decode_batch(record.key(), &record.raw) {
                Ok(batch) => entries.push(StoredEntry::Batch(batch)),
                Err(QueueError::CorruptEntry { key, raw, reason }) => {
                    entries.push(StoredEntry::Corrupt {
                        storage_key: key,
                        raw,
                        reason,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(entries)
    }

    async fn indexed_keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.index.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }

    async fn contains(&self, storage_key: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .records
            .get(storage_key)
            .map(|record| record.expires_at > now)
            .unwrap_or(false))
    }

    async fn prune_index(&self, storage_key: &str) -> Result<bool> {
        Ok(self.index.remove(storage_key).is_some())
    }

    async fn quarantined(&self) -> Result<Vec<QuarantinedEntry>> {
        let guard = self.quarantine.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchState;
    use crate::batch::fixtures::{key, text_message};
    use crate::clock::ManualClock;
    use crate::store::mutation;

    fn store_with_clock() -> (MemoryQueueStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemoryQueueStore::new(Duration::from_secs(60), clock.clone());
        (store, clock)
    }

    #[tokio::test]
    async fn modify_creates_updates_and_deletes() {
        let (store, clock) = store_with_clock();
        let now = clock.now();
        let created = store
            .modify(
                &key(),
                mutation(move |_| Some(ConversationBatch::new(text_message("hi", now), now))),
            )
            .await
            .expect("create");
        assert!(created.before.is_none());
        assert!(created.changed());

        let appended = store
            .modify(
                &key(),
                mutation(move |existing| {
                    let mut batch = existing?;
                    batch.push(text_message("again", now), now);
                    Some(batch)
                }),
            )
            .await
            .expect("append");
        assert_eq!(appended.after.as_ref().map(|b| b.messages.len()), Some(2));

        let loaded = store.load(&key()).await.expect("load").expect("batch");
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.state, BatchState::Active);

        store
            .modify(&key(), mutation(|_| None))
            .await
            .expect("delete");
        assert!(store.load(&key()).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn deleted_records_leave_index_entries_for_reconciliation() {
        let (store, clock) = store_with_clock();
        let now = clock.now();
        store
            .modify(
                &key(),
                mutation(move |_| Some(ConversationBatch::new(text_message("hi", now), now))),
            )
            .await
            .expect("create");
        store
            .modify(&key(), mutation(|_| None))
            .await
            .expect("delete");
        let indexed = store.indexed_keys().await.expect("index");
        assert_eq!(indexed, vec![key().storage_key()]);
        assert!(!store.contains(&key().storage_key()).await.expect("contains"));
        assert!(store.prune_index(&key().storage_key()).await.expect("prune"));
        assert!(store.indexed_keys().await.expect("index").is_empty());
    }

    #[tokio::test]
    async fn records_expire_after_entry_ttl() {
        let (store, clock) = store_with_clock();
        let now = clock.now();
        store
            .modify(
                &key(),
                mutation(move |_| Some(ConversationBatch::new(text_message("hi", now), now))),
            )
            .await
            .expect("create");
        clock.advance(Duration::from_secs(61));
        assert!(store.load(&key()).await.expect("load").is_none());
        assert!(store.scan().await.expect("scan").is_empty());
    }

    #[tokio::test]
    async fn corrupt_record_is_reported_then_quarantined_verbatim() {
        let (store, clock) = store_with_clock();
        store.insert_raw(&key().storage_key(), "{not json");

        let err = store.load(&key()).await.expect_err("corrupt load");
        assert!(matches!(err, QueueError::CorruptEntry { ref raw, .. } if raw == "{not json"));
        let scanned = store.scan().await.expect("scan");
        assert!(matches!(scanned.as_slice(), [StoredEntry::Corrupt { .. }]));

        let now = clock.now();
        let outcome = store
            .modify(
                &key(),
                mutation(move |existing| {
                    assert!(existing.is_none());
                    Some(ConversationBatch::new(text_message("fresh", now), now))
                }),
            )
            .await
            .expect("modify over corrupt record");
        assert!(outcome.before.is_none());

        let quarantined = store.quarantined().await.expect("quarantine");
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].raw, "{not json");
        assert_eq!(
            store.load(&key()).await.expect("load").map(|b| b.messages.len()),
            Some(1)
        );
    }

    #[tokio::test]
    async fn unchanged_mutation_does_not_refresh_expiry() {
        let (store, clock) = store_with_clock();
        let now = clock.now();
        store
            .modify(
                &key(),
                mutation(move |_| Some(ConversationBatch::new(text_message("hi", now), now))),
            )
            .await
            .expect("create");
        clock.advance(Duration::from_secs(40));
        let outcome = store
            .modify(&key(), mutation(|existing| existing))
            .await
            .expect("noop");
        assert!(!outcome.changed());
        clock.advance(Duration::from_secs(30));
        assert!(store.load(&key()).await.expect("load").is_none());
    }
}
