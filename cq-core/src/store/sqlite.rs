//! SQLite-backed store and lock table shared by every worker process that opens
//! the same database file.
//!
//! Each operation is one short transaction run on the blocking pool.
//! `BEGIN IMMEDIATE` takes the write lock up front, so read-modify-write steps
//! from concurrent processes serialize instead of interleaving.

use super::{
    BatchMutation, Modification, QuarantinedEntry, QueueStore, StoredEntry, decode_batch,
    encode_batch,
};
use crate::batch::ConversationBatch;
use crate::clock::{Clock, millis, to_chrono};
use crate::error::{QueueError, Result};
use crate::lock::{LockManager, LockRecord, ReleaseOutcome};
use crate::types::{ConversationKey, OwnerToken};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    entry_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    pub async fn open(
        path: impl AsRef<Path>,
        entry_ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        QueueError::StoreUnavailable(format!(
                            "create sqlite dir {}: {e}",
                            parent.display()
                        ))
                    })?;
                }
            }
            let conn = Connection::open(&path)?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            ensure_schema(&conn)?;
            Ok(conn)
        })
        .await??;
        Ok(Self::from_connection(conn, entry_ttl, clock))
    }

    pub fn open_in_memory(entry_ttl: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        ensure_schema(&conn)?;
        Ok(Self::from_connection(conn, entry_ttl, clock))
    }

    fn from_connection(conn: Connection, entry_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            entry_ttl,
            clock,
        }
    }

    /// Writes raw record text as-is, bypassing encoding. Used by import tooling and tests.
    pub async fn insert_raw(&self, storage_key: &str, raw: impl Into<String>) -> Result<()> {
        let storage_key = storage_key.to_string();
        let raw = raw.into();
        let now = millis(self.clock.now());
        let expires = now + to_chrono(self.entry_ttl).num_milliseconds();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
INSERT INTO cq_batches (storage_key, batch_json, updated_at_ms, expires_at_ms)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(storage_key) DO UPDATE
SET batch_json = excluded.batch_json,
    updated_at_ms = excluded.updated_at_ms,
    expires_at_ms = excluded.expires_at_ms
"#,
                params![storage_key, raw, now, expires],
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO cq_active_keys (storage_key, indexed_at_ms) VALUES (?1, ?2)",
                params![storage_key, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| QueueError::StoreUnavailable("sqlite connection poisoned".into()))?;
            f(&mut guard)
        })
        .await?
    }
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS cq_batches (
    storage_key TEXT PRIMARY KEY,
    batch_json TEXT NOT NULL,
    updated_at_ms INTEGER NOT NULL,
    expires_at_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS cq_active_keys (
    storage_key TEXT PRIMARY KEY,
    indexed_at_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS cq_locks (
    storage_key TEXT PRIMARY KEY,
    owner_token TEXT NOT NULL,
    acquired_at_ms INTEGER NOT NULL,
    renewed_at_ms INTEGER NOT NULL,
    expires_at_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS cq_quarantine (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    storage_key TEXT NOT NULL,
    raw TEXT NOT NULL,
    reason TEXT NOT NULL,
    quarantined_at_ms INTEGER NOT NULL
);
"#,
    )?;
    // Lock tables created before renewal tracking lack the column.
    let has_renewed_at = conn
        .prepare("SELECT 1 FROM pragma_table_info('cq_locks') WHERE name = 'renewed_at_ms'")?
        .exists([])?;
    if !has_renewed_at {
        conn.execute_batch(
            r#"
ALTER TABLE cq_locks ADD COLUMN renewed_at_ms INTEGER NOT NULL DEFAULT 0;
UPDATE cq_locks SET renewed_at_ms = acquired_at_ms;
"#,
        )?;
    }
    Ok(())
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[async_trait]
impl QueueStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn load(&self, key: &ConversationKey) -> Result<Option<ConversationBatch>> {
        let storage_key = key.storage_key();
        let now = millis(self.clock.now());
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT batch_json FROM cq_batches WHERE storage_key = ?1 AND expires_at_ms > ?2",
                    params![storage_key, now],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|raw| decode_batch(&storage_key, &raw)).transpose()
        })
        .await
    }

    async fn modify(&self, key: &ConversationKey, mutation: BatchMutation) -> Result<Modification> {
        let storage_key = key.storage_key();
        let now = self.clock.now();
        let now_ms = millis(now);
        let expires_ms = now_ms + to_chrono(self.entry_ttl).num_milliseconds();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let stored: Option<(String, i64)> = tx
                .query_row(
                    "SELECT batch_json, expires_at_ms FROM cq_batches WHERE storage_key = ?1",
                    params![storage_key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let existed = stored.is_some();
            let before = match stored {
                Some((raw, expires_at_ms)) if expires_at_ms > now_ms => {
                    match decode_batch(&storage_key, &raw) {
                        Ok(batch) => Some(batch),
                        Err(QueueError::CorruptEntry { raw, reason, .. }) => {
                            tracing::error!(
                                conversation_key = %storage_key,
                                %reason,
                                raw_len = raw.len(),
                                "corrupt batch record moved to quarantine"
                            );
                            tx.execute(
                                r#"
INSERT INTO cq_quarantine (storage_key, raw, reason, quarantined_at_ms)
VALUES (?1, ?2, ?3, ?4)
"#,
                                params![storage_key, raw, reason, now_ms],
                            )?;
                            None
                        }
                        Err(e) => return Err(e),
                    }
                }
                _ => None,
            };

            let after = mutation(before.clone());
            match &after {
                Some(batch) if before.as_ref() != Some(batch) => {
                    tx.execute(
                        r#"
INSERT INTO cq_batches (storage_key, batch_json, updated_at_ms, expires_at_ms)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(storage_key) DO UPDATE
SET batch_json = excluded.batch_json,
    updated_at_ms = excluded.updated_at_ms,
    expires_at_ms = excluded.expires_at_ms
"#,
                        params![storage_key, encode_batch(batch)?, now_ms, expires_ms],
                    )?;
                }
                Some(_) => {}
                None if existed => {
                    tx.execute(
                        "DELETE FROM cq_batches WHERE storage_key = ?1",
                        params![storage_key],
                    )?;
                }
                None => {}
            }
            if after.is_some() {
                tx.execute(
                    "INSERT OR IGNORE INTO cq_active_keys (storage_key, indexed_at_ms) VALUES (?1, ?2)",
                    params![storage_key, now_ms],
                )?;
            }
            tx.commit()?;
            Ok(Modification { before, after })
        })
        .await
    }

    async fn scan(&self) -> Result<Vec<StoredEntry>> {
        let now = millis(self.clock.now());
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT storage_key, batch_json FROM cq_batches WHERE expires_at_ms > ?1 ORDER BY storage_key",
            )?;
            let rows = stmt.query_map(params![now], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut entries = Vec::new();
            for row in rows {
                let (storage_key, raw) = row?;
                match decode_batch(&storage_key, &raw) {
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
        })
        .await
    }

    async fn indexed_keys(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT storage_key FROM cq_active_keys ORDER BY storage_key")?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(keys)
        })
        .await
    }

    async fn contains(&self, storage_key: &str) -> Result<bool> {
        let storage_key = storage_key.to_string();
        let now = millis(self.clock.now());
        self.with_conn(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM cq_batches WHERE storage_key = ?1 AND expires_at_ms > ?2",
                    params![storage_key, now],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn prune_index(&self, storage_key: &str) -> Result<bool> {
        let storage_key = storage_key.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM cq_active_keys WHERE storage_key = ?1",
                params![storage_key],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn quarantined(&self) -> Result<Vec<QuarantinedEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT storage_key, raw, reason, quarantined_at_ms FROM cq_quarantine ORDER BY id",
            )?;
            let entries = stmt
                .query_map([], |row| {
                    Ok(QuarantinedEntry {
                        storage_key: row.get(0)?,
                        raw: row.get(1)?,
                        reason: row.get(2)?,
                        quarantined_at: from_millis(row.get(3)?),
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(entries)
        })
        .await
    }
}

fn lock_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LockRecord> {
    Ok(LockRecord {
        storage_key: row.get(0)?,
        owner_token: OwnerToken::new(row.get::<_, String>(1)?),
        acquired_at: from_millis(row.get(2)?),
        renewed_at: from_millis(row.get(3)?),
        expires_at: from_millis(row.get(4)?),
    })
}

#[async_trait]
impl LockManager for SqliteStore {
    async fn try_acquire(
        &self,
        key: &ConversationKey,
        owner: &OwnerToken,
        ttl: Duration,
    ) -> Result<bool> {
        let storage_key = key.storage_key();
        let owner = owner.to_string();
        let now = millis(self.clock.now());
        let expires = now + to_chrono(ttl).num_milliseconds();
        self.with_conn(move |conn| {
            // The conflict branch only fires over an expired row.
            let changed = conn.execute(
                r#"
INSERT INTO cq_locks (storage_key, owner_token, acquired_at_ms, renewed_at_ms, expires_at_ms)
VALUES (?1, ?2, ?3, ?3, ?4)
ON CONFLICT(storage_key) DO UPDATE
SET owner_token = excluded.owner_token,
    acquired_at_ms = excluded.acquired_at_ms,
    renewed_at_ms = excluded.renewed_at_ms,
    expires_at_ms = excluded.expires_at_ms
WHERE cq_locks.expires_at_ms <= ?3
"#,
                params![storage_key, owner, now, expires],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn release(&self, key: &ConversationKey, owner: &OwnerToken) -> Result<ReleaseOutcome> {
        let storage_key = key.storage_key();
        let owner = owner.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let holder: Option<String> = tx
                .query_row(
                    "SELECT owner_token FROM cq_locks WHERE storage_key = ?1",
                    params![storage_key],
                    |row| row.get(0),
                )
                .optional()?;
            let outcome = match holder {
                None => ReleaseOutcome::NotHeld,
                Some(holder) if holder == owner.as_str() => {
                    tx.execute(
                        "DELETE FROM cq_locks WHERE storage_key = ?1 AND owner_token = ?2",
                        params![storage_key, holder],
                    )?;
                    ReleaseOutcome::Released
                }
                Some(holder) => {
                    tracing::warn!(
                        conversation_key = %storage_key,
                        requested_by = %owner,
                        %holder,
                        "refusing lock release from non-owner"
                    );
                    ReleaseOutcome::NotOwner {
                        holder: OwnerToken::new(holder),
                    }
                }
            };
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn extend(
        &self,
        key: &ConversationKey,
        owner: &OwnerToken,
        ttl: Duration,
    ) -> Result<bool> {
        let storage_key = key.storage_key();
        let owner = owner.to_string();
        let now = millis(self.clock.now());
        let expires = now + to_chrono(ttl).num_milliseconds();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                r#"
UPDATE cq_locks
   SET expires_at_ms = ?3,
       renewed_at_ms = ?4
 WHERE storage_key = ?1
   AND owner_token = ?2
   AND expires_at_ms > ?4
"#,
                params![storage_key, owner, expires, now],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn holder(&self, key: &ConversationKey) -> Result<Option<LockRecord>> {
        let storage_key = key.storage_key();
        let now = millis(self.clock.now());
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    r#"
SELECT storage_key, owner_token, acquired_at_ms, renewed_at_ms, expires_at_ms
  FROM cq_locks
 WHERE storage_key = ?1
   AND expires_at_ms > ?2
"#,
                    params![storage_key, now],
                    lock_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<LockRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT storage_key, owner_token, acquired_at_ms, renewed_at_ms, expires_at_ms FROM cq_locks ORDER BY storage_key",
            )?;
            let locks = stmt
                .query_map([], lock_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(locks)
        })
        .await
    }

    async fn force_release(&self, storage_key: &str, owner: &OwnerToken) -> Result<bool> {
        let storage_key = storage_key.to_string();
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM cq_locks WHERE storage_key = ?1 AND owner_token = ?2",
                params![storage_key, owner],
            )?;
            Ok(removed > 0)
        })
        .await
    }
}
