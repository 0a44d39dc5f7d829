//! Per-conversation mutual exclusion: set-if-absent with expiry and an owner token.
//!
//! Expiry is the only protection against a crashed owner; release and renewal
//! always check the token so one worker can never drop another worker's lock.

use crate::clock::{Clock, elapsed_between, to_chrono};
use crate::error::Result;
use crate::types::{ConversationKey, OwnerToken};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockRecord {
    pub storage_key: String,
    pub owner_token: OwnerToken,
    pub acquired_at: DateTime<Utc>,
    /// Last acquire or successful `extend`.
    pub renewed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn unrenewed_for(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.renewed_at, now)
    }

    /// Expired, or its owner stopped renewing it for at least `threshold`.
    /// A lock renewed on schedule is never stuck, however long it is held.
    pub fn is_stuck(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.is_expired(now) || self.unrenewed_for(now) >= threshold
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ReleaseOutcome {
    Released,
    NotHeld,
    /// Refused: the lock belongs to someone else and stays in place.
    NotOwner { holder: OwnerToken },
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Returns false when someone else holds an unexpired lock. That is not an error.
    async fn try_acquire(
        &self,
        key: &ConversationKey,
        owner: &OwnerToken,
        ttl: Duration,
    ) -> Result<bool>;

    async fn release(&self, key: &ConversationKey, owner: &OwnerToken) -> Result<ReleaseOutcome>;

    /// Pushes expiry to `now + ttl` if `owner` still holds an unexpired lock.
    async fn extend(&self, key: &ConversationKey, owner: &OwnerToken, ttl: Duration)
    -> Result<bool>;

    /// Current unexpired holder.
    async fn holder(&self, key: &ConversationKey) -> Result<Option<LockRecord>>;

    /// Every stored lock row, expired rows included.
    async fn list(&self) -> Result<Vec<LockRecord>>;

    /// Deletes the lock only if it still carries `owner`, so a fresh holder is never dropped.
    async fn force_release(&self, storage_key: &str, owner: &OwnerToken) -> Result<bool>;
}

pub struct MemoryLockManager {
    locks: DashMap<String, LockRecord>,
    clock: Arc<dyn Clock>,
}

impl MemoryLockManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            locks: DashMap::new(),
            clock,
        }
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn try_acquire(
        &self,
        key: &ConversationKey,
        owner: &OwnerToken,
        ttl: Duration,
    ) -> Result<bool> {
        let now = self.clock.now();
        let record = LockRecord {
            storage_key: key.storage_key(),
            owner_token: owner.clone(),
            acquired_at: now,
            renewed_at: now,
            expires_at: now + to_chrono(ttl),
        };
        match self.locks.entry(key.storage_key()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(now) {
                    return Ok(false);
                }
                tracing::debug!(
                    conversation_key = %key,
                    previous_owner = %occupied.get().owner_token,
                    "taking over expired lock"
                );
                occupied.insert(record);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &ConversationKey, owner: &OwnerToken) -> Result<ReleaseOutcome> {
        match self.locks.entry(key.storage_key()) {
            Entry::Occupied(occupied) => {
                if occupied.get().owner_token != *owner {
                    let holder = occupied.get().owner_token.clone();
                    tracing::warn!(
                        conversation_key = %key,
                        requested_by = %owner,
                        %holder,
                        "refusing lock release from non-owner"
                    );
                    return Ok(ReleaseOutcome::NotOwner { holder });
                }
                occupied.remove();
                Ok(ReleaseOutcome::Released)
            }
            Entry::Vacant(_) => Ok(ReleaseOutcome::NotHeld),
        }
    }

    async fn extend(
        &self,
        key: &ConversationKey,
        owner: &OwnerToken,
        ttl: Duration,
    ) -> Result<bool> {
        let now = self.clock.now();
        let Some(mut record) = self.locks.get_mut(&key.storage_key()) else {
            return Ok(false);
        };
        if record.owner_token != *owner || record.is_expired(now) {
            return Ok(false);
        }
        record.renewed_at = now;
        record.expires_at = now + to_chrono(ttl);
        Ok(true)
    }

    async fn holder(&self, key: &ConversationKey) -> Result<Option<LockRecord>> {
        let now = self.clock.now();
        Ok(self
            .locks
            .get(&key.storage_key())
            .filter(|record| !record.is_expired(now))
            .map(|record| record.clone()))
    }

    async fn list(&self) -> Result<Vec<LockRecord>> {
        Ok(self.locks.iter().map(|e| e.value().clone()).collect())
    }

    async fn force_release(&self, storage_key: &str, owner: &OwnerToken) -> Result<bool> {
        Ok(self
            .locks
            .remove_if(storage_key, |_, record| record.owner_token == *owner)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn key() -> ConversationKey {
        ConversationKey::new("telegram", "42")
    }

    fn manager() -> (MemoryLockManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (MemoryLockManager::new(clock.clone()), clock)
    }

    #[tokio::test]
    async fn second_owner_is_refused_while_lock_is_held() {
        let (locks, _) = manager();
        let a = OwnerToken::generate();
        let b = OwnerToken::generate();
        let ttl = Duration::from_secs(30);
        assert!(locks.try_acquire(&key(), &a, ttl).await.expect("acquire a"));
        assert!(!locks.try_acquire(&key(), &b, ttl).await.expect("acquire b"));
        assert!(!locks.try_acquire(&key(), &a, ttl).await.expect("reacquire a"));
    }

    #[tokio::test]
    async fn abandoned_lock_becomes_acquirable_only_after_ttl() {
        let (locks, clock) = manager();
        let crashed = OwnerToken::generate();
        let next = OwnerToken::generate();
        let ttl = Duration::from_secs(30);
        assert!(locks.try_acquire(&key(), &crashed, ttl).await.expect("acquire"));

        clock.advance(Duration::from_secs(29));
        assert!(!locks.try_acquire(&key(), &next, ttl).await.expect("early"));

        clock.advance(Duration::from_secs(1));
        assert!(locks.try_acquire(&key(), &next, ttl).await.expect("after ttl"));
        let holder = locks.holder(&key()).await.expect("holder").expect("held");
        assert_eq!(holder.owner_token, next);
    }

    #[tokio::test]
    async fn release_by_non_owner_is_refused_and_lock_survives() {
        let (locks, _) = manager();
        let owner = OwnerToken::generate();
        let intruder = OwnerToken::generate();
        assert!(
            locks
                .try_acquire(&key(), &owner, Duration::from_secs(30))
                .await
                .expect("acquire")
        );
        let outcome = locks.release(&key(), &intruder).await.expect("release");
        assert_eq!(
            outcome,
            ReleaseOutcome::NotOwner {
                holder: owner.clone()
            }
        );
        assert!(locks.holder(&key()).await.expect("holder").is_some());
        assert_eq!(
            locks.release(&key(), &owner).await.expect("release"),
            ReleaseOutcome::Released
        );
        assert_eq!(
            locks.release(&key(), &owner).await.expect("release"),
            ReleaseOutcome::NotHeld
        );
    }

    #[tokio::test]
    async fn extend_only_applies_to_live_owner() {
        let (locks, clock) = manager();
        let owner = OwnerToken::generate();
        let other = OwnerToken::generate();
        let ttl = Duration::from_secs(10);
        assert!(locks.try_acquire(&key(), &owner, ttl).await.expect("acquire"));
        clock.advance(Duration::from_secs(8));
        assert!(locks.extend(&key(), &owner, ttl).await.expect("extend"));
        assert!(!locks.extend(&key(), &other, ttl).await.expect("extend other"));
        clock.advance(Duration::from_secs(8));
        assert!(locks.holder(&key()).await.expect("holder").is_some());
        clock.advance(Duration::from_secs(3));
        assert!(!locks.extend(&key(), &owner, ttl).await.expect("extend expired"));
    }

    #[tokio::test]
    async fn renewal_keeps_a_long_held_lock_from_looking_stuck() {
        let (locks, clock) = manager();
        let owner = OwnerToken::generate();
        let ttl = Duration::from_secs(30);
        let threshold = Duration::from_secs(60);
        assert!(locks.try_acquire(&key(), &owner, ttl).await.expect("acquire"));
        for _ in 0..10 {
            clock.advance(Duration::from_secs(10));
            assert!(locks.extend(&key(), &owner, ttl).await.expect("extend"));
        }
        let now = clock.now();
        let record = locks.holder(&key()).await.expect("holder").expect("held");
        assert_eq!(record.renewed_at, now);
        assert_eq!(record.unrenewed_for(now), Duration::ZERO);
        assert!(record.acquired_at < record.renewed_at);
        assert!(!record.is_stuck(now, threshold));
        let later = now + to_chrono(threshold);
        assert!(record.is_stuck(later, threshold));
    }

    #[tokio::test]
    async fn force_release_checks_owner_token() {
        let (locks, _) = manager();
        let owner = OwnerToken::generate();
        assert!(
            locks
                .try_acquire(&key(), &owner, Duration::from_secs(30))
                .await
                .expect("acquire")
        );
        let stale = OwnerToken::generate();
        assert!(
            !locks
                .force_release(&key().storage_key(), &stale)
                .await
                .expect("force stale")
        );
        assert!(
            locks
                .force_release(&key().storage_key(), &owner)
                .await
                .expect("force owner")
        );
        assert!(locks.list().await.expect("list").is_empty());
    }
}
