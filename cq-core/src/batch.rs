//! Per-conversation batch record and its state transitions.
//!
//! Transitions here are pure mutations of one record; the store decides when
//! they are applied atomically.

use crate::clock::elapsed_between;
use crate::policy::is_compatible;
use crate::types::{ConversationKey, MessageId, PendingMessage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub const COMBINED_TEXT_SEPARATOR: &str = "\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Active,
    Processing,
    Cooldown,
    Expired,
}

impl BatchState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Processing => "processing",
            Self::Cooldown => "cooldown",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationBatch {
    /// Identifies one coalesced unit; renewed whenever a fresh unit starts.
    pub batch_id: Uuid,
    pub key: ConversationKey,
    pub messages: Vec<PendingMessage>,
    /// Arrivals held out of the in-flight unit: those made while `Processing`, and
    /// incompatible ones queued behind a batch that could not flush yet.
    #[serde(default)]
    pub deferred: Vec<PendingMessage>,
    pub state: BatchState,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_flushed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub flush_count: u64,
}

impl ConversationBatch {
    pub fn new(first: PendingMessage, now: DateTime<Utc>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            key: first.conversation_key.clone(),
            messages: vec![first],
            deferred: Vec::new(),
            state: BatchState::Active,
            created_at: now,
            last_updated_at: now,
            processing_started_at: None,
            attempt_count: 0,
            last_attempt_at: None,
            last_flushed_at: None,
            last_error: None,
            flush_count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.messages.len() + self.deferred.len()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.created_at, now)
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.last_updated_at, now)
    }

    pub fn last_message(&self) -> Option<&PendingMessage> {
        self.messages.iter().max_by(|a, b| {
            a.arrived_at
                .cmp(&b.arrived_at)
                .then_with(|| a.id.cmp(&b.id))
        })
    }

    /// `messages` is non-empty exactly when the batch is active or processing.
    pub fn holds_invariant(&self) -> bool {
        match self.state {
            BatchState::Active | BatchState::Processing => !self.messages.is_empty(),
            BatchState::Cooldown | BatchState::Expired => self.messages.is_empty(),
        }
    }

    pub fn push(&mut self, message: PendingMessage, now: DateTime<Utc>) {
        self.messages.push(message);
        self.last_updated_at = now;
    }

    pub fn defer(&mut self, message: PendingMessage, now: DateTime<Utc>) {
        self.deferred.push(message);
        self.last_updated_at = now;
    }

    /// Starts a new coalesced unit on an existing record (cooldown follow-up).
    pub fn reactivate(&mut self, message: PendingMessage, now: DateTime<Utc>) {
        self.batch_id = Uuid::new_v4();
        self.messages = vec![message];
        self.state = BatchState::Active;
        self.created_at = now;
        self.last_updated_at = now;
        self.processing_started_at = None;
        self.attempt_count = 0;
        self.last_attempt_at = None;
        self.last_error = None;
    }

    /// Returns false if the batch is not an active, non-empty batch.
    pub fn begin_processing(&mut self, now: DateTime<Utc>) -> bool {
        if self.state != BatchState::Active || self.messages.is_empty() {
            return false;
        }
        self.state = BatchState::Processing;
        self.processing_started_at = Some(now);
        self.last_updated_at = now;
        true
    }

    /// Successful flush: clears the processed messages and promotes deferred ones.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.messages.clear();
        self.flush_count = self.flush_count.saturating_add(1);
        self.last_flushed_at = Some(now);
        self.last_error = None;
        self.settle_after_flush(now);
    }

    /// Failed attempt: the batch returns to active with its messages intact.
    pub fn record_failure(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_attempt_at = Some(now);
        self.last_error = Some(error.into());
        self.state = BatchState::Active;
        self.processing_started_at = None;
        self.last_updated_at = now;
        self.merge_deferred();
    }

    /// True when the attempt in flight is the last one the retry budget allows.
    pub fn on_final_attempt(&self, max_attempts: u32) -> bool {
        self.attempt_count.saturating_add(1) >= max_attempts
    }

    /// Gives up on the in-flight messages. Deferred arrivals survive as a new unit.
    pub fn abandon(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> usize {
        let dropped = self.messages.len();
        self.messages.clear();
        self.last_flushed_at = Some(now);
        self.last_error = Some(reason.into());
        self.settle_after_flush(now);
        dropped
    }

    /// Orphan recovery: a processing attempt that never resolved counts as failed.
    pub fn reset_orphan(&mut self, now: DateTime<Utc>) {
        self.record_failure("processing attempt orphaned", now);
    }

    /// Messages in arrival order (ties broken by id).
    pub fn ordered_messages(&self) -> Vec<PendingMessage> {
        let mut ordered = self.messages.clone();
        sort_by_arrival(&mut ordered);
        ordered
    }

    fn settle_after_flush(&mut self, now: DateTime<Utc>) {
        self.processing_started_at = None;
        self.attempt_count = 0;
        self.last_attempt_at = None;
        self.last_updated_at = now;
        if self.deferred.is_empty() {
            self.state = BatchState::Cooldown;
            return;
        }
        self.batch_id = Uuid::new_v4();
        self.messages = std::mem::take(&mut self.deferred);
        sort_by_arrival(&mut self.messages);
        self.state = BatchState::Active;
        self.created_at = now;
    }

    /// Moves the leading deferred arrivals that fit the retried unit behind it.
    /// The first incompatible one and everything after it wait for the unit to settle.
    fn merge_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }
        sort_by_arrival(&mut self.deferred);
        let mut tail_kind = self.last_message().map(|m| m.kind);
        let mut fits = 0;
        for message in &self.deferred {
            match tail_kind {
                Some(kind) if is_compatible(kind, message.kind) => {
                    tail_kind = Some(message.kind);
                    fits += 1;
                }
                _ => break,
            }
        }
        let held = self.deferred.split_off(fits);
        let mut merged = std::mem::replace(&mut self.deferred, held);
        self.messages.append(&mut merged);
        sort_by_arrival(&mut self.messages);
    }
}

fn sort_by_arrival(messages: &mut [PendingMessage]) {
    messages.sort_by(|a, b| {
        a.arrived_at
            .cmp(&b.arrived_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// What the flush callback receives for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedBatch {
    pub conversation_key: ConversationKey,
    pub batch_id: Uuid,
    /// 1-based attempt number for this batch.
    pub attempt: u32,
    pub text: String,
    pub payloads: Vec<serde_json::Value>,
    pub message_ids: Vec<MessageId>,
    pub first_arrived_at: DateTime<Utc>,
    pub last_arrived_at: DateTime<Utc>,
}

impl CombinedBatch {
    /// None for an empty batch.
    pub fn from_batch(batch: &ConversationBatch) -> Option<Self> {
        let ordered = batch.ordered_messages();
        let first = ordered.first()?.arrived_at;
        let last = ordered.last()?.arrived_at;
        let text = ordered
            .iter()
            .map(|m| m.normalized_text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(COMBINED_TEXT_SEPARATOR);
        Some(Self {
            conversation_key: batch.key.clone(),
            batch_id: batch.batch_id,
            attempt: batch.attempt_count.saturating_add(1),
            text,
            payloads: ordered.iter().map(|m| m.raw_payload.clone()).collect(),
            message_ids: ordered.iter().map(|m| m.id.clone()).collect(),
            first_arrived_at: first,
            last_arrived_at: last,
        })
    }

    pub fn message_count(&self) -> usize {
        self.message_ids.len()
    }
}
