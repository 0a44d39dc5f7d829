//! Per-key single-shot timers that ask the buffer to re-evaluate a conversation.
//!
//! A scheduled key only means "check again at this time". The check itself
//! re-reads the store and decides, so a stale or duplicated firing is harmless.

use crate::error::Result;
use crate::types::ConversationKey;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

#[async_trait]
pub trait DebounceScheduler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Arms (or re-arms) the key's timer. Replaces any timer already pending for the key.
    async fn schedule(&self, key: &ConversationKey, delay: Duration) -> Result<()>;

    async fn cancel(&self, key: &ConversationKey) -> Result<()>;
}

struct ArmedTimer {
    generation: u64,
    handle: AbortHandle,
}

/// In-process timers. Due keys are delivered on the channel returned by [`TimerScheduler::new`].
pub struct TimerScheduler {
    timers: Arc<DashMap<String, ArmedTimer>>,
    generation: AtomicU64,
    due_tx: mpsc::UnboundedSender<ConversationKey>,
}

impl TimerScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConversationKey>) {
        let (due_tx, due_rx) = mpsc::unbounded_channel();
        (
            Self {
                timers: Arc::new(DashMap::new()),
                generation: AtomicU64::new(0),
                due_tx,
            },
            due_rx,
        )
    }

    pub fn armed(&self) -> usize {
        self.timers.len()
    }

    pub fn is_armed(&self, key: &ConversationKey) -> bool {
        self.timers.contains_key(&key.storage_key())
    }

    pub fn shutdown(&self) {
        let keys: Vec<String> = self.timers.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, timer)) = self.timers.remove(&key) {
                timer.handle.abort();
            }
        }
    }

    fn spawn_timer(&self, key: ConversationKey, delay: Duration, generation: u64) -> AbortHandle {
        let timers = Arc::clone(&self.timers);
        let due_tx = self.due_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            timers.remove_if(&key.storage_key(), |_, timer| timer.generation == generation);
            tracing::trace!(conversation_key = %key, "debounce timer fired");
            if due_tx.send(key).is_err() {
                tracing::debug!("debounce receiver closed; dropping due key");
            }
        });
        handle.abort_handle()
    }
}

#[async_trait]
impl DebounceScheduler for TimerScheduler {
    fn name(&self) -> &'static str {
        "timer"
    }

    async fn schedule(&self, key: &ConversationKey, delay: Duration) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        // Spawned while the entry guard is held, so the timer cannot clear a newer entry.
        match self.timers.entry(key.storage_key()) {
            Entry::Occupied(mut occupied) => {
                occupied.get().handle.abort();
                let handle = self.spawn_timer(key.clone(), delay, generation);
                occupied.insert(ArmedTimer { generation, handle });
            }
            Entry::Vacant(vacant) => {
                let handle = self.spawn_timer(key.clone(), delay, generation);
                vacant.insert(ArmedTimer { generation, handle });
            }
        }
        tracing::trace!(conversation_key = %key, delay_ms = delay.as_millis() as u64, "debounce timer armed");
        Ok(())
    }

    async fn cancel(&self, key: &ConversationKey) -> Result<()> {
        if let Some((_, timer)) = self.timers.remove(&key.storage_key()) {
            timer.handle.abort();
        }
        Ok(())
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
