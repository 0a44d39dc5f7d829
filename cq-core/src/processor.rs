//! Flush state machine: lock, re-read, process, resolve, release.

use crate::batch::{BatchState, CombinedBatch, ConversationBatch};
use crate::clock::Clock;
use crate::config::BufferConfig;
use crate::error::{ProcessError, Result};
use crate::health::{AttemptOutcome, ProcessingStats, ProcessingStatsSnapshot};
use crate::lock::{LockManager, ReleaseOutcome};
use crate::policy::{NextAction, backoff_delay, next_action};
use crate::scheduler::DebounceScheduler;
use crate::store::{QueueStore, mutation};
use crate::types::{ConversationKey, OwnerToken};
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// Downstream collaborator that handles one combined batch.
///
/// May be invoked twice for the same `(batch_id, attempt)` if a worker loses its
/// lock mid-call; implementations should deduplicate on that pair.
#[async_trait]
pub trait FlushHandler: Send + Sync {
    async fn process(&self, batch: &CombinedBatch) -> std::result::Result<(), ProcessError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum FlushOutcome {
    /// Another worker holds the conversation lock.
    Contended,
    NothingToFlush,
    Completed {
        batch_id: Uuid,
        attempt: u32,
        message_count: usize,
    },
    Rescheduled {
        batch_id: Uuid,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    Abandoned {
        batch_id: Uuid,
        dropped: usize,
        reason: String,
    },
    /// The record changed under us (lock lost and the batch was repaired elsewhere).
    Superseded { batch_id: Uuid },
}

impl FlushOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Contended => "contended",
            Self::NothingToFlush => "nothing_to_flush",
            Self::Completed { .. } => "completed",
            Self::Rescheduled { .. } => "rescheduled",
            Self::Abandoned { .. } => "abandoned",
            Self::Superseded { .. } => "superseded",
        }
    }
}

pub struct Processor {
    cfg: BufferConfig,
    store: Arc<dyn QueueStore>,
    locks: Arc<dyn LockManager>,
    handler: Arc<dyn FlushHandler>,
    scheduler: Arc<dyn DebounceScheduler>,
    clock: Arc<dyn Clock>,
    stats: Arc<RwLock<ProcessingStats>>,
}

impl Processor {
    pub fn new(
        cfg: BufferConfig,
        store: Arc<dyn QueueStore>,
        locks: Arc<dyn LockManager>,
        handler: Arc<dyn FlushHandler>,
        scheduler: Arc<dyn DebounceScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cfg,
            store,
            locks,
            handler,
            scheduler,
            clock,
            stats: Arc::new(RwLock::new(ProcessingStats::default())),
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.cfg
    }

    pub async fn stats_snapshot(&self) -> ProcessingStatsSnapshot {
        self.stats.read().await.snapshot()
    }

    /// Flushes the key now if its batch is active, ignoring the debounce wait.
    ///
    /// Lock contention is a normal outcome, not an error.
    #[tracing::instrument(level = "debug", skip_all, fields(conversation_key = %key))]
    pub async fn flush(&self, key: &ConversationKey) -> Result<FlushOutcome> {
        let owner = OwnerToken::generate();
        if !self.locks.try_acquire(key, &owner, self.cfg.lock_ttl).await? {
            tracing::debug!("flush skipped: lock held by another worker");
            self.stats.write().await.record_contention();
            return Ok(FlushOutcome::Contended);
        }

        let result = self.flush_locked(key, &owner).await;

        match self.locks.release(key, &owner).await {
            Ok(ReleaseOutcome::Released) => {}
            Ok(ReleaseOutcome::NotHeld) => {
                tracing::warn!("lock expired before release; another worker may have taken over");
            }
            Ok(ReleaseOutcome::NotOwner { holder }) => {
                tracing::warn!(%holder, "lock taken over during flush");
            }
            Err(error) => {
                tracing::warn!(%error, "lock release failed; ttl will reclaim it");
            }
        }
        result
    }

    async fn flush_locked(&self, key: &ConversationKey, owner: &OwnerToken) -> Result<FlushOutcome> {
        let now = self.clock.now();
        let max_attempts = self.cfg.max_attempts;
        // Read-after-lock: anything appended before this point joins the attempt.
        let started = self
            .store
            .modify(
                key,
                mutation(move |existing| {
                    let mut batch = existing?;
                    if batch.state == BatchState::Active
                        && !batch.is_empty()
                        && batch.attempt_count >= max_attempts
                    {
                        batch.abandon("retry budget exhausted", now);
                    } else {
                        batch.begin_processing(now);
                    }
                    Some(batch)
                }),
            )
            .await?;

        let (Some(before), Some(after)) = (started.before, started.after) else {
            return Ok(FlushOutcome::NothingToFlush);
        };
        if before.state != BatchState::Active || before.is_empty() {
            return Ok(FlushOutcome::NothingToFlush);
        }
        if after.state != BatchState::Processing {
            let dropped = before.messages.len();
            self.note_abandoned(key, &before, dropped, "retry budget exhausted")
                .await;
            self.schedule_follow_up(key, &after).await;
            return Ok(FlushOutcome::Abandoned {
                batch_id: before.batch_id,
                dropped,
                reason: "retry budget exhausted".to_string(),
            });
        }

        if let Err(error) = self.scheduler.cancel(key).await {
            tracing::debug!(%error, "debounce cancel failed");
        }

        let Some(combined) = CombinedBatch::from_batch(&after) else {
            return Ok(FlushOutcome::NothingToFlush);
        };
        tracing::info!(
            batch_id = %combined.batch_id,
            attempt = combined.attempt,
            messages = combined.message_count(),
            "flushing batch"
        );

        let result = self.run_handler(key, owner, &combined).await;
        self.resolve(key, &after, &combined, result).await
    }

    /// Runs the handler, renewing the lock every `lock_ttl / 3` until it returns.
    async fn run_handler(
        &self,
        key: &ConversationKey,
        owner: &OwnerToken,
        combined: &CombinedBatch,
    ) -> std::result::Result<(), ProcessError> {
        let call = AssertUnwindSafe(self.handler.process(combined)).catch_unwind();
        tokio::pin!(call);

        let period = self.cfg.lock_renew_interval();
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut call => {
                    return match result {
                        Ok(result) => result,
                        Err(payload) => {
                            let message = panic_payload_to_string(payload.as_ref());
                            tracing::error!(panic = %message, "flush handler panicked");
                            Err(ProcessError::Retryable(format!("flush handler panicked: {message}")))
                        }
                    };
                }
                _ = renew.tick() => {
                    match self.locks.extend(key, owner, self.cfg.lock_ttl).await {
                        Ok(true) => tracing::trace!("lock renewed"),
                        Ok(false) => tracing::warn!(
                            batch_id = %combined.batch_id,
                            "lock lost while handler is running; a second worker may process this batch"
                        ),
                        Err(error) => tracing::warn!(%error, "lock renewal failed"),
                    }
                }
            }
        }
    }

    async fn resolve(
        &self,
        key: &ConversationKey,
        in_flight: &ConversationBatch,
        combined: &CombinedBatch,
        result: std::result::Result<(), ProcessError>,
    ) -> Result<FlushOutcome> {
        let now = self.clock.now();
        let batch_id = in_flight.batch_id;
        let started_at = in_flight.processing_started_at;
        let attempt = combined.attempt;
        let max_attempts = self.cfg.max_attempts;
        let failure = result.clone().err();

        let resolved = self
            .store
            .modify(
                key,
                mutation(move |existing| {
                    let mut batch = existing?;
                    if batch.batch_id != batch_id
                        || batch.state != BatchState::Processing
                        || batch.processing_started_at != started_at
                    {
                        return Some(batch);
                    }
                    match failure {
                        None => batch.complete(now),
                        Some(ProcessError::Fatal(message)) => {
                            batch.abandon(format!("fatal: {message}"), now);
                        }
                        Some(ProcessError::Retryable(message)) if batch.on_final_attempt(max_attempts) => {
                            batch.abandon(format!("retries exhausted: {message}"), now);
                        }
                        Some(ProcessError::Retryable(message)) => {
                            batch.record_failure(message, now);
                        }
                    }
                    Some(batch)
                }),
            )
            .await?;

        let applied = resolved.before.as_ref().is_some_and(|b| {
            b.batch_id == batch_id
                && b.state == BatchState::Processing
                && b.processing_started_at == started_at
        });
        if !applied {
            tracing::warn!(%batch_id, "batch changed while processing; result not applied");
            return Ok(FlushOutcome::Superseded { batch_id });
        }
        let Some(after) = resolved.after else {
            return Ok(FlushOutcome::Superseded { batch_id });
        };

        let outcome = match result {
            Ok(()) => {
                tracing::info!(%batch_id, attempt, "batch processed");
                let mut stats = self.stats.write().await;
                stats.record(AttemptOutcome::Success, now);
                stats.record_delivered(combined.message_count());
                FlushOutcome::Completed {
                    batch_id,
                    attempt,
                    message_count: combined.message_count(),
                }
            }
            Err(ProcessError::Fatal(message)) => {
                tracing::error!(%batch_id, attempt, error = %message, "fatal processing failure; batch abandoned");
                let dropped = combined.message_count();
                {
                    let mut stats = self.stats.write().await;
                    stats.record(AttemptOutcome::Fatal, now);
                    stats.record_dropped(dropped);
                    stats.record_error(message.clone());
                }
                FlushOutcome::Abandoned {
                    batch_id,
                    dropped,
                    reason: format!("fatal: {message}"),
                }
            }
            Err(ProcessError::Retryable(message)) if attempt >= max_attempts => {
                let dropped = combined.message_count();
                self.note_abandoned(key, in_flight, dropped, &message).await;
                self.stats.write().await.record_error(message.clone());
                FlushOutcome::Abandoned {
                    batch_id,
                    dropped,
                    reason: format!("retries exhausted: {message}"),
                }
            }
            Err(ProcessError::Retryable(message)) => {
                let delay = backoff_delay(attempt, &self.cfg);
                tracing::warn!(
                    %batch_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "processing failed; retry scheduled"
                );
                {
                    let mut stats = self.stats.write().await;
                    stats.record(AttemptOutcome::Retry, now);
                    stats.record_error(message.clone());
                }
                FlushOutcome::Rescheduled {
                    batch_id,
                    attempt,
                    delay_ms: delay.as_millis().min(u64::MAX as u128) as u64,
                    error: message,
                }
            }
        };

        self.schedule_follow_up(key, &after).await;
        Ok(outcome)
    }

    async fn note_abandoned(
        &self,
        key: &ConversationKey,
        batch: &ConversationBatch,
        dropped: usize,
        reason: &str,
    ) {
        tracing::error!(
            conversation_key = %key,
            batch_id = %batch.batch_id,
            dropped,
            %reason,
            "batch abandoned after exhausting retries"
        );
        let now = self.clock.now();
        let mut stats = self.stats.write().await;
        stats.record(AttemptOutcome::Abandoned, now);
        stats.record_dropped(dropped);
    }

    /// Arms the scheduler for whatever the batch needs next. Failures are logged;
    /// the recovery sweep resumes overdue batches.
    pub async fn schedule_follow_up(&self, key: &ConversationKey, batch: &ConversationBatch) {
        let delay = match next_action(batch, &self.cfg, self.clock.now()) {
            NextAction::Reschedule(delay) => delay,
            NextAction::Flush | NextAction::Abandon => Duration::ZERO,
            NextAction::Idle => return,
        };
        if let Err(error) = self.scheduler.schedule(key, delay).await {
            tracing::warn!(conversation_key = %key, %error, "follow-up scheduling failed");
        }
    }
}

pub(crate) fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "non-string panic payload".to_string()
}
