//! Periodic repair sweep and health reporting.
//!
//! Every repair is a single-key conditional update: the mutation re-checks the
//! condition that selected the record, so a batch that moved on since the scan
//! is left alone.

use crate::batch::{BatchState, ConversationBatch};
use crate::clock::{Clock, elapsed_between};
use crate::config::{BufferConfig, RecoveryConfig};
use crate::error::{QueueError, Result};
use crate::health::{
    HealthSnapshot, RecoveryEvent, RecoveryEventKind, StoreSummary, evaluate_queue_health,
    queue_health_status_label,
};
use crate::lock::LockManager;
use crate::policy::{NextAction, next_action};
use crate::processor::{FlushOutcome, Processor};
use crate::store::{QueueStore, StoredEntry, mutation};
use crate::types::ConversationKey;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed_locks: usize,
    pub removed_orphans: usize,
    pub abandoned_orphans: usize,
    pub quarantined_corrupt: usize,
    pub expired_cooldown: usize,
    pub pruned_index: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmergencyReport {
    pub removed_keys: Vec<String>,
    pub dropped_messages: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    #[serde(flatten)]
    pub cleanup: CleanupReport,
    pub emergency: EmergencyReport,
    pub aged_flushes: usize,
    pub resumed_overdue: usize,
}

#[derive(Debug, Clone, Default)]
struct RecoveryStatus {
    sweeps_total: u64,
    last_sweep_at: Option<DateTime<Utc>>,
    last_sweep_error: Option<String>,
    emergency_expired_total: u64,
    recent_events: VecDeque<RecoveryEvent>,
}

pub struct RecoveryMonitor {
    buffer_cfg: BufferConfig,
    cfg: RecoveryConfig,
    store: Arc<dyn QueueStore>,
    locks: Arc<dyn LockManager>,
    processor: Arc<Processor>,
    clock: Arc<dyn Clock>,
    state: Arc<RwLock<RecoveryStatus>>,
    shutdown: CancellationToken,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RecoveryMonitor {
    pub fn new(
        cfg: RecoveryConfig,
        store: Arc<dyn QueueStore>,
        locks: Arc<dyn LockManager>,
        processor: Arc<Processor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            buffer_cfg: processor.config().clone(),
            cfg,
            store,
            locks,
            processor,
            clock,
            state: Arc::new(RwLock::new(RecoveryStatus::default())),
            shutdown: CancellationToken::new(),
            task_handle: Mutex::new(None),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        let mut task_handle = self.task_handle.lock().await;
        if task_handle.is_some() {
            return;
        }
        let monitor = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        *task_handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.cfg.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = monitor.sweep().await {
                            tracing::warn!(%error, "recovery sweep failed");
                        }
                    }
                }
            }
        }));
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.task_handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                tracing::warn!(?error, "recovery monitor shutdown join failed");
            }
        }
    }

    /// One full pass: repairs, emergency expiry, then flushes of overdue batches.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn sweep(&self) -> Result<SweepReport> {
        let result = self.sweep_inner().await;
        let mut state = self.state.write().await;
        state.sweeps_total += 1;
        state.last_sweep_at = Some(self.clock.now());
        state.last_sweep_error = result.as_ref().err().map(|e| e.to_string());
        result
    }

    async fn sweep_inner(&self) -> Result<SweepReport> {
        let cleanup = self.cleanup().await?;
        let emergency = self.emergency_cleanup().await?;
        let (aged_flushes, resumed_overdue) = self.flush_overdue().await?;
        let report = SweepReport {
            cleanup,
            emergency,
            aged_flushes,
            resumed_overdue,
        };
        if report != SweepReport::default() {
            tracing::info!(?report, "recovery sweep repaired state");
        }
        Ok(report)
    }

    /// Releases stuck locks, repairs orphans, quarantines corrupt records,
    /// expires idle cooldown batches and prunes dead index entries.
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let mut report = CleanupReport {
            removed_locks: self.release_stuck_locks().await?,
            ..CleanupReport::default()
        };

        for entry in self.store.scan().await? {
            match entry {
                StoredEntry::Batch(batch) => match batch.state {
                    BatchState::Processing => match self.repair_orphan(&batch).await? {
                        Some(OrphanRepair::Reset) => report.removed_orphans += 1,
                        Some(OrphanRepair::Abandoned) => report.abandoned_orphans += 1,
                        None => {}
                    },
                    BatchState::Cooldown | BatchState::Expired => {
                        if self.expire_cooldown(&batch).await? {
                            report.expired_cooldown += 1;
                        }
                    }
                    BatchState::Active => {}
                },
                StoredEntry::Corrupt {
                    storage_key,
                    reason,
                    ..
                } => {
                    if self.quarantine(&storage_key, &reason).await? {
                        report.quarantined_corrupt += 1;
                    }
                }
            }
        }

        report.pruned_index = self.prune_dead_index().await?;
        Ok(report)
    }

    /// Removes every conversation idle past the emergency threshold, pending messages included.
    pub async fn emergency_cleanup(&self) -> Result<EmergencyReport> {
        let mut report = EmergencyReport::default();
        for entry in self.store.scan().await? {
            let StoredEntry::Batch(batch) = entry else {
                continue;
            };
            let now = self.clock.now();
            if batch.idle_for(now) < self.cfg.emergency_threshold {
                continue;
            }
            let threshold = self.cfg.emergency_threshold;
            let removed = self
                .store
                .modify(
                    &batch.key,
                    mutation(move |existing| {
                        let current = existing?;
                        if current.idle_for(now) >= threshold {
                            None
                        } else {
                            Some(current)
                        }
                    }),
                )
                .await?;
            let (Some(before), None) = (removed.before, removed.after) else {
                continue;
            };
            let dropped = before.pending_count();
            tracing::warn!(
                conversation_key = %before.key,
                batch_id = %before.batch_id,
                state = before.state.label(),
                dropped,
                idle_secs = before.idle_for(now).as_secs(),
                "emergency expiry removed inactive conversation"
            );
            report.removed_keys.push(before.key.storage_key());
            report.dropped_messages += dropped;
            self.record_event(
                RecoveryEventKind::EmergencyExpired,
                &before.key.storage_key(),
                format!("state={} dropped={dropped}", before.state.label()),
            )
            .await;
            self.state.write().await.emergency_expired_total += 1;
        }
        Ok(report)
    }

    pub async fn health(&self) -> Result<HealthSnapshot> {
        let now = self.clock.now();
        let mut summary = StoreSummary::default();
        for entry in self.store.scan().await? {
            match entry {
                StoredEntry::Batch(batch) => summary.observe_batch(&batch, now, &self.cfg),
                StoredEntry::Corrupt { .. } => summary.corrupt_entries += 1,
            }
        }
        for lock in self.locks.list().await? {
            summary.observe_lock(&lock, now, &self.cfg);
        }
        let indexed_keys = self.store.indexed_keys().await?.len();
        let quarantined_entries = self.store.quarantined().await?.len();
        let processing = self.processor.stats_snapshot().await;

        let state = self.state.read().await;
        let health = evaluate_queue_health(&summary, &processing, state.last_sweep_error.as_deref());
        Ok(HealthSnapshot {
            status: queue_health_status_label(health),
            health,
            generated_at: now,
            store_backend: self.store.backend(),
            summary,
            indexed_keys,
            quarantined_entries,
            processing,
            emergency_expired_total: state.emergency_expired_total,
            sweeps_total: state.sweeps_total,
            last_sweep_at: state.last_sweep_at,
            last_sweep_error: state.last_sweep_error.clone(),
            recent_events: state.recent_events.iter().cloned().collect(),
        })
    }

    async fn release_stuck_locks(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut released = 0;
        for lock in self.locks.list().await? {
            if !lock.is_stuck(now, self.cfg.stuck_lock_threshold) {
                continue;
            }
            let expired = lock.is_expired(now);
            if !self
                .locks
                .force_release(&lock.storage_key, &lock.owner_token)
                .await?
            {
                continue;
            }
            released += 1;
            if expired {
                tracing::debug!(conversation_key = %lock.storage_key, "expired lock row removed");
                continue;
            }
            let held_for = elapsed_between(lock.acquired_at, now);
            let unrenewed_for = lock.unrenewed_for(now);
            tracing::warn!(
                conversation_key = %lock.storage_key,
                owner = %lock.owner_token,
                held_secs = held_for.as_secs(),
                unrenewed_secs = unrenewed_for.as_secs(),
                "stuck lock force-released"
            );
            self.record_event(
                RecoveryEventKind::StuckLockReleased,
                &lock.storage_key,
                format!("held {}s, not renewed for {}s", held_for.as_secs(), unrenewed_for.as_secs()),
            )
            .await;
        }
        Ok(released)
    }

    async fn repair_orphan(&self, batch: &ConversationBatch) -> Result<Option<OrphanRepair>> {
        let now = self.clock.now();
        let threshold = self.cfg.stuck_processing_threshold;
        let stuck = batch
            .processing_started_at
            .map(|started| elapsed_between(started, now) >= threshold)
            .unwrap_or(true);
        if !stuck {
            return Ok(None);
        }
        // A lock that is still being renewed means its worker is alive; leave it be.
        if let Some(holder) = self.locks.holder(&batch.key).await? {
            if !holder.is_stuck(now, self.cfg.stuck_lock_threshold) {
                return Ok(None);
            }
        }

        let batch_id = batch.batch_id;
        let started_at = batch.processing_started_at;
        let max_attempts = self.buffer_cfg.max_attempts;
        let repaired = self
            .store
            .modify(
                &batch.key,
                mutation(move |existing| {
                    let mut current = existing?;
                    if current.batch_id != batch_id
                        || current.state != BatchState::Processing
                        || current.processing_started_at != started_at
                    {
                        return Some(current);
                    }
                    if current.on_final_attempt(max_attempts) {
                        current.abandon("orphaned after final attempt", now);
                    } else {
                        current.reset_orphan(now);
                    }
                    Some(current)
                }),
            )
            .await?;
        if !repaired.changed() {
            return Ok(None);
        }
        let Some(after) = repaired.after else {
            return Ok(None);
        };
        let key = batch.key.storage_key();
        let attempts = batch.attempt_count.saturating_add(1);
        let outcome = if attempts >= max_attempts {
            tracing::warn!(
                conversation_key = %key,
                %batch_id,
                attempts,
                dropped = batch.messages.len(),
                "orphaned batch abandoned after final attempt"
            );
            self.record_event(
                RecoveryEventKind::OrphanAbandoned,
                &key,
                format!("attempts={attempts} dropped={}", batch.messages.len()),
            )
            .await;
            OrphanRepair::Abandoned
        } else {
            tracing::warn!(conversation_key = %key, %batch_id, attempts, "orphaned batch reset for retry");
            self.record_event(
                RecoveryEventKind::OrphanReset,
                &key,
                format!("attempts={attempts}"),
            )
            .await;
            OrphanRepair::Reset
        };
        self.processor.schedule_follow_up(&batch.key, &after).await;
        Ok(Some(outcome))
    }

    async fn expire_cooldown(&self, batch: &ConversationBatch) -> Result<bool> {
        let now = self.clock.now();
        let retention = self.cfg.cooldown_retention;
        if !batch.is_empty() || !batch.deferred.is_empty() || batch.idle_for(now) < retention {
            return Ok(false);
        }
        let removed = self
            .store
            .modify(
                &batch.key,
                mutation(move |existing| {
                    let current = existing?;
                    let idle_cooldown = matches!(current.state, BatchState::Cooldown | BatchState::Expired)
                        && current.is_empty()
                        && current.deferred.is_empty()
                        && current.idle_for(now) >= retention;
                    if idle_cooldown { None } else { Some(current) }
                }),
            )
            .await?;
        let expired = removed.before.is_some() && removed.after.is_none();
        if expired {
            tracing::info!(conversation_key = %batch.key, "idle cooldown batch expired");
            self.record_event(
                RecoveryEventKind::CooldownExpired,
                &batch.key.storage_key(),
                format!("flush_count={}", batch.flush_count),
            )
            .await;
        }
        Ok(expired)
    }

    /// A write through `modify` moves the undecodable record to quarantine verbatim.
    async fn quarantine(&self, storage_key: &str, reason: &str) -> Result<bool> {
        let key = match ConversationKey::parse(storage_key) {
            Ok(key) => key,
            Err(error) => {
                tracing::error!(%storage_key, %error, "corrupt record under unparseable key left in place");
                return Ok(false);
            }
        };
        self.store
            .modify(&key, mutation(|existing| existing))
            .await?;
        self.record_event(
            RecoveryEventKind::CorruptQuarantined,
            storage_key,
            reason.to_string(),
        )
        .await;
        Ok(true)
    }

    async fn prune_dead_index(&self) -> Result<usize> {
        let mut pruned = 0;
        for storage_key in self.store.indexed_keys().await? {
            if self.store.contains(&storage_key).await? {
                continue;
            }
            if self.store.prune_index(&storage_key).await? {
                pruned += 1;
                tracing::debug!(conversation_key = %storage_key, "dead index entry pruned");
                self.record_event(
                    RecoveryEventKind::DeadIndexPruned,
                    &storage_key,
                    String::new(),
                )
                .await;
            }
        }
        Ok(pruned)
    }

    /// Failsafe for batches past `max_batch_age` and for due batches whose timer was lost.
    async fn flush_overdue(&self) -> Result<(usize, usize)> {
        let mut aged = 0;
        let mut resumed = 0;
        for entry in self.store.scan().await? {
            let StoredEntry::Batch(batch) = entry else {
                continue;
            };
            if batch.state != BatchState::Active || batch.is_empty() {
                continue;
            }
            let now = self.clock.now();
            let too_old = batch.age(now) >= self.buffer_cfg.max_batch_age;
            let due = matches!(
                next_action(&batch, &self.buffer_cfg, now),
                NextAction::Flush | NextAction::Abandon
            );
            if !too_old && !due {
                continue;
            }
            let outcome = match self.processor.flush(&batch.key).await {
                Ok(outcome) => outcome,
                Err(QueueError::CorruptEntry { .. }) => continue,
                Err(error) => return Err(error),
            };
            if matches!(outcome, FlushOutcome::Contended | FlushOutcome::NothingToFlush) {
                continue;
            }
            let (kind, counter) = if too_old {
                (RecoveryEventKind::AgedBatchFlushed, &mut aged)
            } else {
                (RecoveryEventKind::OverdueBatchResumed, &mut resumed)
            };
            *counter += 1;
            tracing::info!(
                conversation_key = %batch.key,
                outcome = outcome.label(),
                age_secs = batch.age(now).as_secs(),
                "recovery flushed overdue batch"
            );
            self.record_event(kind, &batch.key.storage_key(), outcome.label().to_string())
                .await;
        }
        Ok((aged, resumed))
    }

    async fn record_event(&self, kind: RecoveryEventKind, conversation_key: &str, detail: String) {
        let event = RecoveryEvent {
            at: self.clock.now(),
            kind,
            conversation_key: conversation_key.to_string(),
            detail,
        };
        let mut state = self.state.write().await;
        if self.cfg.recent_events_capacity == 0 {
            return;
        }
        while state.recent_events.len() >= self.cfg.recent_events_capacity {
            state.recent_events.pop_front();
        }
        state.recent_events.push_back(event);
    }
}

enum OrphanRepair {
    Reset,
    Abandoned,
}
