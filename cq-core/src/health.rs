//! Observational snapshots: processing statistics, repair events and the
//! aggregate health view. Nothing here is authoritative state.

use crate::batch::{BatchState, ConversationBatch};
use crate::clock::elapsed_between;
use crate::config::RecoveryConfig;
use crate::lock::LockRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

pub const OUTCOME_WINDOW: usize = 100;
const DEGRADED_SUCCESS_RATE: f64 = 0.5;
const MIN_SAMPLES_FOR_RATE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Retry,
    Abandoned,
    Fatal,
}

impl AttemptOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Retry => "retry",
            Self::Abandoned => "abandoned",
            Self::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessingStats {
    attempts: u64,
    successes: u64,
    retries: u64,
    abandoned: u64,
    fatal: u64,
    contended: u64,
    messages_delivered: u64,
    messages_dropped: u64,
    window: VecDeque<AttemptOutcome>,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl ProcessingStats {
    pub fn record(&mut self, outcome: AttemptOutcome, at: DateTime<Utc>) {
        match outcome {
            AttemptOutcome::Success => {
                self.successes += 1;
                self.last_success_at = Some(at);
            }
            AttemptOutcome::Retry => {
                self.retries += 1;
                self.last_failure_at = Some(at);
            }
            AttemptOutcome::Abandoned => {
                self.abandoned += 1;
                self.last_failure_at = Some(at);
            }
            AttemptOutcome::Fatal => {
                self.fatal += 1;
                self.last_failure_at = Some(at);
            }
        }
        self.attempts += 1;
        if self.window.len() == OUTCOME_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(outcome);
    }

    pub fn record_delivered(&mut self, messages: usize) {
        self.messages_delivered = self.messages_delivered.saturating_add(messages as u64);
    }

    pub fn record_dropped(&mut self, messages: usize) {
        self.messages_dropped = self.messages_dropped.saturating_add(messages as u64);
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    pub fn record_contention(&mut self) {
        self.contended += 1;
    }

    /// Share of successful attempts among the last [`OUTCOME_WINDOW`] outcomes.
    pub fn success_rate(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        let ok = self
            .window
            .iter()
            .filter(|o| **o == AttemptOutcome::Success)
            .count();
        Some(ok as f64 / self.window.len() as f64)
    }

    pub fn snapshot(&self) -> ProcessingStatsSnapshot {
        ProcessingStatsSnapshot {
            attempts: self.attempts,
            successes: self.successes,
            retries: self.retries,
            abandoned: self.abandoned,
            fatal: self.fatal,
            contended: self.contended,
            messages_delivered: self.messages_delivered,
            messages_dropped: self.messages_dropped,
            window_size: self.window.len(),
            success_rate: self.success_rate(),
            last_success_at: self.last_success_at,
            last_failure_at: self.last_failure_at,
            last_error: self.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingStatsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub retries: u64,
    pub abandoned: u64,
    pub fatal: u64,
    pub contended: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub window_size: usize,
    pub success_rate: Option<f64>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryEventKind {
    StuckLockReleased,
    OrphanReset,
    OrphanAbandoned,
    CorruptQuarantined,
    DeadIndexPruned,
    CooldownExpired,
    AgedBatchFlushed,
    OverdueBatchResumed,
    EmergencyExpired,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryEvent {
    pub at: DateTime<Utc>,
    pub kind: RecoveryEventKind,
    pub conversation_key: String,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub active: usize,
    pub processing: usize,
    pub cooldown: usize,
    pub expired: usize,
    pub total: usize,
}

/// Scan-derived aggregates over stored batches and locks.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreSummary {
    pub batches: BatchCounts,
    pub total_pending_messages: usize,
    pub deferred_messages: usize,
    pub oldest_batch_age_ms: Option<u64>,
    pub stuck_processing: usize,
    pub corrupt_entries: usize,
    pub held_locks: usize,
    pub stuck_locks: usize,
    pub expired_locks: usize,
}

impl StoreSummary {
    pub fn observe_batch(&mut self, batch: &ConversationBatch, now: DateTime<Utc>, cfg: &RecoveryConfig) {
        match batch.state {
            BatchState::Active => self.batches.active += 1,
            BatchState::Processing => {
                self.batches.processing += 1;
                let stuck = batch
                    .processing_started_at
                    .map(|started| elapsed_between(started, now) >= cfg.stuck_processing_threshold)
                    .unwrap_or(true);
                if stuck {
                    self.stuck_processing += 1;
                }
            }
            BatchState::Cooldown => self.batches.cooldown += 1,
            BatchState::Expired => self.batches.expired += 1,
        }
        self.batches.total += 1;
        self.total_pending_messages += batch.pending_count();
        self.deferred_messages += batch.deferred.len();
        if !batch.is_empty() {
            let age = batch.age(now).as_millis().min(u64::MAX as u128) as u64;
            self.oldest_batch_age_ms = Some(self.oldest_batch_age_ms.map_or(age, |a| a.max(age)));
        }
    }

    pub fn observe_lock(&mut self, lock: &LockRecord, now: DateTime<Utc>, cfg: &RecoveryConfig) {
        if lock.is_expired(now) {
            self.expired_locks += 1;
            return;
        }
        self.held_locks += 1;
        if lock.is_stuck(now, cfg.stuck_lock_threshold) {
            self.stuck_locks += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueHealth {
    Healthy,
    Degraded,
}

pub fn queue_health_status_label(health: QueueHealth) -> &'static str {
    match health {
        QueueHealth::Healthy => "ok",
        QueueHealth::Degraded => "degraded",
    }
}

pub fn evaluate_queue_health(
    summary: &StoreSummary,
    processing: &ProcessingStatsSnapshot,
    last_sweep_error: Option<&str>,
) -> QueueHealth {
    if summary.stuck_locks > 0 || summary.stuck_processing > 0 || summary.corrupt_entries > 0 {
        return QueueHealth::Degraded;
    }
    if last_sweep_error.is_some() {
        return QueueHealth::Degraded;
    }
    match processing.success_rate {
        Some(rate) if processing.window_size >= MIN_SAMPLES_FOR_RATE && rate < DEGRADED_SUCCESS_RATE => {
            QueueHealth::Degraded
        }
        _ => QueueHealth::Healthy,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub health: QueueHealth,
    pub generated_at: DateTime<Utc>,
    pub store_backend: &'static str,
    #[serde(flatten)]
    pub summary: StoreSummary,
    pub indexed_keys: usize,
    pub quarantined_entries: usize,
    pub processing: ProcessingStatsSnapshot,
    pub emergency_expired_total: u64,
    pub sweeps_total: u64,
    pub last_sweep_at: Option<DateTime<Utc>>,
    pub last_sweep_error: Option<String>,
    pub recent_events: Vec<RecoveryEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::fixtures::text_message;
    use crate::config::fixtures::recovery_config;
    use crate::types::OwnerToken;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn success_rate_uses_rolling_window() {
        let now = Utc::now();
        let mut stats = ProcessingStats::default();
        assert_eq!(stats.success_rate(), None);
        for _ in 0..OUTCOME_WINDOW {
            stats.record(AttemptOutcome::Retry, now);
        }
        assert_eq!(stats.success_rate(), Some(0.0));
        for _ in 0..OUTCOME_WINDOW / 2 {
            stats.record(AttemptOutcome::Success, now);
        }
        assert_eq!(stats.success_rate(), Some(0.5));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.attempts, (OUTCOME_WINDOW + OUTCOME_WINDOW / 2) as u64);
        assert_eq!(snapshot.window_size, OUTCOME_WINDOW);
    }

    #[test]
    fn summary_counts_states_and_stuck_items() {
        let cfg = recovery_config();
        let t0 = Utc::now();
        let now = t0 + ChronoDuration::seconds(300);
        let mut summary = StoreSummary::default();

        let mut active = ConversationBatch::new(text_message("a", t0), t0);
        active.push(text_message("b", t0), t0);
        summary.observe_batch(&active, now, &cfg);

        let mut processing = ConversationBatch::new(text_message("c", t0), t0);
        assert!(processing.begin_processing(t0));
        summary.observe_batch(&processing, now, &cfg);

        summary.observe_lock(
            &LockRecord {
                storage_key: "k".into(),
                owner_token: OwnerToken::generate(),
                acquired_at: t0,
                renewed_at: t0,
                expires_at: now + ChronoDuration::seconds(1),
            },
            now,
            &cfg,
        );

        assert_eq!(summary.batches.active, 1);
        assert_eq!(summary.batches.processing, 1);
        assert_eq!(summary.total_pending_messages, 3);
        assert_eq!(summary.stuck_processing, 1);
        assert_eq!(summary.stuck_locks, 1);
        assert_eq!(summary.oldest_batch_age_ms, Some(300_000));
    }

    #[test]
    fn health_degrades_on_stuck_work_or_poor_success_rate() {
        let now = Utc::now();
        let mut stats = ProcessingStats::default();
        let summary = StoreSummary::default();
        assert_eq!(
            evaluate_queue_health(&summary, &stats.snapshot(), None),
            QueueHealth::Healthy
        );

        for _ in 0..MIN_SAMPLES_FOR_RATE {
            stats.record(AttemptOutcome::Abandoned, now);
        }
        let degraded = evaluate_queue_health(&summary, &stats.snapshot(), None);
        assert_eq!(queue_health_status_label(degraded), "degraded");

        let stuck = StoreSummary {
            stuck_locks: 1,
            ..StoreSummary::default()
        };
        assert_eq!(
            evaluate_queue_health(&stuck, &ProcessingStats::default().snapshot(), None),
            QueueHealth::Degraded
        );
    }
}
