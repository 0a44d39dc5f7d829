//! Coalescing and retry decisions. Everything here is pure: callers pass the
//! current record and the current time, and apply the returned decision inside
//! an atomic store update.

use crate::batch::{BatchState, ConversationBatch};
use crate::clock::{elapsed_between, to_chrono};
use crate::config::BufferConfig;
use crate::types::{ContentKind, PendingMessage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrivalDecision {
    /// No batch exists for the key.
    Create,
    /// Compatible with the active batch.
    Append,
    /// The batch is being processed; hold the message until the attempt resolves.
    Defer,
    /// The active batch could not be flushed yet, or already has messages waiting
    /// behind it; queue the message for the unit that follows.
    Hold,
    /// Follow-up shortly after a flush; reuse the cooldown record.
    Reactivate,
    /// The existing record is stale; replace it with a fresh batch.
    Restart,
    /// Incompatible with the active batch; flush it before accepting the message.
    FlushThenStart,
}

impl ArrivalDecision {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Create => "created",
            Self::Append => "appended",
            Self::Defer => "deferred_while_processing",
            Self::Hold => "held_for_next_batch",
            Self::Reactivate => "reactivated",
            Self::Restart => "restarted",
            Self::FlushThenStart => "flushed_previous",
        }
    }
}

/// Whether `next` may join a batch whose latest message is `prev`.
pub fn is_compatible(prev: ContentKind, next: ContentKind) -> bool {
    use ContentKind::*;
    matches!(
        (prev, next),
        (Text, Text)
            | (Text, Image { captioned: false })
            | (Image { captioned: false }, Text)
            | (Image { captioned: false }, Image { captioned: false })
    )
}

/// Decides how an arrival joins the conversation's current record.
///
/// With `split_allowed` false an active batch never absorbs the message: this is
/// the second pass after a forced flush, and a batch still active then failed or
/// is owned by another worker, so the message waits for the next unit instead.
pub fn decide_arrival(
    existing: Option<&ConversationBatch>,
    incoming: &PendingMessage,
    cfg: &BufferConfig,
    now: DateTime<Utc>,
    split_allowed: bool,
) -> ArrivalDecision {
    let Some(batch) = existing else {
        return ArrivalDecision::Create;
    };
    match batch.state {
        BatchState::Processing => ArrivalDecision::Defer,
        BatchState::Cooldown => {
            let within_window = batch
                .last_flushed_at
                .map(|flushed| elapsed_between(flushed, now) < cfg.reactivation_window)
                .unwrap_or(false);
            if within_window {
                ArrivalDecision::Reactivate
            } else {
                ArrivalDecision::Restart
            }
        }
        BatchState::Expired => ArrivalDecision::Restart,
        BatchState::Active => {
            if !split_allowed || !batch.deferred.is_empty() {
                return ArrivalDecision::Hold;
            }
            let Some(last) = batch.last_message() else {
                return ArrivalDecision::Append;
            };
            let gap = elapsed_between(batch.last_updated_at, now);
            if gap < cfg.max_time_between_messages && is_compatible(last.kind, incoming.kind) {
                ArrivalDecision::Append
            } else {
                ArrivalDecision::FlushThenStart
            }
        }
    }
}

/// Applies a decision from [`decide_arrival`]. `FlushThenStart` leaves the record untouched.
pub fn apply_arrival(
    existing: Option<ConversationBatch>,
    incoming: PendingMessage,
    decision: ArrivalDecision,
    now: DateTime<Utc>,
) -> Option<ConversationBatch> {
    match (existing, decision) {
        (None, _) | (Some(_), ArrivalDecision::Create | ArrivalDecision::Restart) => {
            Some(ConversationBatch::new(incoming, now))
        }
        (Some(mut batch), ArrivalDecision::Append) => {
            batch.push(incoming, now);
            Some(batch)
        }
        (Some(mut batch), ArrivalDecision::Defer | ArrivalDecision::Hold) => {
            batch.defer(incoming, now);
            Some(batch)
        }
        (Some(mut batch), ArrivalDecision::Reactivate) => {
            batch.reactivate(incoming, now);
            Some(batch)
        }
        (Some(batch), ArrivalDecision::FlushThenStart) => Some(batch),
    }
}

/// Size cap: an active batch at or above the ceiling flushes without waiting.
pub fn is_full(batch: &ConversationBatch, cfg: &BufferConfig) -> bool {
    batch.state == BatchState::Active && batch.messages.len() >= cfg.max_batch_size
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "delay_ms")]
pub enum NextAction {
    /// Ready to flush now.
    Flush,
    /// Check again after the delay.
    Reschedule(#[serde(serialize_with = "serialize_millis")] Duration),
    /// Retry budget exhausted.
    Abandon,
    /// Nothing to do for this batch in its current state.
    Idle,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis().min(u64::MAX as u128) as u64)
}

/// Retry and debounce state machine for an active batch.
///
/// The quiet-period rule takes priority over everything except the size cap:
/// a fresh batch flushes only once it has been idle for the full debounce
/// window or has reached `max_batch_size` messages.
pub fn next_action(batch: &ConversationBatch, cfg: &BufferConfig, now: DateTime<Utc>) -> NextAction {
    if batch.state != BatchState::Active || batch.messages.is_empty() {
        return NextAction::Idle;
    }
    if batch.attempt_count >= cfg.max_attempts {
        return NextAction::Abandon;
    }
    if batch.attempt_count > 0 {
        let since = batch.last_attempt_at.unwrap_or(batch.last_updated_at);
        let due = since + to_chrono(backoff_delay(batch.attempt_count, cfg));
        if now < due {
            return NextAction::Reschedule(elapsed_between(now, due));
        }
        return NextAction::Flush;
    }
    if is_full(batch, cfg) {
        return NextAction::Flush;
    }
    let quiet = batch.idle_for(now);
    if quiet >= cfg.debounce_window {
        NextAction::Flush
    } else {
        NextAction::Reschedule(cfg.debounce_window - quiet)
    }
}

/// A batch whose last attempt failed and whose retry delay has not elapsed yet.
pub fn in_retry_backoff(batch: &ConversationBatch, cfg: &BufferConfig, now: DateTime<Utc>) -> bool {
    batch.attempt_count > 0 && matches!(next_action(batch, cfg, now), NextAction::Reschedule(_))
}

/// `base × 2^(attempt-1)`, capped at `retry_max_delay`.
pub fn backoff_delay(attempt: u32, cfg: &BufferConfig) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let factor = 1_u32 << exponent;
    cfg.retry_base_delay
        .checked_mul(factor)
        .unwrap_or(cfg.retry_max_delay)
        .min(cfg.retry_max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::fixtures::{message_of, text_message};
    use crate::config::fixtures::buffer_config;
    use chrono::Duration as ChronoDuration;

    fn secs(n: i64) -> ChronoDuration {
        ChronoDuration::seconds(n)
    }

    #[test]
    fn text_and_uncaptioned_images_are_compatible_both_ways() {
        let image = ContentKind::Image { captioned: false };
        assert!(is_compatible(ContentKind::Text, ContentKind::Text));
        assert!(is_compatible(ContentKind::Text, image));
        assert!(is_compatible(image, ContentKind::Text));
        assert!(is_compatible(image, image));
    }

    #[test]
    fn captioned_images_and_media_break_batches() {
        let captioned = ContentKind::Image { captioned: true };
        assert!(!is_compatible(ContentKind::Text, captioned));
        assert!(!is_compatible(captioned, ContentKind::Text));
        assert!(!is_compatible(ContentKind::Text, ContentKind::Audio));
        assert!(!is_compatible(ContentKind::Audio, ContentKind::Audio));
        assert!(!is_compatible(ContentKind::Document, ContentKind::Text));
    }

    #[test]
    fn first_arrival_creates_batch() {
        let cfg = buffer_config();
        let now = Utc::now();
        let msg = text_message("hi", now);
        assert_eq!(
            decide_arrival(None, &msg, &cfg, now, true),
            ArrivalDecision::Create
        );
    }

    #[test]
    fn compatible_arrival_within_gap_appends() {
        let cfg = buffer_config();
        let t0 = Utc::now();
        let batch = ConversationBatch::new(text_message("one", t0), t0);
        let msg = text_message("two", t0 + secs(2));
        assert_eq!(
            decide_arrival(Some(&batch), &msg, &cfg, t0 + secs(2), true),
            ArrivalDecision::Append
        );
    }

    #[test]
    fn long_gap_forces_flush_then_start() {
        let cfg = buffer_config();
        let t0 = Utc::now();
        let batch = ConversationBatch::new(text_message("one", t0), t0);
        let later = t0 + secs(31);
        let msg = text_message("two", later);
        assert_eq!(
            decide_arrival(Some(&batch), &msg, &cfg, later, true),
            ArrivalDecision::FlushThenStart
        );
        assert_eq!(
            decide_arrival(Some(&batch), &msg, &cfg, later, false),
            ArrivalDecision::Hold
        );
    }

    #[test]
    fn incompatible_kind_forces_flush_then_start() {
        let cfg = buffer_config();
        let t0 = Utc::now();
        let batch = ConversationBatch::new(text_message("one", t0), t0);
        let voice = message_of(ContentKind::Audio, "", t0 + secs(1));
        assert_eq!(
            decide_arrival(Some(&batch), &voice, &cfg, t0 + secs(1), true),
            ArrivalDecision::FlushThenStart
        );
    }

    #[test]
    fn processing_batch_defers_arrivals() {
        let cfg = buffer_config();
        let t0 = Utc::now();
        let mut batch = ConversationBatch::new(text_message("one", t0), t0);
        assert!(batch.begin_processing(t0));
        let msg = text_message("two", t0 + secs(1));
        let decision = decide_arrival(Some(&batch), &msg, &cfg, t0 + secs(1), true);
        assert_eq!(decision, ArrivalDecision::Defer);
        let after = apply_arrival(Some(batch), msg, decision, t0 + secs(1)).expect("batch");
        assert_eq!(after.deferred.len(), 1);
        assert_eq!(after.messages.len(), 1);
    }

    #[test]
    fn arrivals_queue_behind_messages_already_held() {
        let cfg = buffer_config();
        let t0 = Utc::now();
        let batch = ConversationBatch::new(text_message("one", t0), t0);
        let voice = message_of(ContentKind::Audio, "", t0 + secs(1));
        let decision = decide_arrival(Some(&batch), &voice, &cfg, t0 + secs(1), false);
        assert_eq!(decision, ArrivalDecision::Hold);
        let batch = apply_arrival(Some(batch), voice, decision, t0 + secs(1)).expect("batch");
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.deferred.len(), 1);

        // A compatible text must not jump ahead of the held voice note.
        let text = text_message("two", t0 + secs(2));
        assert_eq!(
            decide_arrival(Some(&batch), &text, &cfg, t0 + secs(2), true),
            ArrivalDecision::Hold
        );
    }

    #[test]
    fn retry_backoff_is_only_reported_after_a_failure() {
        let cfg = buffer_config();
        let t0 = Utc::now();
        let mut batch = ConversationBatch::new(text_message("one", t0), t0);
        assert!(!in_retry_backoff(&batch, &cfg, t0));
        assert!(batch.begin_processing(t0));
        batch.record_failure("503", t0);
        assert!(in_retry_backoff(&batch, &cfg, t0 + secs(1)));
        assert!(!in_retry_backoff(&batch, &cfg, t0 + secs(2)));
    }

    #[test]
    fn cooldown_reactivates_within_window_and_restarts_after() {
        let cfg = buffer_config();
        let t0 = Utc::now();
        let mut batch = ConversationBatch::new(text_message("one", t0), t0);
        assert!(batch.begin_processing(t0));
        batch.complete(t0);

        let soon = t0 + secs(1);
        let msg = text_message("follow-up", soon);
        assert_eq!(
            decide_arrival(Some(&batch), &msg, &cfg, soon, true),
            ArrivalDecision::Reactivate
        );

        let late = t0 + secs(20);
        let msg = text_message("much later", late);
        assert_eq!(
            decide_arrival(Some(&batch), &msg, &cfg, late, true),
            ArrivalDecision::Restart
        );
    }

    #[test]
    fn reactivated_record_keeps_flush_history() {
        let cfg = buffer_config();
        let t0 = Utc::now();
        let mut batch = ConversationBatch::new(text_message("one", t0), t0);
        assert!(batch.begin_processing(t0));
        batch.complete(t0);
        let msg = text_message("two", t0 + secs(1));
        let decision = decide_arrival(Some(&batch), &msg, &cfg, t0 + secs(1), true);
        let after = apply_arrival(Some(batch), msg, decision, t0 + secs(1)).expect("batch");
        assert_eq!(after.state, BatchState::Active);
        assert_eq!(after.flush_count, 1);
        assert_eq!(after.messages.len(), 1);
    }

    #[test]
    fn next_action_waits_for_quiet_period() {
        let cfg = buffer_config();
        let t0 = Utc::now();
        let mut batch = ConversationBatch::new(text_message("one", t0), t0);
        batch.push(text_message("two", t0 + secs(2)), t0 + secs(2));
        assert_eq!(
            next_action(&batch, &cfg, t0 + secs(3)),
            NextAction::Reschedule(Duration::from_secs(4))
        );
        assert_eq!(next_action(&batch, &cfg, t0 + secs(7)), NextAction::Flush);
    }

    #[test]
    fn next_action_flushes_full_batch_immediately() {
        let cfg = buffer_config();
        let t0 = Utc::now();
        let mut batch = ConversationBatch::new(text_message("m0", t0), t0);
        for i in 1..cfg.max_batch_size {
            batch.push(text_message(&format!("m{i}"), t0), t0);
        }
        assert_eq!(next_action(&batch, &cfg, t0), NextAction::Flush);
    }

    #[test]
    fn next_action_applies_backoff_then_abandons() {
        let cfg = buffer_config();
        let t0 = Utc::now();
        let mut batch = ConversationBatch::new(text_message("one", t0), t0);
        assert!(batch.begin_processing(t0));
        batch.record_failure("boom", t0);
        assert_eq!(
            next_action(&batch, &cfg, t0),
            NextAction::Reschedule(Duration::from_secs(2))
        );
        assert_eq!(next_action(&batch, &cfg, t0 + secs(2)), NextAction::Flush);

        batch.attempt_count = cfg.max_attempts;
        assert_eq!(next_action(&batch, &cfg, t0), NextAction::Abandon);
    }

    #[test]
    fn next_action_is_idle_outside_active_state() {
        let cfg = buffer_config();
        let t0 = Utc::now();
        let mut batch = ConversationBatch::new(text_message("one", t0), t0);
        assert!(batch.begin_processing(t0));
        assert_eq!(next_action(&batch, &cfg, t0 + secs(60)), NextAction::Idle);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut cfg = buffer_config();
        cfg.retry_max_delay = Duration::from_secs(10);
        assert_eq!(backoff_delay(1, &cfg), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, &cfg), Duration::from_secs(4));
        assert_eq!(backoff_delay(3, &cfg), Duration::from_secs(8));
        assert_eq!(backoff_delay(4, &cfg), Duration::from_secs(10));
        assert_eq!(backoff_delay(40, &cfg), Duration::from_secs(10));
    }
}
