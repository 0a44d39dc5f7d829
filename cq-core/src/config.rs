//! Tunables for the buffer and the recovery sweep.
//!
//! Every value is supplied by the embedding service; nothing here has a default.

use crate::error::{QueueError, Result};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferConfig {
    /// Quiet period after the last accepted message before a batch may flush.
    pub debounce_window: Duration,
    /// Batch flushes immediately once it holds this many messages.
    pub max_batch_size: usize,
    /// Active batches older than this are flushed by the recovery sweep.
    pub max_batch_age: Duration,
    /// A message arriving later than this after the previous one starts a new batch.
    pub max_time_between_messages: Duration,
    /// Flush attempts before a batch is abandoned into cooldown.
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub lock_ttl: Duration,
    /// How long after a flush a cooldown batch can be reactivated by a follow-up.
    pub reactivation_window: Duration,
    /// Expiry refreshed on every write to a stored batch.
    pub entry_ttl: Duration,
}

impl BufferConfig {
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("debounce_window", self.debounce_window),
            ("max_batch_age", self.max_batch_age),
            ("max_time_between_messages", self.max_time_between_messages),
            ("retry_base_delay", self.retry_base_delay),
            ("retry_max_delay", self.retry_max_delay),
            ("lock_ttl", self.lock_ttl),
            ("entry_ttl", self.entry_ttl),
        ];
        for (name, value) in nonzero {
            if value.is_zero() {
                return Err(QueueError::InvalidInput(format!("{name} must be > 0")));
            }
        }
        if self.max_batch_size == 0 {
            return Err(QueueError::InvalidInput(
                "max_batch_size must be > 0".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(QueueError::InvalidInput(
                "max_attempts must be > 0".to_string(),
            ));
        }
        if self.retry_max_delay < self.retry_base_delay {
            return Err(QueueError::InvalidInput(
                "retry_max_delay must be >= retry_base_delay".to_string(),
            ));
        }
        if self.entry_ttl <= self.debounce_window {
            return Err(QueueError::InvalidInput(
                "entry_ttl must be longer than debounce_window".to_string(),
            ));
        }
        Ok(())
    }

    /// Interval at which a flushing worker renews its lock.
    pub fn lock_renew_interval(&self) -> Duration {
        (self.lock_ttl / 3).max(Duration::from_millis(10))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryConfig {
    pub sweep_interval: Duration,
    /// Processing batches older than this are treated as orphaned.
    pub stuck_processing_threshold: Duration,
    /// Locks held longer than this are force-released.
    pub stuck_lock_threshold: Duration,
    /// Empty cooldown batches are deleted once idle this long.
    pub cooldown_retention: Duration,
    /// Any batch idle this long is removed, pending messages included.
    pub emergency_threshold: Duration,
    pub recent_events_capacity: usize,
}

impl RecoveryConfig {
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("sweep_interval", self.sweep_interval),
            ("stuck_processing_threshold", self.stuck_processing_threshold),
            ("stuck_lock_threshold", self.stuck_lock_threshold),
            ("cooldown_retention", self.cooldown_retention),
            ("emergency_threshold", self.emergency_threshold),
        ];
        for (name, value) in nonzero {
            if value.is_zero() {
                return Err(QueueError::InvalidInput(format!("{name} must be > 0")));
            }
        }
        if self.emergency_threshold <= self.stuck_processing_threshold {
            return Err(QueueError::InvalidInput(
                "emergency_threshold must be longer than stuck_processing_threshold".to_string(),
            ));
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn fixture_configs_validate() {
        buffer_config().validate().expect("buffer config valid");
        recovery_config().validate().expect("recovery config valid");
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut cfg = buffer_config();
        cfg.max_batch_size = 0;
        let err = cfg.validate().expect_err("zero batch size must fail");
        assert!(err.to_string().contains("max_batch_size"));
    }

    #[test]
    fn rejects_inverted_retry_bounds() {
        let mut cfg = buffer_config();
        cfg.retry_max_delay = Duration::from_millis(500);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_emergency_threshold_below_stuck_threshold() {
        let mut cfg = recovery_config();
        cfg.emergency_threshold = Duration::from_secs(60);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn lock_renew_interval_is_a_third_of_ttl() {
        assert_eq!(buffer_config().lock_renew_interval(), Duration::from_secs(10));
    }
}
