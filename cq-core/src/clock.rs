//! Wall-clock source shared by every component that stamps or ages records.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Mutex;
use std::time::Duration;

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock anchored once at construction and advanced by tokio's monotonic clock.
///
/// Under `tokio::time::pause` the reported time moves with the paused runtime clock,
/// which keeps persisted timestamps consistent with debounce timers.
#[derive(Debug, Clone)]
pub struct TokioClock {
    anchor_instant: tokio::time::Instant,
    anchor_utc: DateTime<Utc>,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            anchor_instant: tokio::time::Instant::now(),
            anchor_utc: Utc::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        self.anchor_utc + to_chrono(self.anchor_instant.elapsed())
    }
}

/// Hand-driven clock for tests of time-based classification.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += to_chrono(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::days(36_500))
}

/// Time from `since` to `now`, zero if `since` is in the future.
pub fn elapsed_between(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(since)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

pub fn millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_secs(5));
        assert_eq!(elapsed_between(start, clock.now()), Duration::from_secs(5));
    }

    #[test]
    fn elapsed_between_saturates_for_future_timestamps() {
        let now = Utc::now();
        let later = now + ChronoDuration::seconds(3);
        assert_eq!(elapsed_between(later, now), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_paused_runtime() {
        let clock = TokioClock::new();
        let before = clock.now();
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(elapsed_between(before, clock.now()), Duration::from_secs(7));
    }
}
