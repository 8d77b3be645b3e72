use chrono::{DateTime, Utc};
use pressroom_core::clock::{elapsed_between, to_chrono};
use std::collections::HashMap;
use std::time::Duration;

/// Per-source minimum spacing between job starts.
///
/// Unlike a token bucket there is no burst: a source may start again only
/// once `min_interval` has passed since its previous start. Callers pass the
/// current time so the limiter follows whatever clock the queue runs on.
#[derive(Debug)]
pub struct IntervalLimiter {
    min_interval: Duration,
    last_start: HashMap<String, DateTime<Utc>>,
}

impl IntervalLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_start: HashMap::new(),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Whether `source` may start a job at `now`.
    pub fn is_ready(&self, source: &str, now: DateTime<Utc>) -> bool {
        self.wait_time(source, now).is_zero()
    }

    /// Time left before `source` may start again. Zero when ready.
    ///
    /// An interval that does not fit on the calendar means the source never
    /// becomes ready; the full interval is reported as the wait.
    pub fn wait_time(&self, source: &str, now: DateTime<Utc>) -> Duration {
        match self.last_start.get(source) {
            None => Duration::ZERO,
            Some(last) => match last.checked_add_signed(to_chrono(self.min_interval)) {
                Some(ready_at) => elapsed_between(now, ready_at),
                None => self.min_interval,
            },
        }
    }

    /// Record that `source` started a job at `now`.
    pub fn record(&mut self, source: &str, now: DateTime<Utc>) {
        self.last_start.insert(source.to_string(), now);
    }

    /// Forget sources idle for at least `max_idle`.
    pub fn cleanup(&mut self, max_idle: Duration, now: DateTime<Utc>) {
        self.last_start
            .retain(|_, last| elapsed_between(*last, now) < max_idle);
    }

    pub fn tracked_sources(&self) -> usize {
        self.last_start.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_unknown_source_is_ready() {
        let limiter = IntervalLimiter::new(Duration::from_secs(1));
        assert!(limiter.is_ready("riot", t0()));
    }

    #[test]
    fn test_blocks_until_interval_passes() {
        let mut limiter = IntervalLimiter::new(Duration::from_secs(1));
        let start = t0();
        limiter.record("riot", start);

        let early = start + chrono::Duration::milliseconds(400);
        assert!(!limiter.is_ready("riot", early));
        assert_eq!(limiter.wait_time("riot", early), Duration::from_millis(600));

        let later = start + chrono::Duration::seconds(1);
        assert!(limiter.is_ready("riot", later));
    }

    #[test]
    fn test_sources_are_independent() {
        let mut limiter = IntervalLimiter::new(Duration::from_secs(1));
        let start = t0();
        limiter.record("riot", start);
        assert!(limiter.is_ready("valve", start));
    }

    #[test]
    fn test_zero_interval_never_blocks() {
        let mut limiter = IntervalLimiter::new(Duration::ZERO);
        let start = t0();
        limiter.record("riot", start);
        assert!(limiter.is_ready("riot", start));
    }

    #[test]
    fn test_cleanup_drops_idle_sources() {
        let mut limiter = IntervalLimiter::new(Duration::from_secs(1));
        let start = t0();
        limiter.record("riot", start);
        limiter.record("valve", start + chrono::Duration::seconds(50));

        limiter.cleanup(Duration::from_secs(30), start + chrono::Duration::seconds(60));
        assert_eq!(limiter.tracked_sources(), 1);
        assert!(limiter.is_ready("riot", start));
    }

    #[test]
    fn test_huge_interval_never_ready() {
        let mut limiter = IntervalLimiter::new(Duration::from_secs_f64(1e17));
        let start = t0();
        limiter.record("feed", start);
        assert_eq!(limiter.wait_time("feed", start), limiter.min_interval());
        assert!(!limiter.is_ready("feed", start));
    }
}
