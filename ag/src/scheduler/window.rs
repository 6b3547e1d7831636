//! Sliding dispatch window for the rate limit
//!
//! Only the oldest of the most recent `rate` dispatches matters: if it lies
//! inside the window, `rate` dispatches already happened within `rate_per`.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Dispatch timestamps, oldest first
#[derive(Debug, Default, Clone)]
pub struct RateWindow {
    dispatches: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retained dispatch timestamps
    pub fn len(&self) -> usize {
        self.dispatches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatches.is_empty()
    }

    /// Keep only the most recent `rate` timestamps
    pub fn trim(&mut self, rate: u32) {
        let keep = rate as usize;
        while self.dispatches.len() > keep {
            self.dispatches.pop_front();
        }
    }

    /// Append a dispatch time
    pub fn record(&mut self, now: Instant) {
        self.dispatches.push_back(now);
    }

    /// Oldest of the most recent `rate` dispatches, once `rate` have happened
    fn oldest_binding(&self, rate: u32) -> Option<Instant> {
        let rate = rate as usize;
        if rate == 0 || self.dispatches.len() < rate {
            return None;
        }
        self.dispatches.get(self.dispatches.len() - rate).copied()
    }

    /// Whether admission is blocked by the rate limit right now
    ///
    /// An empty queue is never rate-bound: there is nothing to hold back.
    pub fn is_bound(&self, now: Instant, rate: u32, rate_per: Duration, queue_non_empty: bool) -> bool {
        if !queue_non_empty {
            return false;
        }
        self.oldest_binding(rate)
            .map(|oldest| now.saturating_duration_since(oldest) < rate_per)
            .unwrap_or(false)
    }

    /// Delay until the window frees up, one millisecond past expiry
    pub fn retry_after(&self, now: Instant, rate: u32, rate_per: Duration) -> Duration {
        let elapsed = self
            .oldest_binding(rate)
            .map(|oldest| now.saturating_duration_since(oldest))
            .unwrap_or(rate_per);
        rate_per.saturating_sub(elapsed) + Duration::from_millis(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const PER: Duration = Duration::from_millis(1_000);

    #[test]
    fn test_not_bound_until_full() {
        let t0 = Instant::now();
        let mut window = RateWindow::new();

        window.record(t0);
        assert!(!window.is_bound(t0, 2, PER, true));

        window.record(t0);
        assert!(window.is_bound(t0, 2, PER, true));
    }

    #[test]
    fn test_empty_queue_is_never_bound() {
        let t0 = Instant::now();
        let mut window = RateWindow::new();
        window.record(t0);
        window.record(t0);
        assert!(!window.is_bound(t0, 2, PER, false));
    }

    #[test]
    fn test_window_expiry() {
        let t0 = Instant::now();
        let mut window = RateWindow::new();
        window.record(t0);
        window.record(t0 + Duration::from_millis(400));

        assert!(window.is_bound(t0 + Duration::from_millis(999), 2, PER, true));
        assert!(!window.is_bound(t0 + Duration::from_millis(1_000), 2, PER, true));
    }

    #[test]
    fn test_trim_keeps_most_recent() {
        let t0 = Instant::now();
        let mut window = RateWindow::new();
        for ms in [0, 100, 200, 300] {
            window.record(t0 + Duration::from_millis(ms));
        }

        window.trim(2);
        assert_eq!(window.len(), 2);
        // Oldest retained is now t0+200
        assert!(window.is_bound(t0 + Duration::from_millis(1_199), 2, PER, true));
        assert!(!window.is_bound(t0 + Duration::from_millis(1_200), 2, PER, true));
    }

    #[test]
    fn test_retry_after_is_one_past_expiry() {
        let t0 = Instant::now();
        let mut window = RateWindow::new();
        window.record(t0);
        window.record(t0);

        assert_eq!(window.retry_after(t0, 2, PER), Duration::from_millis(1_001));
        assert_eq!(
            window.retry_after(t0 + Duration::from_millis(250), 2, PER),
            Duration::from_millis(751)
        );
        // Already expired: fire almost immediately
        assert_eq!(
            window.retry_after(t0 + Duration::from_millis(5_000), 2, PER),
            Duration::from_millis(1)
        );
    }

    proptest! {
        #[test]
        fn prop_never_more_than_rate_per_window(
            rate in 1u32..6,
            per_ms in 1u64..2_000,
            gaps in proptest::collection::vec(0u64..400, 1..200),
        ) {
            let per = Duration::from_millis(per_ms);
            let t0 = Instant::now();
            let mut window = RateWindow::new();
            let mut admitted = Vec::new();
            let mut now = t0;

            for gap in gaps {
                now += Duration::from_millis(gap);
                window.trim(rate);
                if !window.is_bound(now, rate, per, true) {
                    window.record(now);
                    admitted.push(now);
                }
                prop_assert!(window.len() <= rate as usize + 1);
            }

            let rate = rate as usize;
            for i in rate..admitted.len() {
                prop_assert!(admitted[i].duration_since(admitted[i - rate]) >= per);
            }
        }
    }
}
