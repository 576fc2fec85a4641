use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobq_core::RateLimit;

/// Sliding-window log: at most `max` dequeues within any trailing
/// `duration_ms` window.
#[derive(Debug)]
pub(crate) struct SlidingWindow {
    limit: RateLimit,
    granted: VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    pub(crate) fn new(limit: RateLimit) -> Self {
        Self { limit, granted: VecDeque::with_capacity(limit.max as usize) }
    }

    pub(crate) fn limit(&self) -> RateLimit {
        self.limit
    }

    fn window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.limit.duration_ms as i64)
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window();
        while self.granted.front().is_some_and(|at| *at <= cutoff) {
            self.granted.pop_front();
        }
    }

    /// `Ok` when a dequeue is allowed now, otherwise how long until the
    /// oldest grant leaves the window.
    pub(crate) fn check(&mut self, now: DateTime<Utc>) -> Result<(), Duration> {
        self.prune(now);
        if (self.granted.len() as u32) < self.limit.max {
            return Ok(());
        }
        let oldest = self.granted.front().copied().unwrap_or(now);
        let wait = (oldest + self.window() - now).num_milliseconds().max(1);
        Err(Duration::from_millis(wait as u64))
    }

    pub(crate) fn record(&mut self, now: DateTime<Utc>) {
        self.granted.push_back(now);
    }
}
