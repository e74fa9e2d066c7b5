//! Wall-clock timestamps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Issues write timestamps that strictly increase on one replica, even when
/// the wall clock stalls or steps back.
#[derive(Debug, Default)]
pub struct Clock {
    last: AtomicU64,
}

impl Clock {
    /// Creates a clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a timestamp greater than every one issued or observed before.
    pub fn stamp(&self) -> u64 {
        let now = now_ms();
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let next = now.max(current.saturating_add(1));
            match self
                .last
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Records a timestamp seen on another replica so later stamps exceed it.
    pub fn observe(&self, timestamp: u64) {
        self.last.fetch_max(timestamp, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_strictly_increase() {
        let clock = Clock::new();
        let a = clock.stamp();
        let b = clock.stamp();
        let c = clock.stamp();
        assert!(a < b && b < c);
    }

    #[test]
    fn observed_future_timestamps_are_exceeded() {
        let clock = Clock::new();
        let future = now_ms() + 60_000;
        clock.observe(future);
        assert_eq!(clock.stamp(), future + 1);
    }

    #[test]
    fn largest_timestamp_does_not_overflow() {
        let clock = Clock::new();
        clock.observe(u64::MAX);
        assert_eq!(clock.stamp(), u64::MAX);
        assert_eq!(clock.stamp(), u64::MAX);
    }
}
