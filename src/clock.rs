use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Monotonic time source shared by the scheduler, the worker pool and the
/// backend adapter. All timestamps in the system are nanoseconds measured
/// from an epoch fixed when the clock is created, at run start. Wall-clock
/// time is only kept for the report header.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
    wall_start: DateTime<Utc>,
}

impl Clock {
    pub fn start() -> Clock {
        Clock {
            origin: Instant::now(),
            wall_start: Utc::now(),
        }
    }

    /// Nanoseconds elapsed since the run epoch.
    pub fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    pub fn instant_at(&self, at_ns: u64) -> Instant {
        self.origin + Duration::from_nanos(at_ns)
    }

    /// Sleeps until `at_ns` on the monotonic timeline. Returns immediately
    /// when the target is already in the past. Callers that need prompt
    /// cancellation select over this future and their stop channel; the
    /// future drops cleanly at any suspension point.
    pub async fn sleep_until(&self, at_ns: u64) {
        tokio::time::sleep_until(self.instant_at(at_ns)).await;
    }

    pub fn wall_start(&self) -> DateTime<Utc> {
        self.wall_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_now_is_monotonic() {
        let clock = Clock::start();
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_until_lands_on_target() {
        let clock = Clock::start();
        clock.sleep_until(250_000_000).await;
        assert_eq!(clock.now_ns(), 250_000_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_until_past_returns_immediately() {
        let clock = Clock::start();
        tokio::time::advance(Duration::from_millis(10)).await;
        let before = clock.now_ns();
        clock.sleep_until(1_000_000).await;
        assert_eq!(clock.now_ns(), before);
    }
}
