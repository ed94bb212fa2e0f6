use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Timestamp of the most recent inbound activity on the connection.
///
/// Stored as milliseconds elapsed since the clock was created so it fits in a single atomic.
/// Cloning shares the underlying timestamp.
#[derive(Debug, Clone)]
pub struct ActivityClock {
    origin: Instant,
    last_millis: Arc<AtomicU64>,
}

impl ActivityClock {
    /// Create a clock whose last activity is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_millis: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record activity at the current instant.
    pub fn touch(&self) {
        let now = millis(self.origin.elapsed());
        // `fetch_max` keeps the clock monotonic when two writers race
        self.last_millis.fetch_max(now, Ordering::AcqRel);
    }

    /// Time elapsed since the last recorded activity.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Acquire));
        self.origin.elapsed().saturating_sub(last)
    }

    /// Whether activity has been seen within `window`.
    #[must_use]
    pub fn is_active(&self, window: Duration) -> bool {
        self.idle_for() < window
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn goes_stale_without_activity() {
        let clock = ActivityClock::new();
        assert!(clock.is_active(Duration::from_secs(120)));

        tokio::time::advance(Duration::from_secs(120)).await;

        assert!(!clock.is_active(Duration::from_secs(120)));
    }

    #[tokio::test(start_paused = true)]
    async fn touch_refreshes_shared_clones() {
        let clock = ActivityClock::new();
        let reader_side = clock.clone();

        tokio::time::advance(Duration::from_secs(150)).await;
        reader_side.touch();

        assert!(clock.is_active(Duration::from_secs(120)));
        assert_eq!(clock.idle_for(), Duration::ZERO);
    }
}
