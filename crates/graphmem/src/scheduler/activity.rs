//! Interactive-activity tracking that gates background work

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Lock-free record of the last interactive touch. Background tasks that
/// require quiet consult this before running.
pub struct ActivityTracker {
    last_activity_ms: AtomicI64,
    quiet_threshold: Duration,
}

impl ActivityTracker {
    pub fn new(quiet_threshold: Duration) -> Self {
        Self {
            last_activity_ms: AtomicI64::new(0),
            quiet_threshold,
        }
    }

    pub fn mark_activity(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// True while the last interactive touch is within the quiet threshold
    pub fn is_active(&self) -> bool {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        if last == 0 {
            return false;
        }
        let elapsed = Utc::now().timestamp_millis().saturating_sub(last);
        elapsed >= 0 && (elapsed as u128) < self.quiet_threshold.as_millis()
    }

    /// Time since the last activity, `None` if none was ever recorded
    pub fn idle_for(&self) -> Option<Duration> {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        let elapsed = Utc::now().timestamp_millis().saturating_sub(last).max(0);
        Some(Duration::from_millis(elapsed as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_before_any_activity() {
        let tracker = ActivityTracker::new(Duration::from_secs(30));
        assert!(!tracker.is_active());
        assert!(tracker.idle_for().is_none());
    }

    #[test]
    fn test_active_after_mark() {
        let tracker = ActivityTracker::new(Duration::from_secs(30));
        tracker.mark_activity();

        assert!(tracker.is_active());
        assert!(tracker.idle_for().unwrap() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_activity_expires() {
        let tracker = ActivityTracker::new(Duration::from_millis(50));
        tracker.mark_activity();
        assert!(tracker.is_active());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!tracker.is_active());
    }
}
