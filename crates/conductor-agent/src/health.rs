//! Consecutive-failure health accounting.

use std::sync::atomic::{AtomicU32, Ordering};

/// Tracks consecutive probe failures. The transition to failed fires on
/// exactly the `threshold`-th consecutive miss; any success resets.
#[derive(Debug)]
pub struct HealthMonitor {
    threshold: u32,
    failures: AtomicU32,
}

impl HealthMonitor {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            failures: AtomicU32::new(0),
        }
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }

    /// Record a miss; returns true when this miss crossed the threshold.
    pub fn record_failure(&self) -> bool {
        let count = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        count == self.threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn is_failed(&self) -> bool {
        self.consecutive_failures() >= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_third_failure_trips() {
        let monitor = HealthMonitor::new(3);
        assert!(!monitor.record_failure());
        assert!(!monitor.record_failure());
        assert!(monitor.record_failure());
        assert!(monitor.is_failed());
        // A fourth miss does not re-fire the transition.
        assert!(!monitor.record_failure());
    }

    #[test]
    fn test_success_resets_counter() {
        let monitor = HealthMonitor::new(3);
        monitor.record_failure();
        monitor.record_failure();
        monitor.record_success();
        assert_eq!(monitor.consecutive_failures(), 0);
        assert!(!monitor.record_failure());
        assert!(!monitor.is_failed());
    }
}
