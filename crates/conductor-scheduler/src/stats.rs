//! Run statistics.

use conductor_core::task::{TaskResult, TaskStatus};
use std::sync::atomic::{AtomicU64, Ordering};

/// Completed/failed counters and summed execution time. All fields are
/// atomics so recording never contends with readers.
#[derive(Debug, Default)]
pub struct Stats {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    total_execution_ms: AtomicU64,
}

/// A point-in-time, read-only view.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub total_execution_time: f64,
    pub average_execution_time: f64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: &TaskResult) {
        match result.status {
            TaskStatus::Success => {
                self.tasks_completed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.tasks_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        let millis = (result.execution_time * 1000.0).max(0.0) as u64;
        self.total_execution_ms.fetch_add(millis, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let completed = self.tasks_completed.load(Ordering::Relaxed);
        let failed = self.tasks_failed.load(Ordering::Relaxed);
        let total_ms = self.total_execution_ms.load(Ordering::Relaxed);
        let total = completed + failed;

        let total_execution_time = total_ms as f64 / 1000.0;
        let average_execution_time = if total == 0 {
            0.0
        } else {
            total_execution_time / total as f64
        };

        StatsSnapshot {
            tasks_completed: completed,
            tasks_failed: failed,
            total_execution_time,
            average_execution_time,
        }
    }
}
