//! Bounded in-memory store of task results, indexed by task id.

use crate::config::ResultStoreSection;
use crate::ids::TaskId;
use crate::task::TaskResult;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

struct StoreInner {
    results: HashMap<TaskId, TaskResult>,
    /// Insertion order, oldest first, for size-bounded eviction.
    order: VecDeque<TaskId>,
}

/// Retains the most recent `TaskResult` per task id until evicted by size
/// or age. Writes take the write lock; queries share the read lock.
pub struct ResultStore {
    max_entries: usize,
    max_age_secs: u64,
    inner: RwLock<StoreInner>,
}

impl ResultStore {
    pub fn new(config: &ResultStoreSection) -> Self {
        Self {
            max_entries: config.max_entries.max(1),
            max_age_secs: config.max_age_secs,
            inner: RwLock::new(StoreInner {
                results: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn insert(&self, result: TaskResult) {
        let mut inner = self.inner.write().expect("result store lock poisoned");
        let task_id = result.task_id.clone();
        if inner.results.insert(task_id.clone(), result).is_none() {
            inner.order.push_back(task_id);
        }

        while inner.order.len() > self.max_entries {
            if let Some(evicted) = inner.order.pop_front() {
                inner.results.remove(&evicted);
            }
        }

        if self.max_age_secs > 0 {
            let cutoff = Utc::now() - ChronoDuration::seconds(self.max_age_secs as i64);
            while let Some(front) = inner.order.front() {
                let expired = inner
                    .results
                    .get(front)
                    .map(|r| r.timestamp < cutoff)
                    .unwrap_or(true);
                if !expired {
                    break;
                }
                if let Some(evicted) = inner.order.pop_front() {
                    inner.results.remove(&evicted);
                }
            }
        }
    }

    pub fn get(&self, task_id: &TaskId) -> Option<TaskResult> {
        self.inner
            .read()
            .expect("result store lock poisoned")
            .results
            .get(task_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("result store lock poisoned")
            .results
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
