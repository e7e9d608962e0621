//! Bounded priority queue of pending tasks.

use conductor_core::config::TaskQueueSection;
use conductor_core::ids::TaskId;
use conductor_core::task::Task;
use conductor_core::{Error, Result};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};

/// A queued task with its tie-breaking sequence number.
#[derive(Debug)]
struct QueuedTask {
    task: Task,
    seq: u64,
    enqueued_at: Instant,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then FIFO by sequence.
        match self.task.priority.cmp(&other.task.priority) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ordering => ordering,
        }
    }
}

/// One entry of a queue snapshot.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub task_id: TaskId,
    pub priority: u8,
    pub age: Duration,
}

struct QueueInner {
    heap: BinaryHeap<QueuedTask>,
    resident: HashSet<TaskId>,
    next_seq: u64,
}

/// Bounded, priority-ordered, FIFO-within-priority task queue. An optional
/// aging rate raises a task's effective priority as it waits, so low
/// priorities cannot starve.
pub struct TaskQueue {
    capacity: usize,
    aging_rate: f64,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new(config: &TaskQueueSection) -> Self {
        Self {
            capacity: config.max_size.max(1),
            aging_rate: config.aging_rate.max(0.0),
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                resident: HashSet::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Add a task. Fails with `QueueFull` at capacity; a task id already
    /// resident is a submitter error.
    pub fn enqueue(&self, task: Task) -> Result<()> {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            if inner.heap.len() >= self.capacity {
                return Err(Error::QueueFull {
                    capacity: self.capacity,
                });
            }
            if !inner.resident.insert(task.task_id.clone()) {
                return Err(Error::TaskValidation(format!(
                    "task {} is already queued",
                    task.task_id
                )));
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(QueuedTask {
                task,
                seq,
                enqueued_at: Instant::now(),
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the next task if one is queued. Popping is the reservation: a
    /// task leaves the queue exactly once.
    pub fn try_dequeue(&self) -> Option<Task> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let popped = if self.aging_rate > 0.0 {
            Self::pop_aged(&mut inner.heap, self.aging_rate)
        } else {
            inner.heap.pop()
        }?;
        inner.resident.remove(&popped.task.task_id);
        Some(popped.task)
    }

    /// Pop honoring age-boosted priorities. The heap order ignores aging,
    /// so scan for the winner and rebuild; queues are small enough that
    /// the linear pass is cheap.
    fn pop_aged(heap: &mut BinaryHeap<QueuedTask>, rate: f64) -> Option<QueuedTask> {
        if heap.is_empty() {
            return None;
        }
        let now = Instant::now();
        let entries: Vec<QueuedTask> = std::mem::take(heap).into_vec();

        let winner_seq = entries
            .iter()
            .max_by(|a, b| {
                let eff_a = effective_priority(a, now, rate);
                let eff_b = effective_priority(b, now, rate);
                eff_a
                    .partial_cmp(&eff_b)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|entry| entry.seq)?;

        let mut winner = None;
        for entry in entries {
            if entry.seq == winner_seq {
                winner = Some(entry);
            } else {
                heap.push(entry);
            }
        }
        winner
    }

    /// Wait up to `deadline` for a task.
    pub async fn dequeue(&self, deadline: Duration) -> Option<Task> {
        let end = Instant::now() + deadline;
        loop {
            if let Some(task) = self.try_dequeue() {
                return Some(task);
            }
            let now = Instant::now();
            if now >= end {
                return None;
            }
            let _ = timeout(end - now, self.notify.notified()).await;
        }
    }

    /// Withdraw a task that was enqueued but will not be dispatched.
    pub fn remove(&self, task_id: &TaskId) -> bool {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if !inner.resident.remove(task_id) {
            return false;
        }
        let entries: Vec<QueuedTask> = std::mem::take(&mut inner.heap).into_vec();
        for entry in entries {
            if entry.task.task_id != *task_id {
                inner.heap.push(entry);
            }
        }
        true
    }

    pub fn size(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Current contents in dispatch order, for introspection.
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        let mut entries: Vec<&QueuedTask> = inner.heap.iter().collect();
        entries.sort_by(|a, b| {
            b.task
                .priority
                .cmp(&a.task.priority)
                .then_with(|| a.seq.cmp(&b.seq))
        });
        let now = Instant::now();
        entries
            .into_iter()
            .map(|entry| QueueEntry {
                task_id: entry.task.task_id.clone(),
                priority: entry.task.priority,
                age: now.saturating_duration_since(entry.enqueued_at),
            })
            .collect()
    }
}

fn effective_priority(entry: &QueuedTask, now: Instant, rate: f64) -> f64 {
    let age = now.saturating_duration_since(entry.enqueued_at).as_secs_f64();
    entry.task.priority as f64 + age * rate
}
