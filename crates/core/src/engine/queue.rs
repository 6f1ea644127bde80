//! Priority Queue Set
//!
//! One bounded FIFO per priority tier. `push` never blocks: a full tier is
//! reported as `EngineError::QueueFull`. `next` scans tiers from Critical to
//! Background and returns the head of the first non-empty one, parking the
//! caller on a condition variable while every tier is empty.
//!
//! Dispatch is strictly non-preemptive and has no anti-starvation aging.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};

use crate::config::QueueCapacity;
use crate::error::{EngineError, EngineResult};

use super::{ScheduledTask, TaskPriority};

/// Bounded per-tier queues with strict-priority pop order
pub struct PriorityQueueSet {
    critical: ArrayQueue<ScheduledTask>,
    high: ArrayQueue<ScheduledTask>,
    normal: ArrayQueue<ScheduledTask>,
    low: ArrayQueue<ScheduledTask>,
    background: ArrayQueue<ScheduledTask>,
    capacities: QueueCapacity,
    /// Guards the wait/notify handshake only; the tiers are lock-free
    signal: Mutex<()>,
    available: Condvar,
    total_pushed: AtomicU64,
    total_popped: AtomicU64,
}

impl PriorityQueueSet {
    /// Create queue set; every capacity must be at least 1
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Configuration` if any tier capacity is zero or
    /// above [`QueueCapacity::MAX_PER_TIER`].
    pub fn new(capacities: QueueCapacity) -> EngineResult<Self> {
        for priority in TaskPriority::ALL {
            let capacity = capacities.for_priority(priority);
            if !(1..=QueueCapacity::MAX_PER_TIER).contains(&capacity) {
                return Err(EngineError::config(
                    format!("queue.{priority}"),
                    format!(
                        "tier capacity must be between 1 and {}",
                        QueueCapacity::MAX_PER_TIER
                    ),
                ));
            }
        }

        Ok(Self {
            critical: ArrayQueue::new(capacities.critical),
            high: ArrayQueue::new(capacities.high),
            normal: ArrayQueue::new(capacities.normal),
            low: ArrayQueue::new(capacities.low),
            background: ArrayQueue::new(capacities.background),
            capacities,
            signal: Mutex::new(()),
            available: Condvar::new(),
            total_pushed: AtomicU64::new(0),
            total_popped: AtomicU64::new(0),
        })
    }

    const fn tier(&self, priority: TaskPriority) -> &ArrayQueue<ScheduledTask> {
        match priority {
            TaskPriority::Critical => &self.critical,
            TaskPriority::High => &self.high,
            TaskPriority::Normal => &self.normal,
            TaskPriority::Low => &self.low,
            TaskPriority::Background => &self.background,
        }
    }

    /// Append to the task's tier
    ///
    /// # Errors
    ///
    /// Returns `EngineError::QueueFull` if the tier is at capacity.
    pub fn push(&self, task: ScheduledTask) -> EngineResult<()> {
        let priority = task.priority();
        if self.tier(priority).push(task).is_err() {
            return Err(EngineError::QueueFull {
                priority,
                capacity: self.capacities.for_priority(priority),
            });
        }
        self.total_pushed.fetch_add(1, Ordering::Relaxed);

        // Taking the lock orders this notify after any waiter's emptiness check
        let _guard = self.signal.lock();
        self.available.notify_one();
        Ok(())
    }

    /// Pop from the highest non-empty tier without waiting
    pub fn try_next(&self) -> Option<ScheduledTask> {
        let task = TaskPriority::ALL
            .into_iter()
            .find_map(|priority| self.tier(priority).pop())?;
        self.total_popped.fetch_add(1, Ordering::Relaxed);
        Some(task)
    }

    /// Pop from the highest non-empty tier, waiting up to `timeout`
    pub fn next(&self, timeout: Duration) -> Option<ScheduledTask> {
        if let Some(task) = self.try_next() {
            return Some(task);
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self.signal.lock();
        loop {
            if let Some(task) = self.try_next() {
                return Some(task);
            }
            if self.available.wait_until(&mut guard, deadline).timed_out() {
                return self.try_next();
            }
        }
    }

    /// Wake every waiter so it can re-check its stop signal
    pub fn wake_all(&self) {
        let _guard = self.signal.lock();
        self.available.notify_all();
    }

    /// Remove every queued task, highest tier first
    pub fn drain(&self) -> Vec<ScheduledTask> {
        let mut drained = Vec::with_capacity(self.len());
        while let Some(task) = self.try_next() {
            drained.push(task);
        }
        drained
    }

    /// Current length of each tier in scan order
    #[must_use]
    pub fn lengths(&self) -> [usize; 5] {
        TaskPriority::ALL.map(|priority| self.tier(priority).len())
    }

    /// Length of one tier
    #[must_use]
    pub fn tier_len(&self, priority: TaskPriority) -> usize {
        self.tier(priority).len()
    }

    /// Sum over all tiers
    #[must_use]
    pub fn len(&self) -> usize {
        self.lengths().iter().sum()
    }

    /// Whether every tier is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        TaskPriority::ALL
            .into_iter()
            .all(|priority| self.tier(priority).is_empty())
    }

    /// Configured capacities
    #[must_use]
    pub const fn capacities(&self) -> &QueueCapacity {
        &self.capacities
    }

    /// Lifetime (pushed, popped) counters
    #[must_use]
    pub fn totals(&self) -> (u64, u64) {
        (
            self.total_pushed.load(Ordering::Relaxed),
            self.total_popped.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Task;
    use crate::types::TaskId;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;

    fn scheduled(priority: TaskPriority, n: u64) -> ScheduledTask {
        let task = Task::from_fn(json!(n), |payload, _ctx| Ok(payload.clone()))
            .with_priority(priority);
        ScheduledTask::new(TaskId::new(), task)
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut capacities = QueueCapacity::uniform(4);
        capacities.high = 0;
        assert!(matches!(
            PriorityQueueSet::new(capacities),
            Err(EngineError::Configuration { .. })
        ));

        capacities.high = QueueCapacity::MAX_PER_TIER + 1;
        assert!(matches!(
            PriorityQueueSet::new(capacities),
            Err(EngineError::Configuration { ref field, .. }) if field == "queue.high"
        ));
    }

    #[test]
    fn test_strict_priority_order() -> EngineResult<()> {
        let queue = PriorityQueueSet::new(QueueCapacity::uniform(8))?;
        queue.push(scheduled(TaskPriority::Background, 1))?;
        queue.push(scheduled(TaskPriority::Normal, 2))?;
        queue.push(scheduled(TaskPriority::Critical, 3))?;
        queue.push(scheduled(TaskPriority::High, 4))?;

        let order: Vec<TaskPriority> = queue.drain().iter().map(ScheduledTask::priority).collect();
        assert_eq!(
            order,
            vec![
                TaskPriority::Critical,
                TaskPriority::High,
                TaskPriority::Normal,
                TaskPriority::Background
            ]
        );
        Ok(())
    }

    #[test]
    fn test_fifo_within_tier() -> EngineResult<()> {
        let queue = PriorityQueueSet::new(QueueCapacity::uniform(8))?;
        let ids: Vec<TaskId> = (0..5)
            .map(|n| {
                let task = scheduled(TaskPriority::Normal, n);
                let id = task.id;
                queue.push(task).map(|()| id)
            })
            .collect::<EngineResult<_>>()?;

        let popped: Vec<TaskId> = queue.drain().iter().map(|t| t.id).collect();
        assert_eq!(popped, ids);
        Ok(())
    }

    #[test]
    fn test_full_tier_rejects() -> EngineResult<()> {
        let mut capacities = QueueCapacity::uniform(8);
        capacities.low = 1;
        let queue = PriorityQueueSet::new(capacities)?;

        queue.push(scheduled(TaskPriority::Low, 1))?;
        let err = queue.push(scheduled(TaskPriority::Low, 2));
        assert_eq!(
            err,
            Err(EngineError::QueueFull {
                priority: TaskPriority::Low,
                capacity: 1
            })
        );
        // other tiers unaffected
        queue.push(scheduled(TaskPriority::Normal, 3))?;
        assert_eq!(queue.lengths(), [0, 0, 1, 1, 0]);
        assert_eq!(queue.len(), 2);
        Ok(())
    }

    #[test]
    fn test_next_times_out_when_empty() -> EngineResult<()> {
        let queue = PriorityQueueSet::new(QueueCapacity::uniform(2))?;
        let start = Instant::now();
        assert!(queue.next(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
        Ok(())
    }

    #[test]
    fn test_next_wakes_on_push() -> EngineResult<()> {
        let queue = Arc::new(PriorityQueueSet::new(QueueCapacity::uniform(2))?);
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.next(Duration::from_secs(5)).map(|t| t.priority()))
        };

        thread::sleep(Duration::from_millis(20));
        queue.push(scheduled(TaskPriority::High, 1))?;

        let received = consumer.join().ok().flatten();
        assert_eq!(received, Some(TaskPriority::High));
        assert_eq!(queue.totals(), (1, 1));
        Ok(())
    }
}
