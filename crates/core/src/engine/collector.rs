//! Result Collector
//!
//! Registry of every task the engine currently knows about. An entry is
//! reserved at submission (which is how duplicate ids are detected), marked
//! running by the worker that dequeues it, completed by the monitor when the
//! result arrives, and finally retired once the retention window has elapsed.
//! Retired ids leave a bare tombstone behind so they can never be reused.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::TaskId;

use super::TaskResult;

/// Lifecycle of a known task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Waiting in a tier
    Queued,
    /// Picked up by a worker
    Running,
    /// Result collected
    Completed,
}

#[derive(Debug)]
struct TaskRecord {
    state: TaskState,
    result: Option<TaskResult>,
    completed_at: Option<Instant>,
}

/// Task registry and result store
pub struct ResultCollector {
    records: DashMap<TaskId, TaskRecord>,
    tombstones: DashSet<TaskId>,
    signal: Mutex<()>,
    completed: Condvar,
}

impl Default for ResultCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultCollector {
    /// Create empty collector
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            tombstones: DashSet::new(),
            signal: Mutex::new(()),
            completed: Condvar::new(),
        }
    }

    /// Claim `id` for a new submission
    ///
    /// # Errors
    ///
    /// Returns `EngineError::DuplicateId` if the id was ever accepted before.
    pub fn reserve(&self, id: TaskId) -> EngineResult<()> {
        // The shard lock held by the entry orders this check against retire_stale
        match self.records.entry(id) {
            Entry::Occupied(_) => Err(EngineError::DuplicateId { task_id: id }),
            Entry::Vacant(_) if self.tombstones.contains(&id) => {
                Err(EngineError::DuplicateId { task_id: id })
            }
            Entry::Vacant(slot) => {
                slot.insert(TaskRecord {
                    state: TaskState::Queued,
                    result: None,
                    completed_at: None,
                });
                Ok(())
            }
        }
    }

    /// Drop a reservation whose submission was rejected
    pub fn release(&self, id: &TaskId) {
        self.records
            .remove_if(id, |_, record| record.state == TaskState::Queued);
    }

    /// Mark a task as picked up
    pub fn mark_running(&self, id: &TaskId) {
        if let Some(mut record) = self.records.get_mut(id) {
            if record.state == TaskState::Queued {
                record.state = TaskState::Running;
            }
        }
    }

    /// Store a result and wake waiters
    pub fn complete(&self, result: TaskResult) {
        self.records.insert(
            result.task_id,
            TaskRecord {
                state: TaskState::Completed,
                result: Some(result),
                completed_at: Some(Instant::now()),
            },
        );

        let _guard = self.signal.lock();
        self.completed.notify_all();
    }

    /// Whether a result (successful or not) has been collected for `id`
    #[must_use]
    pub fn has_result(&self, id: &TaskId) -> bool {
        self.records
            .get(id)
            .is_some_and(|record| record.result.is_some())
    }

    /// Collected result, if any
    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<TaskResult> {
        self.records.get(id).and_then(|record| record.result.clone())
    }

    /// Current lifecycle state, `None` if unknown or retired
    #[must_use]
    pub fn state(&self, id: &TaskId) -> Option<TaskState> {
        self.records.get(id).map(|record| record.state)
    }

    /// Wait up to `timeout` for the result of `id`
    pub fn wait(&self, id: &TaskId, timeout: Duration) -> Option<TaskResult> {
        if let Some(result) = self.get(id) {
            return Some(result);
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self.signal.lock();
        loop {
            if let Some(result) = self.get(id) {
                return Some(result);
            }
            if self.completed.wait_until(&mut guard, deadline).timed_out() {
                return self.get(id);
            }
        }
    }

    /// Drop results older than `retention`, keeping only their ids; returns how many were retired
    pub fn retire_stale(&self, retention: Duration) -> usize {
        self.retire_stale_at(Instant::now(), retention)
    }

    /// Retire completed records older than `retention` as of `now`
    pub fn retire_stale_at(&self, now: Instant, retention: Duration) -> usize {
        let before = self.records.len();
        self.records.retain(|id, record| {
            let keep = record
                .completed_at
                .map_or(true, |at| now.saturating_duration_since(at) <= retention);
            if !keep {
                self.tombstones.insert(*id);
            }
            keep
        });
        before.saturating_sub(self.records.len())
    }

    /// Ids whose results have been retired
    #[must_use]
    pub fn retired_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Tasks with a live record (queued, running or retained)
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no task is known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
