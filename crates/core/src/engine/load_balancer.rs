//! Load-Aware Assignment Helper
//!
//! Scores live workers for direct-to-worker routing. It sits beside the
//! queue-pull path rather than inside it: workers keep pulling from the
//! priority queues, and callers that want sticky routing ask
//! [`LoadAwareAssigner::select_worker`] which worker is the best fit.
//!
//! Score for a worker with load `l` and capability `c`, given task complexity `x`:
//!
//! ```text
//! (1 / (1 + l)) * c * (1 / (1 + |x - c|))
//! ```

use std::cmp::Ordering;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::FeedbackConfig;
use crate::types::WorkerId;

/// Assignment errors
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoadBalancerError {
    /// No workers registered
    #[error("No workers available")]
    NoWorkersAvailable,

    /// Worker not registered
    #[error("Unknown worker: {worker_id}")]
    UnknownWorker {
        /// Requested worker
        worker_id: WorkerId,
    },
}

/// Per-worker load and capability estimate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkerLoadInfo {
    /// Current load; 1.0 while executing, 0.0 when idle
    pub load: f64,
    /// Smoothed recent performance in [0, 1]
    pub capability: f64,
    /// Times this worker was chosen by `select_worker`
    pub assignments: u64,
}

/// Scores workers by load and capability fit
pub struct LoadAwareAssigner {
    workers: DashMap<WorkerId, WorkerLoadInfo>,
    smoothing: f64,
    initial_capability: f64,
}

impl LoadAwareAssigner {
    /// Create assigner using the feedback smoothing parameters
    #[must_use]
    pub fn new(config: &FeedbackConfig) -> Self {
        Self {
            workers: DashMap::new(),
            smoothing: config.capability_smoothing,
            initial_capability: config.initial_capability,
        }
    }

    /// Start tracking a worker
    pub fn register(&self, worker_id: WorkerId) {
        self.workers.insert(
            worker_id,
            WorkerLoadInfo {
                load: 0.0,
                capability: self.initial_capability,
                assignments: 0,
            },
        );
    }

    /// Stop tracking a worker
    pub fn unregister(&self, worker_id: WorkerId) {
        self.workers.remove(&worker_id);
    }

    /// Update current load
    pub fn set_load(&self, worker_id: WorkerId, load: f64) {
        if let Some(mut info) = self.workers.get_mut(&worker_id) {
            info.load = load.max(0.0);
        }
    }

    /// Fold a performance value into the worker's capability (exponential smoothing)
    pub fn record_performance(&self, worker_id: WorkerId, performance: f64) {
        if let Some(mut info) = self.workers.get_mut(&worker_id) {
            let sample = performance.clamp(0.0, 1.0);
            info.capability = self
                .smoothing
                .mul_add(sample - info.capability, info.capability);
        }
    }

    /// Snapshot of one worker
    ///
    /// # Errors
    ///
    /// Returns `LoadBalancerError::UnknownWorker` if the worker is not registered.
    pub fn info(&self, worker_id: WorkerId) -> Result<WorkerLoadInfo, LoadBalancerError> {
        self.workers
            .get(&worker_id)
            .map(|info| *info)
            .ok_or(LoadBalancerError::UnknownWorker { worker_id })
    }

    /// Fit score of a worker for a task of the given complexity
    #[must_use]
    pub fn score(info: &WorkerLoadInfo, complexity: f64) -> f64 {
        let load_factor = 1.0 / (1.0 + info.load);
        let fit = 1.0 / (1.0 + (complexity - info.capability).abs());
        load_factor * info.capability * fit
    }

    /// Pick the highest-scoring worker; ties go to the lowest id
    ///
    /// # Errors
    ///
    /// Returns `LoadBalancerError::NoWorkersAvailable` if no worker is registered.
    pub fn select_worker(&self, complexity: f64) -> Result<WorkerId, LoadBalancerError> {
        let mut best: Option<(WorkerId, f64)> = None;
        for entry in &self.workers {
            let (id, score) = (*entry.key(), Self::score(entry.value(), complexity));
            let better = best.map_or(true, |(best_id, best_score)| {
                match score.total_cmp(&best_score) {
                    Ordering::Greater => true,
                    Ordering::Equal => id < best_id,
                    Ordering::Less => false,
                }
            });
            if better {
                best = Some((id, score));
            }
        }

        let (worker_id, _) = best.ok_or(LoadBalancerError::NoWorkersAvailable)?;
        if let Some(mut info) = self.workers.get_mut(&worker_id) {
            info.assignments += 1;
        }
        ::metrics::counter!("flowgate.assigner.selections").increment(1);
        Ok(worker_id)
    }

    /// Registered worker count
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether no worker is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
