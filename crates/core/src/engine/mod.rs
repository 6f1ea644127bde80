//! Flowgate Engine - Adaptive Priority Task Engine
//!
//! An explicit engine instance owns every component; there is no global state.
//!
//! # Architecture
//!
//! ```text
//!  submit ──► PriorityQueueSet ──► WorkerPool (N threads) ──► result channel
//!              (5 bounded tiers)      │   ▲                        │
//!                                     │   │ spawn / retire         ▼
//!                    FeedbackModel ◄──┘   │                  Monitor thread
//!                                         │          ┌───── ResultCollector
//!                                         │          ├───── MetricsAggregator
//!                                         └──────────┴───── AdaptiveController
//! ```
//!
//! Workers pull tasks in strict priority order, run them, and hand results to
//! the monitor over a bounded channel. The monitor stores results, recomputes
//! [`SystemMetrics`] on its interval and lets the [`AdaptiveController`] resize
//! the pool and retune its own cadence.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, TaskError};
use crate::types::{TaskId, WorkerId};

pub mod collector;
pub mod controller;
pub mod feedback;
pub mod load_balancer;
pub mod metrics;
mod monitor;
pub mod queue;
pub mod result;
pub mod task;
pub mod worker;

pub use collector::{ResultCollector, TaskState};
pub use controller::{
    AdaptationAction, AdaptationRecord, AdaptationTrigger, AdaptiveController, ControlParams,
    ControllerState, PoolControl,
};
pub use feedback::{ExperienceRecord, FeatureVector, PerformanceFeedbackModel};
pub use load_balancer::{LoadAwareAssigner, LoadBalancerError, WorkerLoadInfo};
pub use metrics::{MetricsAggregator, SystemMetrics};
pub use queue::PriorityQueueSet;
pub use result::{AdaptationSnapshot, PerformanceMetrics, TaskResult};
pub use task::{Executable, ExecutionContext, ScheduledTask, Task, TaskPriority};
pub use worker::{WorkerContext, WorkerPool, WorkerStatSnapshot, WorkerState};

#[cfg(test)]
pub use task::MockExecutable;

use monitor::{MonitorContext, MonitorHandle};

/// Engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// Constructed, never started
    Created,
    /// Accepting and executing tasks
    Running,
    /// `stop` in progress
    Stopping,
    /// Stopped; may be started again
    Stopped,
}

impl EngineState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Running,
            2 => Self::Stopping,
            3 => Self::Stopped,
            _ => Self::Created,
        }
    }
}

/// Point-in-time view of the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    /// Lifecycle state
    pub state: EngineState,
    /// Live workers
    pub worker_count: usize,
    /// Tier lengths, Critical first
    pub queue_lengths: [usize; 5],
    /// Latest metrics snapshot with a live queue length
    pub metrics: SystemMetrics,
    /// Most recent controller pass
    pub last_adaptation: Option<AdaptationRecord>,
    /// Controller state machine position
    pub controller_state: ControllerState,
    /// Completed tasks between scheduled passes
    pub adaptation_frequency: u64,
    /// Current monitor tick
    pub metrics_interval: Duration,
    /// Per-worker statistics
    pub workers: Vec<WorkerStatSnapshot>,
}

/// Adaptive priority task engine
pub struct Engine {
    config: Arc<EngineConfig>,
    state: AtomicU8,
    queue: Arc<PriorityQueueSet>,
    collector: Arc<ResultCollector>,
    feedback: Arc<PerformanceFeedbackModel>,
    aggregator: Arc<MetricsAggregator>,
    assigner: Arc<LoadAwareAssigner>,
    controller: Arc<AdaptiveController>,
    pool: Arc<WorkerPool>,
    results: Receiver<TaskResult>,
    monitor: Option<MonitorHandle>,
}

impl Engine {
    /// Create a stopped engine
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Configuration` if the configuration is invalid
    /// (for example zero workers or a zero-capacity tier).
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let queue = Arc::new(PriorityQueueSet::new(config.queue)?);
        let collector = Arc::new(ResultCollector::new());
        let feedback = Arc::new(PerformanceFeedbackModel::new(config.feedback.clone()));
        let aggregator = Arc::new(MetricsAggregator::new(config.metrics.clone()));
        let assigner = Arc::new(LoadAwareAssigner::new(&config.feedback));
        let params = Arc::new(ControlParams::new(&config));
        let controller = Arc::new(AdaptiveController::new(Arc::clone(&config), params));

        let (results_tx, results) = channel::bounded(config.result_channel_capacity);
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&config),
            WorkerContext {
                queue: Arc::clone(&queue),
                collector: Arc::clone(&collector),
                feedback: Arc::clone(&feedback),
                assigner: Arc::clone(&assigner),
                results: results_tx,
            },
        ));

        Ok(Self {
            config,
            state: AtomicU8::new(EngineState::Created as u8),
            queue,
            collector,
            feedback,
            aggregator,
            assigner,
            controller,
            pool,
            results,
            monitor: None,
        })
    }

    /// Lifecycle state
    #[must_use]
    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Check if engine is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the initial workers and the monitor
    ///
    /// Starting a stopped engine resets metrics, experience history and
    /// controller parameters; queued tasks and retained results persist.
    /// Threads left running by a previous `stop` still count toward
    /// `max_workers`, so they are given up to the shutdown grace to exit.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::AlreadyRunning` if running, or
    /// `EngineError::WorkerSpawn` if a thread cannot be started or the
    /// lingering threads leave no room for the initial workers.
    pub fn start(&mut self) -> EngineResult<()> {
        if matches!(self.state(), EngineState::Running | EngineState::Stopping) {
            return Err(EngineError::AlreadyRunning);
        }
        self.config.validate()?;

        self.aggregator.reset();
        self.feedback.reset();
        self.controller.reset();
        self.pool.reopen();
        let lingering = self.pool.await_retired(self.config.shutdown_grace());
        if lingering > 0 {
            warn!("{lingering} worker threads from the previous run are still finishing");
        }

        for _ in 0..self.config.initial_workers {
            if let Err(e) = self.pool.spawn_worker() {
                self.pool.shutdown(self.config.shutdown_grace());
                return Err(e.into());
            }
        }

        let context = MonitorContext {
            config: Arc::clone(&self.config),
            queue: Arc::clone(&self.queue),
            collector: Arc::clone(&self.collector),
            feedback: Arc::clone(&self.feedback),
            aggregator: Arc::clone(&self.aggregator),
            controller: Arc::clone(&self.controller),
            pool: Arc::clone(&self.pool),
        };
        match MonitorHandle::spawn(context, self.results.clone()) {
            Ok(handle) => self.monitor = Some(handle),
            Err(e) => {
                self.pool.shutdown(self.config.shutdown_grace());
                return Err(e.into());
            }
        }

        self.state
            .store(EngineState::Running as u8, Ordering::Release);
        info!(
            "Engine started with {} workers (max {})",
            self.pool.worker_count(),
            self.config.max_workers
        );
        Ok(())
    }

    /// Stop workers, drain results and cancel anything still queued
    ///
    /// In-flight tasks get up to `shutdown_grace` to finish; workers still
    /// busy after that are detached and logged.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotRunning` if the engine is not running.
    pub fn stop(&mut self) -> EngineResult<()> {
        if self
            .state
            .compare_exchange(
                EngineState::Running as u8,
                EngineState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(EngineError::NotRunning);
        }

        for failure in self.pool.shutdown(self.config.shutdown_grace()) {
            warn!("Worker shutdown: {failure}");
        }

        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }

        let cancelled = self.cancel_queued();
        if cancelled > 0 {
            warn!("Cancelled {cancelled} queued tasks on stop");
        }

        self.state
            .store(EngineState::Stopped as u8, Ordering::Release);
        info!("Engine stopped");
        Ok(())
    }

    fn cancel_queued(&self) -> usize {
        let drained = self.queue.drain();
        let count = drained.len();
        for scheduled in drained {
            let result = TaskResult::failure(
                scheduled.id,
                scheduled.priority(),
                TaskError::Cancelled,
                PerformanceMetrics {
                    duration: Duration::ZERO,
                    queue_wait: scheduled.submitted_at.elapsed(),
                    worker_id: None,
                    payload_size: scheduled.payload_size,
                },
            );
            self.collector.complete(result);
        }
        ::metrics::counter!("flowgate.tasks.completed", "outcome" => "cancelled")
            .increment(u64::try_from(count).unwrap_or(u64::MAX));
        count
    }

    /// Accept a task into its priority tier
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotRunning`, `EngineError::DuplicateId`, or
    /// `EngineError::QueueFull` when the tier is at capacity. Submission never
    /// blocks.
    pub fn submit(&self, task: Task) -> EngineResult<TaskId> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }

        let id = task.id().unwrap_or_else(TaskId::new);
        let priority = task.priority();

        if let Err(e) = self.collector.reserve(id) {
            ::metrics::counter!("flowgate.tasks.rejected", "reason" => "duplicate_id").increment(1);
            return Err(e);
        }

        if let Err(e) = self.queue.push(ScheduledTask::new(id, task)) {
            self.collector.release(&id);
            ::metrics::counter!("flowgate.tasks.rejected", "reason" => "queue_full").increment(1);
            return Err(e);
        }

        ::metrics::counter!("flowgate.tasks.submitted", "tier" => priority.as_str()).increment(1);
        Ok(id)
    }

    /// Wait up to `timeout` for a task's result
    #[must_use]
    pub fn get_result(&self, id: &TaskId, timeout: Duration) -> Option<TaskResult> {
        self.collector.wait(id, timeout)
    }

    /// Lifecycle state of a known task
    #[must_use]
    pub fn task_state(&self, id: &TaskId) -> Option<TaskState> {
        self.collector.state(id)
    }

    /// Current engine status
    #[must_use]
    pub fn status(&self) -> EngineStatus {
        let queue_lengths = self.queue.lengths();
        let mut metrics = self.aggregator.snapshot();
        metrics.queue_length = queue_lengths.iter().sum();
        let params = self.controller.params();

        EngineStatus {
            state: self.state(),
            worker_count: self.pool.worker_count(),
            queue_lengths,
            metrics,
            last_adaptation: self.controller.last_adaptation(),
            controller_state: self.controller.state(),
            adaptation_frequency: params.adaptation_frequency(),
            metrics_interval: params.metrics_interval(),
            workers: self.pool.stats(),
        }
    }

    /// Live worker count
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    /// Per-worker statistics
    #[must_use]
    pub fn worker_stats(&self) -> Vec<WorkerStatSnapshot> {
        self.pool.stats()
    }

    /// Run one controller pass now
    ///
    /// Returns `Ok(None)` if a pass was already in progress.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotRunning` if the engine is not running.
    pub fn adapt_now(&self) -> EngineResult<Option<AdaptationRecord>> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        let mut metrics = self.aggregator.snapshot();
        metrics.queue_length = self.queue.len();
        metrics.worker_count = self.pool.worker_count();
        Ok(self
            .controller
            .run_pass(AdaptationTrigger::Manual, &metrics, self.pool.as_ref()))
    }

    /// Best worker for a task by load and capability fit
    ///
    /// # Errors
    ///
    /// Returns `LoadBalancerError::NoWorkersAvailable` if no worker is live.
    pub fn select_worker(&self, task: &Task) -> Result<WorkerId, LoadBalancerError> {
        self.assigner.select_worker(task.complexity())
    }

    /// Load-aware assignment helper
    #[must_use]
    pub fn assigner(&self) -> &LoadAwareAssigner {
        &self.assigner
    }

    /// Adaptation score of the current experience history
    #[must_use]
    pub fn adaptation_score(&self) -> f64 {
        self.feedback.score()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}
