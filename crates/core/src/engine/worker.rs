//! Worker Pool
//!
//! Named OS threads pulling from the [`PriorityQueueSet`]. Each worker owns a
//! stop channel that it checks between pulls, so retiring a worker never
//! interrupts a task mid-execution. The pool can grow and shrink at runtime;
//! retired workers are kept aside until their thread has exited so the live
//! thread count never exceeds the configured maximum.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{TaskError, WorkerError};
use crate::types::WorkerId;

use super::{
    AdaptationSnapshot, ExecutionContext, LoadAwareAssigner, PerformanceFeedbackModel,
    PerformanceMetrics, PriorityQueueSet, ResultCollector, ScheduledTask, TaskResult,
};

/// Worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WorkerState {
    /// Waiting for a task
    #[default]
    Idle,
    /// Running a task
    Executing,
    /// Asked to stop, finishing its current task
    Stopping,
    /// Thread has exited
    Stopped,
}

impl WorkerState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Executing,
            2 => Self::Stopping,
            3 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Per-worker statistics; written only by the owning worker thread
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Tasks processed (successful or not)
    pub tasks_processed: AtomicU64,
    /// Failed tasks
    pub errors: AtomicU64,
    /// Total processing time in nanoseconds
    pub total_processing_ns: AtomicU64,
    /// Last task completion (milliseconds since epoch, 0 if never)
    pub last_active_ms: AtomicU64,
}

impl WorkerStats {
    fn record(&self, duration: Duration, success: bool) {
        self.tasks_processed.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.total_processing_ns.fetch_add(
            u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        self.last_active_ms.store(
            u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0),
            Ordering::Relaxed,
        );
    }

    /// Average processing time per task
    #[must_use]
    pub fn average_processing_time(&self) -> Duration {
        let tasks = self.tasks_processed.load(Ordering::Relaxed);
        if tasks == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.total_processing_ns.load(Ordering::Relaxed) / tasks)
    }
}

/// Serializable copy of a worker's statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatSnapshot {
    /// Worker identifier
    pub worker_id: WorkerId,
    /// State at snapshot time
    pub state: WorkerState,
    /// Tasks processed
    pub tasks_processed: u64,
    /// Failed tasks
    pub errors: u64,
    /// Cumulative processing time
    pub total_processing_time: Duration,
    /// Last task completion
    pub last_active: Option<DateTime<Utc>>,
}

/// Handle to one worker thread
pub struct Worker {
    id: WorkerId,
    stats: Arc<WorkerStats>,
    state: Arc<AtomicU8>,
    stop_tx: Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Worker identifier
    #[must_use]
    pub const fn id(&self) -> WorkerId {
        self.id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Ask the worker to stop after its current task
    fn signal_stop(&self) {
        let _ = self.stop_tx.try_send(());
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                (raw != WorkerState::Stopped as u8).then_some(WorkerState::Stopping as u8)
            });
    }

    fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, thread::JoinHandle::is_finished)
    }

    fn join(&mut self) -> Result<(), WorkerError> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| WorkerError::WorkerPanic { worker_id: self.id }),
            None => Ok(()),
        }
    }

    /// Statistics snapshot
    #[must_use]
    pub fn snapshot(&self) -> WorkerStatSnapshot {
        let last_active_ms = self.stats.last_active_ms.load(Ordering::Relaxed);
        let last_active = if last_active_ms == 0 {
            None
        } else {
            i64::try_from(last_active_ms)
                .ok()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        };
        WorkerStatSnapshot {
            worker_id: self.id,
            state: self.state(),
            tasks_processed: self.stats.tasks_processed.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            total_processing_time: Duration::from_nanos(
                self.stats.total_processing_ns.load(Ordering::Relaxed),
            ),
            last_active,
        }
    }
}

/// Everything a worker thread needs, shared by all workers
#[derive(Clone)]
pub struct WorkerContext {
    /// Task source
    pub queue: Arc<PriorityQueueSet>,
    /// Dependency lookups and running marks
    pub collector: Arc<ResultCollector>,
    /// Experience history
    pub feedback: Arc<PerformanceFeedbackModel>,
    /// Capability tracking
    pub assigner: Arc<LoadAwareAssigner>,
    /// Hand-off to the monitor
    pub results: Sender<TaskResult>,
}

/// Busy/live counters used for the normalized pool load
#[derive(Debug, Default)]
struct PoolLoad {
    busy: AtomicUsize,
    live: AtomicUsize,
}

impl PoolLoad {
    fn normalized(&self) -> f64 {
        let live = self.live.load(Ordering::Relaxed);
        if live == 0 {
            return 0.0;
        }
        let busy = self.busy.load(Ordering::Relaxed).min(live);
        f64::from(u32::try_from(busy).unwrap_or(u32::MAX))
            / f64::from(u32::try_from(live).unwrap_or(u32::MAX))
    }
}

/// Variable-size pool of worker threads
pub struct WorkerPool {
    config: Arc<EngineConfig>,
    context: WorkerContext,
    workers: Mutex<Vec<Worker>>,
    retired: Mutex<Vec<Worker>>,
    load: Arc<PoolLoad>,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Create an empty pool
    #[must_use]
    pub fn new(config: Arc<EngineConfig>, context: WorkerContext) -> Self {
        Self {
            config,
            context,
            workers: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
            load: Arc::new(PoolLoad::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Start one worker thread
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::PoolFull` at the configured maximum (retired
    /// threads that are still finishing count toward it),
    /// `WorkerError::PoolClosed` during shutdown, or
    /// `WorkerError::SpawnFailed` if the OS refuses the thread.
    pub fn spawn_worker(&self) -> Result<WorkerId, WorkerError> {
        self.reap_retired();

        let mut workers = self.workers.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(WorkerError::PoolClosed);
        }
        let running = workers.len() + self.retired.lock().len();
        if running >= self.config.max_workers {
            return Err(WorkerError::PoolFull {
                capacity: self.config.max_workers,
            });
        }

        let id = WorkerId::next();
        let (stop_tx, stop_rx) = channel::bounded(1);
        let stats = Arc::new(WorkerStats::default());
        let state = Arc::new(AtomicU8::new(WorkerState::Idle as u8));

        self.context.assigner.register(id);
        self.load.live.fetch_add(1, Ordering::Relaxed);

        let runner = WorkerRunner {
            id,
            context: self.context.clone(),
            stats: Arc::clone(&stats),
            state: Arc::clone(&state),
            load: Arc::clone(&self.load),
            stop_rx,
            poll_timeout: self.config.worker_poll_timeout(),
        };

        let handle = thread::Builder::new()
            .name(format!("flowgate-worker-{}", id.raw()))
            .spawn(move || runner.run())
            .map_err(|e| {
                self.context.assigner.unregister(id);
                self.load.live.fetch_sub(1, Ordering::Relaxed);
                WorkerError::SpawnFailed {
                    reason: e.to_string(),
                }
            })?;

        workers.push(Worker {
            id,
            stats,
            state,
            stop_tx,
            handle: Some(handle),
        });
        debug!("Spawned {id} ({} live)", workers.len());
        Ok(id)
    }

    /// Signal one worker to stop, preferring an idle one
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::AtMinimum` if the pool is already at its floor.
    pub fn retire_worker(&self) -> Result<WorkerId, WorkerError> {
        let mut workers = self.workers.lock();
        if workers.len() <= self.config.min_workers {
            return Err(WorkerError::AtMinimum {
                minimum: self.config.min_workers,
            });
        }

        let position = workers
            .iter()
            .rposition(|w| w.state() == WorkerState::Idle)
            .unwrap_or(workers.len() - 1);
        let worker = workers.remove(position);
        worker.signal_stop();
        let id = worker.id;
        self.retired.lock().push(worker);
        drop(workers);

        self.context.queue.wake_all();
        debug!("Retiring {id}");
        Ok(id)
    }

    /// Join retired workers whose threads have exited; returns how many were reaped
    pub fn reap_retired(&self) -> usize {
        let mut retired = self.retired.lock();
        let before = retired.len();
        let mut still_running = Vec::with_capacity(before);
        for mut worker in retired.drain(..) {
            if worker.is_finished() {
                if let Err(e) = worker.join() {
                    warn!("{e}");
                }
            } else {
                still_running.push(worker);
            }
        }
        *retired = still_running;
        before - retired.len()
    }

    /// Stop every worker, waiting up to `grace` for in-flight tasks
    ///
    /// Workers still running after the grace period are reported and parked
    /// in the retiring list, where they keep counting toward `max_workers`
    /// until their thread exits.
    pub fn shutdown(&self, grace: Duration) -> Vec<WorkerError> {
        let mut all: Vec<Worker> = {
            let mut workers = self.workers.lock();
            self.closed.store(true, Ordering::Release);
            workers.drain(..).collect()
        };
        all.append(&mut self.retired.lock());

        for worker in &all {
            worker.signal_stop();
        }
        self.context.queue.wake_all();

        let deadline = Instant::now() + grace;
        let mut failures = Vec::new();
        let mut lingering = Vec::new();
        for mut worker in all {
            while !worker.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(2));
            }
            if worker.is_finished() {
                if let Err(e) = worker.join() {
                    failures.push(e);
                }
            } else {
                warn!("{} still running after {grace:?}", worker.id);
                self.context.assigner.unregister(worker.id);
                failures.push(WorkerError::ShutdownTimeout {
                    worker_id: worker.id,
                });
                lingering.push(worker);
            }
        }
        self.retired.lock().append(&mut lingering);
        failures
    }

    /// Wait up to `timeout` for retiring threads to exit; returns how many remain
    pub fn await_retired(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            self.reap_retired();
            let remaining = self.retiring_count();
            if remaining == 0 || Instant::now() >= deadline {
                return remaining;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Accept spawns again after a shutdown
    pub fn reopen(&self) {
        let _workers = self.workers.lock();
        self.closed.store(false, Ordering::Release);
    }

    /// Live (non-retired) worker count
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Workers signalled to stop whose threads have not been reaped
    #[must_use]
    pub fn retiring_count(&self) -> usize {
        self.retired.lock().len()
    }

    /// Busy workers over live workers
    #[must_use]
    pub fn normalized_load(&self) -> f64 {
        self.load.normalized()
    }

    /// Statistics of every live worker
    #[must_use]
    pub fn stats(&self) -> Vec<WorkerStatSnapshot> {
        self.workers.lock().iter().map(Worker::snapshot).collect()
    }
}

/// State moved into a worker thread
struct WorkerRunner {
    id: WorkerId,
    context: WorkerContext,
    stats: Arc<WorkerStats>,
    state: Arc<AtomicU8>,
    load: Arc<PoolLoad>,
    stop_rx: Receiver<()>,
    poll_timeout: Duration,
}

impl WorkerRunner {
    fn stop_requested(&self) -> bool {
        !matches!(self.stop_rx.try_recv(), Err(TryRecvError::Empty))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move `from` to `to` unless a stop request got there first
    fn transition(&self, from: WorkerState, to: WorkerState) {
        let _ = self.state.compare_exchange(
            from as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn run(self) {
        loop {
            if self.stop_requested() {
                break;
            }

            let Some(scheduled) = self.context.queue.next(self.poll_timeout) else {
                continue;
            };

            self.transition(WorkerState::Idle, WorkerState::Executing);
            self.load.busy.fetch_add(1, Ordering::Relaxed);
            self.context.assigner.set_load(self.id, 1.0);
            let pool_load = self.load.normalized();

            let result = self.process(scheduled, pool_load);

            self.load.busy.fetch_sub(1, Ordering::Relaxed);
            self.context.assigner.set_load(self.id, 0.0);
            self.transition(WorkerState::Executing, WorkerState::Idle);

            if self.context.results.send(result).is_err() {
                break;
            }
        }

        self.set_state(WorkerState::Stopped);
        self.load.live.fetch_sub(1, Ordering::Relaxed);
        self.context.assigner.unregister(self.id);
        debug!("{} stopped", self.id);
    }

    fn process(&self, scheduled: ScheduledTask, pool_load: f64) -> TaskResult {
        self.context.collector.mark_running(&scheduled.id);

        let priority = scheduled.priority();
        let payload_size = scheduled.payload_size;
        let mut result = execute_task(scheduled, self.id, &self.context.collector);

        self.stats.record(result.duration, result.success);

        let features = PerformanceFeedbackModel::features(
            result.success,
            result.duration,
            payload_size,
            priority.normalized(),
            pool_load,
        );
        let performance = self.context.feedback.record(features);
        self.context.assigner.record_performance(self.id, performance);

        result.adaptation = AdaptationSnapshot {
            score: self.context.feedback.score(),
            performance,
            worker_load: pool_load,
        };

        if let Some(error) = &result.error {
            debug!("{} failed on {}: {error}", result.task_id, self.id);
        }
        ::metrics::histogram!("flowgate.task.duration_seconds").record(result.duration.as_secs_f64());
        result
    }
}

/// Run one dequeued task: deadline check, dependency check, then the callback
///
/// The callback runs under `catch_unwind`; a panic becomes an
/// `ExecutionError` result instead of unwinding through the worker.
pub fn execute_task(
    scheduled: ScheduledTask,
    worker_id: WorkerId,
    collector: &ResultCollector,
) -> TaskResult {
    let dequeued_at = Instant::now();
    let queue_wait = dequeued_at.saturating_duration_since(scheduled.submitted_at);
    let ScheduledTask {
        id,
        task,
        payload_size,
        ..
    } = scheduled;
    let priority = task.priority;

    let metrics_for = |duration: Duration| PerformanceMetrics {
        duration,
        queue_wait,
        worker_id: Some(worker_id),
        payload_size,
    };

    if let Some(deadline) = task.deadline {
        if dequeued_at > deadline {
            return TaskResult::failure(
                id,
                priority,
                TaskError::DeadlineExceeded {
                    overdue: dequeued_at.saturating_duration_since(deadline),
                },
                metrics_for(Duration::ZERO),
            );
        }
    }

    if let Some(&dependency) = task
        .dependencies
        .iter()
        .find(|dep| !collector.has_result(dep))
    {
        return TaskResult::failure(
            id,
            priority,
            TaskError::DependencyUnmet { dependency },
            metrics_for(Duration::ZERO),
        );
    }

    let ctx = ExecutionContext {
        task_id: id,
        worker_id,
        priority,
        dequeued_at,
        queue_wait,
        values: task.context.clone(),
    };

    let started = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        task.executable.run(&task.payload, &ctx)
    }));
    let duration = started.elapsed();

    match outcome {
        Ok(Ok(output)) => TaskResult::success(id, priority, output, metrics_for(duration)),
        Ok(Err(e)) => TaskResult::failure(
            id,
            priority,
            TaskError::ExecutionError {
                message: format!("{e:#}"),
            },
            metrics_for(duration),
        ),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            TaskResult::failure(
                id,
                priority,
                TaskError::ExecutionError {
                    message: format!("task panicked: {message}"),
                },
                metrics_for(duration),
            )
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::QueueCapacity;
    use crate::engine::{MockExecutable, Task, TaskPriority};
    use crate::types::TaskId;
    use serde_json::json;

    fn scheduled(task: Task) -> ScheduledTask {
        ScheduledTask::new(TaskId::new(), task)
    }

    fn pool_with(config: EngineConfig) -> (WorkerPool, WorkerContext, Receiver<TaskResult>) {
        let config = Arc::new(config);
        let (tx, rx) = channel::bounded(64);
        let context = WorkerContext {
            queue: Arc::new(
                PriorityQueueSet::new(QueueCapacity::uniform(64)).unwrap(),
            ),
            collector: Arc::new(ResultCollector::new()),
            feedback: Arc::new(PerformanceFeedbackModel::new(config.feedback.clone())),
            assigner: Arc::new(LoadAwareAssigner::new(&config.feedback)),
            results: tx,
        };
        (WorkerPool::new(config, context.clone()), context, rx)
    }

    #[test]
    fn test_execute_success() {
        let mut mock = MockExecutable::new();
        mock.expect_run()
            .times(1)
            .returning(|payload, _| Ok(json!({"echo": payload})));
        let task = Task::new(json!(7), Arc::new(mock));

        let result = execute_task(scheduled(task), WorkerId::from_raw(1), &ResultCollector::new());
        assert!(result.success);
        assert_eq!(result.output, Some(json!({"echo": 7})));
        assert_eq!(result.metrics.worker_id, Some(WorkerId::from_raw(1)));
    }

    #[test]
    fn test_execute_past_deadline_never_runs() {
        let mut mock = MockExecutable::new();
        mock.expect_run().times(0);
        let task = Task::new(json!(null), Arc::new(mock))
            .with_deadline(Instant::now() - Duration::from_millis(5));

        let result = execute_task(scheduled(task), WorkerId::from_raw(1), &ResultCollector::new());
        assert!(!result.success);
        assert!(matches!(
            result.error,
            Some(TaskError::DeadlineExceeded { .. })
        ));
    }

    #[test]
    fn test_execute_unmet_dependency() {
        let mut mock = MockExecutable::new();
        mock.expect_run().times(0);
        let missing = TaskId::new();
        let task = Task::new(json!(null), Arc::new(mock)).with_dependency(missing);

        let result = execute_task(scheduled(task), WorkerId::from_raw(1), &ResultCollector::new());
        assert_eq!(
            result.error,
            Some(TaskError::DependencyUnmet {
                dependency: missing
            })
        );
    }

    #[test]
    fn test_execute_captures_error_chain() {
        let task = Task::from_fn(json!(null), |_, _| {
            Err(anyhow::anyhow!("disk full").context("writing report"))
        });
        let result = execute_task(scheduled(task), WorkerId::from_raw(1), &ResultCollector::new());
        assert_eq!(
            result.error,
            Some(TaskError::ExecutionError {
                message: "writing report: disk full".to_string()
            })
        );
    }

    #[test]
    fn test_execute_captures_panic() {
        let task = Task::from_fn(json!(null), |_, _| panic!("kaboom"));
        let result = execute_task(scheduled(task), WorkerId::from_raw(1), &ResultCollector::new());
        assert!(matches!(
            result.error,
            Some(TaskError::ExecutionError { ref message }) if message.contains("kaboom")
        ));
    }

    #[test]
    fn test_pool_runs_tasks_and_updates_stats() -> Result<(), WorkerError> {
        let (pool, context, results) = pool_with(EngineConfig::test());
        pool.spawn_worker()?;

        let task = Task::from_fn(json!(2), |payload, ctx| {
            Ok(json!({"value": payload, "tier": ctx.priority.as_str()}))
        })
        .with_priority(TaskPriority::High);
        let id = TaskId::new();
        context
            .queue
            .push(ScheduledTask::new(id, task))
            .unwrap();

        let result = results.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.task_id, id);
        assert_eq!(result.output, Some(json!({"value": 2, "tier": "high"})));
        assert!(result.adaptation.performance > 0.0);
        assert_eq!(context.feedback.len(), 1);

        let stats = pool.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats.first().map(|s| s.tasks_processed), Some(1));

        assert!(pool.shutdown(Duration::from_secs(2)).is_empty());
        assert_eq!(pool.worker_count(), 0);
        Ok(())
    }

    #[test]
    fn test_pool_respects_max_workers() -> Result<(), WorkerError> {
        let (pool, _context, _results) = pool_with(EngineConfig {
            initial_workers: 1,
            max_workers: 2,
            ..EngineConfig::test()
        });
        pool.spawn_worker()?;
        pool.spawn_worker()?;
        assert_eq!(
            pool.spawn_worker(),
            Err(WorkerError::PoolFull { capacity: 2 })
        );
        pool.shutdown(Duration::from_secs(2));
        Ok(())
    }

    #[test]
    fn test_retire_respects_minimum_and_reaps() -> Result<(), WorkerError> {
        let (pool, _context, _results) = pool_with(EngineConfig {
            initial_workers: 1,
            max_workers: 3,
            min_workers: 1,
            ..EngineConfig::test()
        });
        pool.spawn_worker()?;
        pool.spawn_worker()?;
        pool.retire_worker()?;
        assert_eq!(pool.worker_count(), 1);
        assert_eq!(
            pool.retire_worker(),
            Err(WorkerError::AtMinimum { minimum: 1 })
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.retiring_count() > 0 && Instant::now() < deadline {
            pool.reap_retired();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.retiring_count(), 0);
        pool.shutdown(Duration::from_secs(2));
        Ok(())
    }

    /// Task that reports when it starts and blocks until `release` fires
    fn blocking_task(started: Sender<()>, release: Receiver<()>) -> Task {
        Task::from_fn(json!(null), move |_, _| {
            let _ = started.send(());
            let _ = release.recv_timeout(Duration::from_secs(10));
            Ok(json!("released"))
        })
    }

    #[test]
    fn test_retired_busy_worker_reports_stopping() -> Result<(), WorkerError> {
        let (pool, context, results) = pool_with(EngineConfig {
            initial_workers: 2,
            max_workers: 2,
            min_workers: 1,
            ..EngineConfig::test()
        });
        pool.spawn_worker()?;
        pool.spawn_worker()?;

        let (started_tx, started_rx) = channel::unbounded();
        let (release_tx, release_rx) = channel::unbounded();
        for _ in 0..2 {
            let task = blocking_task(started_tx.clone(), release_rx.clone());
            context.queue.push(ScheduledTask::new(TaskId::new(), task)).unwrap();
        }
        for _ in 0..2 {
            started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }

        // both busy, so the retired one is mid-task
        let retired = pool.retire_worker()?;
        assert_eq!(
            pool.retired.lock().first().map(|w| (w.id(), w.state())),
            Some((retired, WorkerState::Stopping))
        );

        // finishing the task must not flip it back to Idle
        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        for _ in 0..2 {
            results.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        let state = pool.retired.lock().first().map(Worker::state);
        assert!(matches!(
            state,
            None | Some(WorkerState::Stopping | WorkerState::Stopped)
        ));

        assert_eq!(pool.await_retired(Duration::from_secs(2)), 0);
        assert!(pool.shutdown(Duration::from_secs(2)).is_empty());
        Ok(())
    }

    #[test]
    fn test_shutdown_timeout_keeps_thread_counted() -> Result<(), WorkerError> {
        let (pool, context, results) = pool_with(EngineConfig {
            initial_workers: 1,
            max_workers: 1,
            min_workers: 1,
            ..EngineConfig::test()
        });
        let busy = pool.spawn_worker()?;

        let (started_tx, started_rx) = channel::unbounded();
        let (release_tx, release_rx) = channel::unbounded();
        let task = blocking_task(started_tx, release_rx);
        context.queue.push(ScheduledTask::new(TaskId::new(), task)).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(
            pool.shutdown(Duration::ZERO),
            vec![WorkerError::ShutdownTimeout { worker_id: busy }]
        );
        assert_eq!(pool.worker_count(), 0);
        assert_eq!(pool.retiring_count(), 1);

        // the lingering thread still occupies the only slot
        pool.reopen();
        assert_eq!(
            pool.spawn_worker(),
            Err(WorkerError::PoolFull { capacity: 1 })
        );

        release_tx.send(()).unwrap();
        results.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.await_retired(Duration::from_secs(2)), 0);
        pool.spawn_worker()?;
        assert!(pool.shutdown(Duration::from_secs(2)).is_empty());
        Ok(())
    }
}
