//! Monitor thread
//!
//! The single non-worker unit. Between ticks it drains the result channel
//! into the collector and the aggregator; on every tick it recomputes
//! metrics, retires stale records, reaps retired workers and gives the
//! controller a chance to run a pass.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam::channel::{self, select, Receiver, Sender};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::WorkerError;

use super::metrics::export;
use super::{
    AdaptiveController, MetricsAggregator, PerformanceFeedbackModel, PriorityQueueSet,
    ResultCollector, SystemMetrics, TaskResult, WorkerPool,
};

/// Components the monitor reads and writes
#[derive(Clone)]
pub(crate) struct MonitorContext {
    pub config: Arc<EngineConfig>,
    pub queue: Arc<PriorityQueueSet>,
    pub collector: Arc<ResultCollector>,
    pub feedback: Arc<PerformanceFeedbackModel>,
    pub aggregator: Arc<MetricsAggregator>,
    pub controller: Arc<AdaptiveController>,
    pub pool: Arc<WorkerPool>,
}

impl MonitorContext {
    fn collect(&self, result: TaskResult) {
        self.aggregator.observe(&result);
        ::metrics::counter!("flowgate.tasks.completed", "outcome" => result.outcome_label())
            .increment(1);
        self.collector.complete(result);
        self.controller.note_completions(1);
    }

    fn refresh_metrics(&self) -> SystemMetrics {
        let queue_lengths = self.queue.lengths();
        let queue_length = queue_lengths.iter().sum();
        let metrics = self.aggregator.recompute(
            queue_length,
            self.feedback.score(),
            self.pool.worker_count(),
        );
        export(&metrics, &queue_lengths);
        metrics
    }

    fn tick(&self) {
        let metrics = self.refresh_metrics();

        let retired = self.collector.retire_stale(self.config.result_retention());
        if retired > 0 {
            debug!("Retired {retired} stale task records");
        }
        self.pool.reap_retired();

        if let Some(trigger) = self.controller.check_trigger(&metrics, metrics.worker_count) {
            self.controller
                .run_pass(trigger, &metrics, self.pool.as_ref());
        }
    }

    fn run(&self, results: &Receiver<TaskResult>, stop: &Receiver<()>) {
        let params = Arc::clone(self.controller.params());
        let mut next_tick = Instant::now() + params.metrics_interval();

        loop {
            if Instant::now() >= next_tick {
                self.tick();
                next_tick = Instant::now() + params.metrics_interval();
            }

            let timeout = next_tick.saturating_duration_since(Instant::now());
            select! {
                recv(results) -> msg => match msg {
                    Ok(result) => self.collect(result),
                    Err(_) => break,
                },
                recv(stop) -> _ => {
                    while let Ok(result) = results.try_recv() {
                        self.collect(result);
                    }
                    // no tuning while the pool is shutting down
                    self.refresh_metrics();
                    break;
                },
                default(timeout) => {},
            }
        }
        debug!("Monitor stopped");
    }
}

/// Handle to the running monitor thread
pub(crate) struct MonitorHandle {
    stop_tx: Sender<()>,
    handle: thread::JoinHandle<()>,
}

impl MonitorHandle {
    /// Start the monitor thread
    pub fn spawn(context: MonitorContext, results: Receiver<TaskResult>) -> Result<Self, WorkerError> {
        let (stop_tx, stop_rx) = channel::bounded(1);
        let handle = thread::Builder::new()
            .name("flowgate-monitor".to_string())
            .spawn(move || context.run(&results, &stop_rx))
            .map_err(|e| WorkerError::SpawnFailed {
                reason: format!("monitor: {e}"),
            })?;
        Ok(Self { stop_tx, handle })
    }

    /// Drain outstanding results, refresh metrics once more and join
    pub fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            warn!("Monitor thread panicked");
        }
    }
}
