//! Adaptive Controller
//!
//! Closed-loop tuning of the pool size, the adaptation cadence and the monitor
//! interval. A pass is triggered by completed-task count, by a threshold
//! breach, by the idle timer or manually. Each pass applies at most one
//! action: the first rule, in priority order, that would actually change
//! something.
//!
//! 1. Queue deeper than `workers * scale_up_per_worker` and room to grow: spawn one worker.
//! 2. Queue shorter than `workers` and above the floor: retire one worker.
//! 3. Error rate high: raise the frequency. Error rate low: lower it.
//! 4. Throughput high: shrink the interval. Throughput low: grow it.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{ControllerError, WorkerError};
use crate::types::WorkerId;

use super::{SystemMetrics, WorkerPool};

/// Pool operations the controller needs
pub trait PoolControl: Send + Sync {
    /// Live worker count
    fn worker_count(&self) -> usize;

    /// Start one worker
    ///
    /// # Errors
    ///
    /// Returns error if the pool cannot grow.
    fn spawn_worker(&self) -> Result<WorkerId, WorkerError>;

    /// Retire one worker
    ///
    /// # Errors
    ///
    /// Returns error if the pool cannot shrink.
    fn retire_worker(&self) -> Result<WorkerId, WorkerError>;
}

impl PoolControl for WorkerPool {
    fn worker_count(&self) -> usize {
        Self::worker_count(self)
    }

    fn spawn_worker(&self) -> Result<WorkerId, WorkerError> {
        Self::spawn_worker(self)
    }

    fn retire_worker(&self) -> Result<WorkerId, WorkerError> {
        Self::retire_worker(self)
    }
}

/// Controller state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerState {
    /// Observing; no pass in progress
    Processing,
    /// A tuning pass is running
    Adapting,
}

impl ControllerState {
    const fn from_u8(raw: u8) -> Self {
        if raw == 1 {
            Self::Adapting
        } else {
            Self::Processing
        }
    }
}

/// Why a pass ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationTrigger {
    /// Completed-task count reached the adaptation frequency
    Scheduled,
    /// Error rate above the breach threshold
    ErrorRate,
    /// Queue length above the per-worker breach threshold
    QueueDepth,
    /// Latency above the breach threshold
    Latency,
    /// No pass within the max idle period
    Idle,
    /// Requested through `Engine::adapt_now`
    Manual,
}

/// What a pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdaptationAction {
    /// One worker started
    SpawnWorker {
        /// Count before
        from: usize,
        /// Count after
        to: usize,
    },
    /// One worker retired
    RetireWorker {
        /// Count before
        from: usize,
        /// Count after
        to: usize,
    },
    /// Adaptation frequency raised
    RaiseFrequency {
        /// Frequency before
        from: u64,
        /// Frequency after
        to: u64,
    },
    /// Adaptation frequency lowered
    LowerFrequency {
        /// Frequency before
        from: u64,
        /// Frequency after
        to: u64,
    },
    /// Monitor interval shortened
    ShrinkInterval {
        /// Interval before (ms)
        from_ms: u64,
        /// Interval after (ms)
        to_ms: u64,
    },
    /// Monitor interval lengthened
    GrowInterval {
        /// Interval before (ms)
        from_ms: u64,
        /// Interval after (ms)
        to_ms: u64,
    },
    /// No rule applied
    NoChange,
}

impl AdaptationAction {
    /// Metrics label
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SpawnWorker { .. } => "spawn_worker",
            Self::RetireWorker { .. } => "retire_worker",
            Self::RaiseFrequency { .. } => "raise_frequency",
            Self::LowerFrequency { .. } => "lower_frequency",
            Self::ShrinkInterval { .. } => "shrink_interval",
            Self::GrowInterval { .. } => "grow_interval",
            Self::NoChange => "no_change",
        }
    }
}

/// Record of the most recent pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptationRecord {
    /// When the pass ran
    pub at: DateTime<Utc>,
    /// Why it ran
    pub trigger: AdaptationTrigger,
    /// What it attempted
    pub action: AdaptationAction,
    /// Whether the action was applied
    pub succeeded: bool,
    /// Failure reason when not applied
    pub error: Option<String>,
}

/// Parameters the controller tunes at runtime
#[derive(Debug)]
pub struct ControlParams {
    adaptation_frequency: AtomicU64,
    metrics_interval_ms: AtomicU64,
}

impl ControlParams {
    /// Start from configured values
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            adaptation_frequency: AtomicU64::new(config.adaptation.initial_frequency),
            metrics_interval_ms: AtomicU64::new(config.metrics.interval_ms),
        }
    }

    /// Completed tasks between scheduled passes
    #[must_use]
    pub fn adaptation_frequency(&self) -> u64 {
        self.adaptation_frequency.load(Ordering::Relaxed)
    }

    /// Current monitor tick
    #[must_use]
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms.load(Ordering::Relaxed))
    }

    fn reset(&self, config: &EngineConfig) {
        self.adaptation_frequency
            .store(config.adaptation.initial_frequency, Ordering::Relaxed);
        self.metrics_interval_ms
            .store(config.metrics.interval_ms, Ordering::Relaxed);
    }
}

const PROCESSING: u8 = 0;
const ADAPTING: u8 = 1;

/// Feedback controller
pub struct AdaptiveController {
    config: Arc<EngineConfig>,
    params: Arc<ControlParams>,
    state: AtomicU8,
    completed_since_pass: AtomicU64,
    passes: AtomicU64,
    last_pass: Mutex<Instant>,
    last_adaptation: RwLock<Option<AdaptationRecord>>,
}

impl AdaptiveController {
    /// Create controller in `Processing`
    #[must_use]
    pub fn new(config: Arc<EngineConfig>, params: Arc<ControlParams>) -> Self {
        Self {
            config,
            params,
            state: AtomicU8::new(PROCESSING),
            completed_since_pass: AtomicU64::new(0),
            passes: AtomicU64::new(0),
            last_pass: Mutex::new(Instant::now()),
            last_adaptation: RwLock::new(None),
        }
    }

    /// Shared tunable parameters
    #[must_use]
    pub fn params(&self) -> &Arc<ControlParams> {
        &self.params
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ControllerState {
        ControllerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Most recent pass, if any
    #[must_use]
    pub fn last_adaptation(&self) -> Option<AdaptationRecord> {
        self.last_adaptation.read().clone()
    }

    /// Passes run since the last reset
    #[must_use]
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Count completed tasks toward the next scheduled pass
    pub fn note_completions(&self, count: u64) {
        self.completed_since_pass.fetch_add(count, Ordering::Relaxed);
    }

    /// Restore configured parameters and clear history
    pub fn reset(&self) {
        self.params.reset(&self.config);
        self.completed_since_pass.store(0, Ordering::Relaxed);
        self.passes.store(0, Ordering::Relaxed);
        *self.last_pass.lock() = Instant::now();
        *self.last_adaptation.write() = None;
    }

    /// Decide whether a pass is due, in trigger priority order
    #[must_use]
    pub fn check_trigger(&self, metrics: &SystemMetrics, worker_count: usize) -> Option<AdaptationTrigger> {
        self.check_trigger_at(Instant::now(), metrics, worker_count)
    }

    /// Decide whether a pass is due as of `now`
    #[must_use]
    pub fn check_trigger_at(
        &self,
        now: Instant,
        metrics: &SystemMetrics,
        worker_count: usize,
    ) -> Option<AdaptationTrigger> {
        let a = &self.config.adaptation;

        if self.completed_since_pass.load(Ordering::Relaxed) >= self.params.adaptation_frequency() {
            return Some(AdaptationTrigger::Scheduled);
        }
        if metrics.error_samples > 0 && metrics.error_rate > a.error_rate_breach {
            return Some(AdaptationTrigger::ErrorRate);
        }
        if metrics.queue_length > worker_count.max(1) * a.queue_breach_per_worker {
            return Some(AdaptationTrigger::QueueDepth);
        }
        if metrics.latency > a.latency_breach() {
            return Some(AdaptationTrigger::Latency);
        }
        if now.saturating_duration_since(*self.last_pass.lock()) >= a.max_idle() {
            return Some(AdaptationTrigger::Idle);
        }
        None
    }

    /// Run one tuning pass; `None` if another pass is already in progress
    pub fn run_pass(
        &self,
        trigger: AdaptationTrigger,
        metrics: &SystemMetrics,
        pool: &dyn PoolControl,
    ) -> Option<AdaptationRecord> {
        if self
            .state
            .compare_exchange(PROCESSING, ADAPTING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        let (action, outcome) = self.apply_first_rule(metrics, pool);
        let record = AdaptationRecord {
            at: Utc::now(),
            trigger,
            action,
            succeeded: outcome.is_ok(),
            error: outcome.as_ref().err().map(ToString::to_string),
        };

        match &outcome {
            Ok(()) if action != AdaptationAction::NoChange => {
                info!("Adaptation ({trigger:?}): {action:?}");
            }
            Ok(()) => {}
            Err(e) => warn!("Adaptation ({trigger:?}) not applied: {e}"),
        }
        ::metrics::counter!("flowgate.controller.actions", "action" => action.name()).increment(1);

        self.completed_since_pass.store(0, Ordering::Relaxed);
        self.passes.fetch_add(1, Ordering::Relaxed);
        *self.last_pass.lock() = Instant::now();
        *self.last_adaptation.write() = Some(record.clone());

        self.state.store(PROCESSING, Ordering::Release);
        Some(record)
    }

    fn apply_first_rule(
        &self,
        metrics: &SystemMetrics,
        pool: &dyn PoolControl,
    ) -> (AdaptationAction, Result<(), ControllerError>) {
        let a = &self.config.adaptation;
        let workers = pool.worker_count();
        let queue = metrics.queue_length;

        if queue > workers * a.scale_up_per_worker {
            if workers < self.config.growth_ceiling() {
                let action = AdaptationAction::SpawnWorker {
                    from: workers,
                    to: workers + 1,
                };
                return (action, pool.spawn_worker().map(|_| ()).map_err(|e| failed(action, &e)));
            }
        } else if queue < workers && workers > self.config.min_workers {
            let action = AdaptationAction::RetireWorker {
                from: workers,
                to: workers - 1,
            };
            return (action, pool.retire_worker().map(|_| ()).map_err(|e| failed(action, &e)));
        }

        if let Some(action) = self.tune_frequency(metrics) {
            return (action, Ok(()));
        }
        if let Some(action) = self.tune_interval(metrics) {
            return (action, Ok(()));
        }
        (AdaptationAction::NoChange, Ok(()))
    }

    fn tune_frequency(&self, metrics: &SystemMetrics) -> Option<AdaptationAction> {
        let a = &self.config.adaptation;
        if metrics.error_samples == 0 {
            return None;
        }

        let from = self.params.adaptation_frequency();
        if metrics.error_rate > a.high_error_rate {
            let to = (from + a.frequency_step).min(a.max_frequency);
            (to != from).then(|| {
                self.params.adaptation_frequency.store(to, Ordering::Relaxed);
                AdaptationAction::RaiseFrequency { from, to }
            })
        } else if metrics.error_rate < a.low_error_rate {
            let to = from.saturating_sub(a.frequency_step).max(a.min_frequency);
            (to != from).then(|| {
                self.params.adaptation_frequency.store(to, Ordering::Relaxed);
                AdaptationAction::LowerFrequency { from, to }
            })
        } else {
            None
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn tune_interval(&self, metrics: &SystemMetrics) -> Option<AdaptationAction> {
        let a = &self.config.adaptation;
        let m = &self.config.metrics;
        let from_ms = self.params.metrics_interval_ms.load(Ordering::Relaxed);

        let scaled = |factor: f64| -> u64 {
            let ms = (f64::from(u32::try_from(from_ms).unwrap_or(u32::MAX)) * factor).round();
            ms.max(0.0) as u64
        };

        if metrics.throughput > a.high_throughput {
            let to_ms = scaled(a.interval_shrink).max(m.min_interval_ms);
            (to_ms < from_ms).then(|| {
                self.params.metrics_interval_ms.store(to_ms, Ordering::Relaxed);
                AdaptationAction::ShrinkInterval { from_ms, to_ms }
            })
        } else if metrics.throughput < a.low_throughput {
            let to_ms = scaled(a.interval_grow).min(m.max_interval_ms);
            (to_ms > from_ms).then(|| {
                self.params.metrics_interval_ms.store(to_ms, Ordering::Relaxed);
                AdaptationAction::GrowInterval { from_ms, to_ms }
            })
        } else {
            None
        }
    }
}

fn failed(action: AdaptationAction, err: &WorkerError) -> ControllerError {
    ControllerError::ActionFailed {
        action: action.name().to_string(),
        reason: err.to_string(),
    }
}
