//! Flowgate Configuration System
//!
//! Engine configuration with garde validation, presets and layered loading.
//!
//! Sources are merged in this order, later ones winning:
//!
//! 1. [`EngineConfig::default()`]
//! 2. an optional TOML file
//! 3. environment variables prefixed with `FLOWGATE__`, nested keys separated
//!    by `__` (for example `FLOWGATE__QUEUE__LOW=500`)

use garde::Validate;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::engine::TaskPriority;
use crate::error::{EngineError, EngineResult};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "FLOWGATE";

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EngineConfig {
    /// Workers started by `Engine::start`
    #[garde(range(min = 1, max = 1024))]
    pub initial_workers: usize,

    /// Hard ceiling on the worker count
    #[garde(range(min = 1, max = 1024))]
    pub max_workers: usize,

    /// Floor below which the controller never retires workers
    #[garde(range(min = 1, max = 1024))]
    pub min_workers: usize,

    /// Per-tier queue capacities
    #[garde(dive)]
    pub queue: QueueCapacity,

    /// Bounded channel between workers and the monitor
    #[garde(range(min = 1, max = 1_000_000))]
    pub result_channel_capacity: usize,

    /// How long collected results stay retrievable (seconds)
    #[garde(range(min = 1, max = 604_800))]
    pub result_retention_secs: u64,

    /// How long an idle worker blocks in `next` before re-checking its stop channel (milliseconds)
    #[garde(range(min = 1, max = 10_000))]
    pub worker_poll_timeout_ms: u64,

    /// Grace period for in-flight tasks during `stop` (milliseconds)
    #[garde(range(min = 0, max = 600_000))]
    pub shutdown_grace_ms: u64,

    /// Adaptive controller tuning
    #[garde(dive)]
    pub adaptation: AdaptationConfig,

    /// Performance feedback model tuning
    #[garde(dive)]
    pub feedback: FeedbackConfig,

    /// Metrics aggregation tuning
    #[garde(dive)]
    pub metrics: MetricsConfig,
}

/// Capacity of each priority tier
///
/// Every tier preallocates all of its slots when the engine is built, so the
/// per-tier bound is kept to [`QueueCapacity::MAX_PER_TIER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct QueueCapacity {
    /// Critical tier
    #[garde(range(min = 1, max = QueueCapacity::MAX_PER_TIER))]
    pub critical: usize,
    /// High tier
    #[garde(range(min = 1, max = QueueCapacity::MAX_PER_TIER))]
    pub high: usize,
    /// Normal tier
    #[garde(range(min = 1, max = QueueCapacity::MAX_PER_TIER))]
    pub normal: usize,
    /// Low tier
    #[garde(range(min = 1, max = QueueCapacity::MAX_PER_TIER))]
    pub low: usize,
    /// Background tier
    #[garde(range(min = 1, max = QueueCapacity::MAX_PER_TIER))]
    pub background: usize,
}

impl QueueCapacity {
    /// Largest slot count a single tier may preallocate
    pub const MAX_PER_TIER: usize = 100_000;

    /// Same capacity for every tier
    #[must_use]
    pub const fn uniform(capacity: usize) -> Self {
        Self {
            critical: capacity,
            high: capacity,
            normal: capacity,
            low: capacity,
            background: capacity,
        }
    }

    /// Capacity of one tier
    #[must_use]
    pub const fn for_priority(&self, priority: TaskPriority) -> usize {
        match priority {
            TaskPriority::Critical => self.critical,
            TaskPriority::High => self.high,
            TaskPriority::Normal => self.normal,
            TaskPriority::Low => self.low,
            TaskPriority::Background => self.background,
        }
    }
}

impl Default for QueueCapacity {
    fn default() -> Self {
        Self::uniform(10_000)
    }
}

/// Adaptive controller thresholds and step sizes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AdaptationConfig {
    /// Completed tasks between scheduled tuning passes
    #[garde(range(min = 1, max = 1_000_000))]
    pub initial_frequency: u64,

    /// Amount the frequency moves per pass
    #[garde(range(min = 1, max = 10_000))]
    pub frequency_step: u64,

    /// Frequency floor
    #[garde(range(min = 1, max = 1_000_000))]
    pub min_frequency: u64,

    /// Frequency ceiling
    #[garde(range(min = 1, max = 1_000_000))]
    pub max_frequency: u64,

    /// Error rate that triggers an immediate pass
    #[garde(range(min = 0.0_f64, max = 1.0_f64))]
    pub error_rate_breach: f64,

    /// Queue length per worker that triggers an immediate pass
    #[garde(range(min = 1, max = 100_000))]
    pub queue_breach_per_worker: usize,

    /// Mean latency that triggers an immediate pass (milliseconds)
    #[garde(range(min = 1, max = 3_600_000))]
    pub latency_breach_ms: u64,

    /// Longest gap between passes (seconds)
    #[garde(range(min = 1, max = 86_400))]
    pub max_idle_secs: u64,

    /// Queue length per worker above which one worker is spawned
    #[garde(range(min = 1, max = 100_000))]
    pub scale_up_per_worker: usize,

    /// Error rate above which the frequency is raised
    #[garde(range(min = 0.0_f64, max = 1.0_f64))]
    pub high_error_rate: f64,

    /// Error rate below which the frequency is lowered
    #[garde(range(min = 0.0_f64, max = 1.0_f64))]
    pub low_error_rate: f64,

    /// Throughput (tasks/s) above which the metrics interval shrinks
    #[garde(range(min = 0.0_f64, max = 1_000_000.0_f64))]
    pub high_throughput: f64,

    /// Throughput (tasks/s) below which the metrics interval grows
    #[garde(range(min = 0.0_f64, max = 1_000_000.0_f64))]
    pub low_throughput: f64,

    /// Multiplier applied when shrinking the metrics interval
    #[garde(range(min = 0.01_f64, max = 1.0_f64))]
    pub interval_shrink: f64,

    /// Multiplier applied when growing the metrics interval
    #[garde(range(min = 1.0_f64, max = 100.0_f64))]
    pub interval_grow: f64,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            initial_frequency: 100,
            frequency_step: 10,
            min_frequency: 50,
            max_frequency: 200,
            error_rate_breach: 0.2,
            queue_breach_per_worker: 10,
            latency_breach_ms: 10_000,
            max_idle_secs: 60,
            scale_up_per_worker: 5,
            high_error_rate: 0.1,
            low_error_rate: 0.01,
            high_throughput: 100.0,
            low_throughput: 10.0,
            interval_shrink: 0.8,
            interval_grow: 1.25,
        }
    }
}

impl AdaptationConfig {
    /// Latency breach threshold
    #[must_use]
    pub const fn latency_breach(&self) -> Duration {
        Duration::from_millis(self.latency_breach_ms)
    }

    /// Longest gap between passes
    #[must_use]
    pub const fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
}

/// Performance feedback model parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Experience records kept before the oldest is evicted
    #[garde(range(min = 1, max = 10_000_000))]
    pub capacity: usize,

    /// Most recent records considered by the score
    #[garde(range(min = 1, max = 100_000))]
    pub window: usize,

    /// Per-step recency decay
    #[garde(range(min = 0.0_f64, max = 1.0_f64))]
    pub decay: f64,

    /// Records required before the score leaves its neutral value
    #[garde(range(min = 1, max = 100_000))]
    pub min_records: usize,

    /// Smoothing factor for per-worker capability estimates
    #[garde(range(min = 0.0_f64, max = 1.0_f64))]
    pub capability_smoothing: f64,

    /// Capability assigned to a freshly registered worker
    #[garde(range(min = 0.0_f64, max = 1.0_f64))]
    pub initial_capability: f64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            capacity: 50_000,
            window: 100,
            decay: 0.95,
            min_records: 10,
            capability_smoothing: 0.1,
            initial_capability: 0.5,
        }
    }
}

/// Metrics aggregation parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MetricsConfig {
    /// Starting monitor tick (milliseconds)
    #[garde(range(min = 1, max = 600_000))]
    pub interval_ms: u64,

    /// Floor for the adaptively tuned tick (milliseconds)
    #[garde(range(min = 1, max = 600_000))]
    pub min_interval_ms: u64,

    /// Ceiling for the adaptively tuned tick (milliseconds)
    #[garde(range(min = 1, max = 600_000))]
    pub max_interval_ms: u64,

    /// Trailing window for throughput (seconds)
    #[garde(range(min = 1, max = 86_400))]
    pub throughput_window_secs: u64,

    /// Results averaged for latency
    #[garde(range(min = 1, max = 1_000_000))]
    pub latency_samples: usize,

    /// Results considered for the error rate
    #[garde(range(min = 1, max = 1_000_000))]
    pub error_samples: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            min_interval_ms: 500,
            max_interval_ms: 5_000,
            throughput_window_secs: 60,
            latency_samples: 100,
            error_samples: 1_000,
        }
    }
}

impl MetricsConfig {
    /// Starting monitor tick
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Trailing throughput window
    #[must_use]
    pub const fn throughput_window(&self) -> Duration {
        Duration::from_secs(self.throughput_window_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let initial_workers = num_cpus::get().clamp(1, 8);
        Self {
            initial_workers,
            max_workers: initial_workers * 2,
            min_workers: 2,
            queue: QueueCapacity::default(),
            result_channel_capacity: 1_024,
            result_retention_secs: 3_600,
            worker_poll_timeout_ms: 100,
            shutdown_grace_ms: 5_000,
            adaptation: AdaptationConfig::default(),
            feedback: FeedbackConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Configuration for local development
    #[must_use]
    pub fn development() -> Self {
        Self {
            initial_workers: 4,
            max_workers: 8,
            queue: QueueCapacity::uniform(1_000),
            result_retention_secs: 600,
            ..Self::default()
        }
    }

    /// Configuration for test suites: small pool, fast ticks, short grace
    #[must_use]
    pub fn test() -> Self {
        Self {
            initial_workers: 2,
            max_workers: 4,
            min_workers: 1,
            queue: QueueCapacity::uniform(1_000),
            result_channel_capacity: 256,
            result_retention_secs: 60,
            worker_poll_timeout_ms: 10,
            shutdown_grace_ms: 1_000,
            adaptation: AdaptationConfig {
                max_idle_secs: 5,
                ..AdaptationConfig::default()
            },
            feedback: FeedbackConfig::default(),
            metrics: MetricsConfig {
                interval_ms: 20,
                min_interval_ms: 10,
                max_interval_ms: 100,
                ..MetricsConfig::default()
            },
        }
    }

    /// Load configuration from defaults, an optional TOML file and the environment
    ///
    /// # Errors
    ///
    /// Returns error if a source cannot be read or the merged result fails validation.
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let defaults = config::Config::try_from(&Self::default())?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let merged: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        merged.validate()?;
        Ok(merged)
    }

    /// Parse configuration from a TOML document; missing keys take defaults
    ///
    /// # Errors
    ///
    /// Returns error if the document is malformed or fails validation.
    pub fn from_toml_str(source: &str) -> EngineResult<Self> {
        let parsed: Self = toml::from_str(source)?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Validate field ranges and cross-field consistency
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Configuration` describing the first violation.
    pub fn validate(&self) -> EngineResult<()> {
        garde::Validate::validate(self, &())?;

        if self.initial_workers > self.max_workers {
            return Err(EngineError::config(
                "initial_workers",
                format!(
                    "initial_workers ({}) exceeds max_workers ({})",
                    self.initial_workers, self.max_workers
                ),
            ));
        }

        if self.min_workers > self.max_workers {
            return Err(EngineError::config(
                "min_workers",
                format!(
                    "min_workers ({}) exceeds max_workers ({})",
                    self.min_workers, self.max_workers
                ),
            ));
        }

        let a = &self.adaptation;
        if !(a.min_frequency <= a.initial_frequency && a.initial_frequency <= a.max_frequency) {
            return Err(EngineError::config(
                "adaptation.initial_frequency",
                format!(
                    "must lie within [{}, {}], got {}",
                    a.min_frequency, a.max_frequency, a.initial_frequency
                ),
            ));
        }

        if a.low_error_rate > a.high_error_rate {
            return Err(EngineError::config(
                "adaptation.low_error_rate",
                "must not exceed high_error_rate",
            ));
        }

        let m = &self.metrics;
        if !(m.min_interval_ms <= m.interval_ms && m.interval_ms <= m.max_interval_ms) {
            return Err(EngineError::config(
                "metrics.interval_ms",
                format!(
                    "must lie within [{}, {}], got {}",
                    m.min_interval_ms, m.max_interval_ms, m.interval_ms
                ),
            ));
        }

        if self.feedback.window > self.feedback.capacity {
            return Err(EngineError::config(
                "feedback.window",
                "must not exceed feedback.capacity",
            ));
        }

        Ok(())
    }

    /// Result retention window
    #[must_use]
    pub const fn result_retention(&self) -> Duration {
        Duration::from_secs(self.result_retention_secs)
    }

    /// Idle worker poll timeout
    #[must_use]
    pub const fn worker_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_poll_timeout_ms)
    }

    /// Shutdown grace period
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Ceiling the controller may grow the pool to
    #[must_use]
    pub fn growth_ceiling(&self) -> usize {
        (self.initial_workers * 2).min(self.max_workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() -> EngineResult<()> {
        EngineConfig::default().validate()?;
        EngineConfig::development().validate()?;
        EngineConfig::test().validate()?;
        Ok(())
    }

    #[test]
    fn test_default_matches_documented_values() {
        let config = EngineConfig::default();
        assert!(config.initial_workers >= 1 && config.initial_workers <= 8);
        assert_eq!(config.max_workers, config.initial_workers * 2);
        assert_eq!(config.queue.for_priority(TaskPriority::Background), 10_000);
        assert_eq!(config.result_retention(), Duration::from_secs(3_600));
        assert_eq!(config.adaptation.initial_frequency, 100);
        assert_eq!(config.feedback.capacity, 50_000);
        assert_eq!(config.metrics.interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = EngineConfig {
            initial_workers: 0,
            ..EngineConfig::test()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::Configuration { .. })
        ));
    }

    #[test]
    fn test_zero_tier_capacity_rejected() {
        let mut config = EngineConfig::test();
        config.queue.low = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_tier_capacity_rejected() {
        let mut config = EngineConfig::test();
        config.queue.critical = QueueCapacity::MAX_PER_TIER + 1;
        assert!(config.validate().is_err());

        config.queue = QueueCapacity::uniform(QueueCapacity::MAX_PER_TIER);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_initial_above_max_rejected() {
        let config = EngineConfig {
            initial_workers: 8,
            max_workers: 4,
            ..EngineConfig::test()
        };
        let err = config.validate().err();
        assert!(matches!(
            err,
            Some(EngineError::Configuration { ref field, .. }) if field == "initial_workers"
        ));
    }

    #[test]
    fn test_interval_outside_bounds_rejected() {
        let mut config = EngineConfig::test();
        config.metrics.interval_ms = config.metrics.max_interval_ms + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_overrides_and_defaults() -> EngineResult<()> {
        let config = EngineConfig::from_toml_str(
            r#"
            initial_workers = 3
            max_workers = 5

            [queue]
            low = 1

            [adaptation]
            max_frequency = 150
            "#,
        )?;
        assert_eq!(config.initial_workers, 3);
        assert_eq!(config.max_workers, 5);
        assert_eq!(config.queue.low, 1);
        assert_eq!(config.queue.high, 10_000);
        assert_eq!(config.adaptation.max_frequency, 150);
        assert_eq!(config.adaptation.min_frequency, 50);
        assert_eq!(config.growth_ceiling(), 5);
        Ok(())
    }

    #[test]
    fn test_from_toml_rejects_invalid() {
        assert!(EngineConfig::from_toml_str("initial_workers = 0").is_err());
        assert!(EngineConfig::from_toml_str("initial_workers = \"many\"").is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() -> EngineResult<()> {
        let config = EngineConfig::load(None)?;
        assert_eq!(config.queue, QueueCapacity::default());
        Ok(())
    }
}
