//! Metrics Aggregator
//!
//! Owned by the monitor thread, which feeds it every collected result and asks
//! for a recompute once per tick. Readers (status queries, the controller) only
//! ever see the last published [`SystemMetrics`] snapshot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::MetricsConfig;

use super::{TaskPriority, TaskResult};

/// Derived system health snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    /// Completed tasks per second over the trailing window
    pub throughput: f64,
    /// Mean processing time of recent results
    pub latency: Duration,
    /// Tasks waiting across all tiers
    pub queue_length: usize,
    /// Failed fraction of recent results
    pub error_rate: f64,
    /// Results the error rate was computed from
    pub error_samples: usize,
    /// Feedback model score
    pub adaptation_score: f64,
    /// Throughput divided by latency in seconds
    pub efficiency: f64,
    /// Live workers at the time of the recompute
    pub worker_count: usize,
    /// Results observed since the last reset
    pub completed_total: u64,
    /// Failed results observed since the last reset
    pub failed_total: u64,
    /// When this snapshot was computed
    pub computed_at: DateTime<Utc>,
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self {
            throughput: 0.0,
            latency: Duration::ZERO,
            queue_length: 0,
            error_rate: 0.0,
            error_samples: 0,
            adaptation_score: super::feedback::NEUTRAL_SCORE,
            efficiency: 0.0,
            worker_count: 0,
            completed_total: 0,
            failed_total: 0,
            computed_at: Utc::now(),
        }
    }
}

/// Sliding windows the snapshot is derived from
#[derive(Debug, Default)]
struct Windows {
    completions: VecDeque<Instant>,
    latencies: VecDeque<Duration>,
    latency_sum: Duration,
    outcomes: VecDeque<bool>,
    failures_in_window: usize,
}

/// Sliding-window aggregation of task outcomes
pub struct MetricsAggregator {
    config: MetricsConfig,
    windows: Mutex<Windows>,
    snapshot: RwLock<SystemMetrics>,
    completed_total: AtomicU64,
    failed_total: AtomicU64,
}

impl MetricsAggregator {
    /// Create aggregator with empty windows
    #[must_use]
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(Windows::default()),
            snapshot: RwLock::new(SystemMetrics::default()),
            completed_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
        }
    }

    /// Fold one result into the windows
    pub fn observe(&self, result: &TaskResult) {
        self.observe_at(result.success, result.duration, Instant::now());
    }

    /// Fold an outcome observed at `at` into the windows
    pub fn observe_at(&self, success: bool, duration: Duration, at: Instant) {
        self.completed_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_total.fetch_add(1, Ordering::Relaxed);
        }

        let mut w = self.windows.lock();

        w.completions.push_back(at);

        w.latencies.push_back(duration);
        w.latency_sum += duration;
        while w.latencies.len() > self.config.latency_samples {
            if let Some(old) = w.latencies.pop_front() {
                w.latency_sum = w.latency_sum.saturating_sub(old);
            }
        }

        w.outcomes.push_back(success);
        if !success {
            w.failures_in_window += 1;
        }
        while w.outcomes.len() > self.config.error_samples {
            if w.outcomes.pop_front() == Some(false) {
                w.failures_in_window = w.failures_in_window.saturating_sub(1);
            }
        }
    }

    /// Recompute and publish the snapshot
    pub fn recompute(
        &self,
        queue_length: usize,
        adaptation_score: f64,
        worker_count: usize,
    ) -> SystemMetrics {
        self.recompute_at(Instant::now(), queue_length, adaptation_score, worker_count)
    }

    /// Recompute as of `now`
    pub fn recompute_at(
        &self,
        now: Instant,
        queue_length: usize,
        adaptation_score: f64,
        worker_count: usize,
    ) -> SystemMetrics {
        let window = self.config.throughput_window();

        let (throughput, latency, error_rate, error_samples) = {
            let mut w = self.windows.lock();
            while w
                .completions
                .front()
                .is_some_and(|&at| now.saturating_duration_since(at) > window)
            {
                w.completions.pop_front();
            }

            let throughput = ratio(w.completions.len(), 1) / window.as_secs_f64();
            let latency = if w.latencies.is_empty() {
                Duration::ZERO
            } else {
                w.latency_sum / u32::try_from(w.latencies.len()).unwrap_or(u32::MAX)
            };
            let error_rate = if w.outcomes.is_empty() {
                0.0
            } else {
                ratio(w.failures_in_window, w.outcomes.len())
            };
            (throughput, latency, error_rate, w.outcomes.len())
        };

        let latency_secs = latency.as_secs_f64();
        let efficiency = if throughput > 0.0 && latency_secs > 0.0 {
            throughput / latency_secs
        } else {
            0.0
        };

        let metrics = SystemMetrics {
            throughput,
            latency,
            queue_length,
            error_rate,
            error_samples,
            adaptation_score,
            efficiency,
            worker_count,
            completed_total: self.completed_total.load(Ordering::Relaxed),
            failed_total: self.failed_total.load(Ordering::Relaxed),
            computed_at: Utc::now(),
        };

        *self.snapshot.write() = metrics.clone();
        metrics
    }

    /// Last published snapshot
    #[must_use]
    pub fn snapshot(&self) -> SystemMetrics {
        self.snapshot.read().clone()
    }

    /// Clear windows and totals
    pub fn reset(&self) {
        *self.windows.lock() = Windows::default();
        *self.snapshot.write() = SystemMetrics::default();
        self.completed_total.store(0, Ordering::Relaxed);
        self.failed_total.store(0, Ordering::Relaxed);
    }
}

/// Publish a snapshot and per-tier depths through the metrics facade
pub fn export(metrics: &SystemMetrics, queue_lengths: &[usize; 5]) {
    ::metrics::gauge!("flowgate.throughput").set(metrics.throughput);
    ::metrics::gauge!("flowgate.latency_seconds").set(metrics.latency.as_secs_f64());
    ::metrics::gauge!("flowgate.error_rate").set(metrics.error_rate);
    ::metrics::gauge!("flowgate.adaptation_score").set(metrics.adaptation_score);
    ::metrics::gauge!("flowgate.efficiency").set(metrics.efficiency);
    ::metrics::gauge!("flowgate.workers.active").set(ratio(metrics.worker_count, 1));

    for (priority, &depth) in TaskPriority::ALL.iter().zip(queue_lengths) {
        ::metrics::gauge!("flowgate.queue.depth", "tier" => priority.as_str()).set(ratio(depth, 1));
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    let n = f64::from(u32::try_from(numerator).unwrap_or(u32::MAX));
    let d = f64::from(u32::try_from(denominator).unwrap_or(u32::MAX));
    if d == 0.0 {
        0.0
    } else {
        n / d
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> MetricsAggregator {
        MetricsAggregator::new(MetricsConfig {
            throughput_window_secs: 10,
            latency_samples: 4,
            error_samples: 5,
            ..MetricsConfig::default()
        })
    }

    #[test]
    fn test_empty_snapshot() {
        let agg = aggregator();
        let m = agg.recompute(0, 0.5, 2);
        assert!(m.throughput.abs() < f64::EPSILON);
        assert_eq!(m.latency, Duration::ZERO);
        assert!(m.error_rate.abs() < f64::EPSILON);
        assert!(m.efficiency.abs() < f64::EPSILON);
        assert_eq!(m.worker_count, 2);
    }

    #[test]
    fn test_throughput_over_trailing_window() {
        let agg = aggregator();
        let start = Instant::now();
        for _ in 0..20 {
            agg.observe_at(true, Duration::from_millis(10), start);
        }
        let m = agg.recompute_at(start + Duration::from_secs(1), 0, 0.5, 1);
        assert!((m.throughput - 2.0).abs() < 1e-9);

        // everything ages out of the 10 s window
        let m = agg.recompute_at(start + Duration::from_secs(11), 0, 0.5, 1);
        assert!(m.throughput.abs() < f64::EPSILON);
        assert_eq!(m.completed_total, 20);
    }

    #[test]
    fn test_latency_uses_recent_samples() {
        let agg = aggregator();
        let now = Instant::now();
        for ms in [1_000, 1_000, 10, 10, 10, 10] {
            agg.observe_at(true, Duration::from_millis(ms), now);
        }
        let m = agg.recompute_at(now, 0, 0.5, 1);
        assert_eq!(m.latency, Duration::from_millis(10));
    }

    #[test]
    fn test_error_rate_and_efficiency() {
        let agg = aggregator();
        let now = Instant::now();
        for success in [false, false, true, true, false, true, true] {
            agg.observe_at(success, Duration::from_millis(500), now);
        }
        let m = agg.recompute_at(now, 3, 0.7, 2);
        // last five outcomes: true, true, false, true, true
        assert!((m.error_rate - 0.2).abs() < 1e-9);
        assert_eq!(m.error_samples, 5);
        assert_eq!(m.failed_total, 3);
        assert_eq!(m.queue_length, 3);
        assert!((m.efficiency - m.throughput / 0.5).abs() < 1e-9);
        assert_eq!(agg.snapshot(), m);
    }

    #[test]
    fn test_reset_clears_everything() {
        let agg = aggregator();
        agg.observe_at(false, Duration::from_millis(5), Instant::now());
        agg.recompute(0, 0.5, 1);
        agg.reset();
        let m = agg.recompute(0, 0.5, 1);
        assert_eq!(m.completed_total, 0);
        assert_eq!(m.error_samples, 0);
    }
}
