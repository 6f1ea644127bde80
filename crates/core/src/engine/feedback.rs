//! Performance Feedback Model
//!
//! Keeps a bounded, time-ordered experience history and condenses the most
//! recent part of it into an adaptation score in [0, 1]. There is no training
//! step: the score is a rolling weighted average where each record's weight is
//! its recency decay multiplied by its rank among the recent window, so the
//! best recent outcomes count the most.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::FeedbackConfig;

/// Score reported before enough history exists
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Inputs describing one completed task
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    /// Processing duration in seconds
    pub duration_secs: f64,
    /// 1.0 on success, 0.0 on failure
    pub success: f64,
    /// Payload size estimate in bytes
    pub payload_size: f64,
    /// Priority mapped onto [0, 1]
    pub priority: f64,
    /// Busy workers over live workers at dequeue
    pub worker_load: f64,
}

impl FeatureVector {
    /// Performance value: inverse duration on success, zero on failure
    #[must_use]
    pub fn performance(&self) -> f64 {
        if self.success > 0.0 {
            1.0 / (1.0 + self.duration_secs.max(0.0))
        } else {
            0.0
        }
    }
}

/// One entry of the experience history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperienceRecord {
    /// Observed features
    pub features: FeatureVector,
    /// Derived performance value
    pub performance: f64,
    /// When the record was appended
    pub recorded_at: DateTime<Utc>,
}

/// Bounded experience history plus the score computed from it
pub struct PerformanceFeedbackModel {
    config: FeedbackConfig,
    records: Mutex<VecDeque<ExperienceRecord>>,
    total_recorded: AtomicU64,
}

impl PerformanceFeedbackModel {
    /// Create empty model
    #[must_use]
    pub fn new(config: FeedbackConfig) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(config.window)),
            config,
            total_recorded: AtomicU64::new(0),
        }
    }

    /// Build the feature vector for a finished task
    #[must_use]
    pub fn features(
        success: bool,
        duration: Duration,
        payload_size: usize,
        priority: f64,
        worker_load: f64,
    ) -> FeatureVector {
        FeatureVector {
            duration_secs: duration.as_secs_f64(),
            success: if success { 1.0 } else { 0.0 },
            payload_size: f64::from(u32::try_from(payload_size).unwrap_or(u32::MAX)),
            priority,
            worker_load,
        }
    }

    /// Append a record, evicting the oldest at capacity; returns its performance value
    pub fn record(&self, features: FeatureVector) -> f64 {
        let performance = features.performance();
        let record = ExperienceRecord {
            features,
            performance,
            recorded_at: Utc::now(),
        };

        let mut records = self.records.lock();
        while records.len() >= self.config.capacity {
            records.pop_front();
        }
        records.push_back(record);
        drop(records);

        self.total_recorded.fetch_add(1, Ordering::Relaxed);
        performance
    }

    /// Adaptation score in [0, 1]; exactly 0.5 below the minimum history size
    #[must_use]
    pub fn score(&self) -> f64 {
        let recent: Vec<f64> = {
            let records = self.records.lock();
            if records.len() < self.config.min_records {
                return NEUTRAL_SCORE;
            }
            records
                .iter()
                .rev()
                .take(self.config.window)
                .map(|r| r.performance)
                .collect()
        };

        weighted_score(&recent, self.config.decay)
    }

    /// Number of retained records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether no records are retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Records appended since creation or the last reset, including evicted ones
    #[must_use]
    pub fn total_recorded(&self) -> u64 {
        self.total_recorded.load(Ordering::Relaxed)
    }

    /// Copy of the newest `n` records, newest first
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<ExperienceRecord> {
        self.records.lock().iter().rev().take(n).cloned().collect()
    }

    /// Forget all history
    pub fn reset(&self) {
        self.records.lock().clear();
        self.total_recorded.store(0, Ordering::Relaxed);
    }
}

/// Weighted average of `performances` (newest first).
///
/// Weight of the record at age `a` with rank `r` (0 = best) among `n` values is
/// `decay^a * (n - r) / n`.
fn weighted_score(performances: &[f64], decay: f64) -> f64 {
    let n = performances.len();
    if n == 0 {
        return NEUTRAL_SCORE;
    }

    let mut by_rank: Vec<usize> = (0..n).collect();
    by_rank.sort_by(|&a, &b| {
        let pa = performances.get(a).copied().unwrap_or(0.0);
        let pb = performances.get(b).copied().unwrap_or(0.0);
        pb.total_cmp(&pa)
    });

    let n_f = f64::from(u32::try_from(n).unwrap_or(u32::MAX));
    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    for (rank, &age) in by_rank.iter().enumerate() {
        let performance = performances.get(age).copied().unwrap_or(0.0);
        let rank_weight = (n_f - f64::from(u32::try_from(rank).unwrap_or(u32::MAX))) / n_f;
        let recency = decay.powi(i32::try_from(age).unwrap_or(i32::MAX));
        let weight = recency * rank_weight;
        weighted += weight * performance;
        total_weight += weight;
    }

    if total_weight <= 0.0 {
        return NEUTRAL_SCORE;
    }
    (weighted / total_weight).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> PerformanceFeedbackModel {
        PerformanceFeedbackModel::new(FeedbackConfig::default())
    }

    fn success(duration_ms: u64) -> FeatureVector {
        PerformanceFeedbackModel::features(true, Duration::from_millis(duration_ms), 16, 0.5, 0.0)
    }

    fn failure() -> FeatureVector {
        PerformanceFeedbackModel::features(false, Duration::from_millis(1), 16, 0.5, 0.0)
    }

    #[test]
    fn test_performance_value() {
        assert!((success(0).performance() - 1.0).abs() < f64::EPSILON);
        assert!((success(1_000).performance() - 0.5).abs() < 1e-9);
        assert!(failure().performance().abs() < f64::EPSILON);
    }

    #[test]
    fn test_neutral_below_min_records() {
        let model = model();
        assert!((model.score() - NEUTRAL_SCORE).abs() < f64::EPSILON);
        for _ in 0..9 {
            model.record(failure());
        }
        assert!((model.score() - NEUTRAL_SCORE).abs() < f64::EPSILON);
        model.record(failure());
        assert!(model.score().abs() < f64::EPSILON);
    }

    #[test]
    fn test_all_instant_successes_score_one() {
        let model = model();
        for _ in 0..20 {
            model.record(success(0));
        }
        assert!((model.score() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_recent_failures_pull_score_down() {
        let model = model();
        for _ in 0..50 {
            model.record(success(0));
        }
        let healthy = model.score();
        for _ in 0..20 {
            model.record(failure());
        }
        let degraded = model.score();
        assert!(degraded < healthy);
        assert!((0.0..=1.0).contains(&degraded));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let model = PerformanceFeedbackModel::new(FeedbackConfig {
            capacity: 10,
            window: 5,
            ..FeedbackConfig::default()
        });
        for ms in 0..15 {
            model.record(success(ms));
        }
        assert_eq!(model.len(), 10);
        assert_eq!(model.total_recorded(), 15);

        let newest = model.recent(1);
        let duration = newest.first().map(|r| r.features.duration_secs);
        assert_eq!(duration, Some(0.014));
    }

    #[test]
    fn test_rank_weighting_favors_best() {
        // newest first: one strong result and one weak result at equal recency
        let score = weighted_score(&[1.0, 0.0], 1.0);
        // weights: best 1.0, worst 0.5 -> 1.0 / 1.5
        assert!((score - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset_clears_history() {
        let model = model();
        for _ in 0..20 {
            model.record(success(1));
        }
        model.reset();
        assert!(model.is_empty());
        assert_eq!(model.total_recorded(), 0);
        assert!((model.score() - NEUTRAL_SCORE).abs() < f64::EPSILON);
    }
}
