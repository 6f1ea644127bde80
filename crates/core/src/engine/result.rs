//! Task results

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TaskError;
use crate::types::{TaskId, WorkerId};

use super::TaskPriority;

/// Per-run measurements attached to every result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Callback wall time
    pub duration: Duration,
    /// Time between submission and dequeue
    pub queue_wait: Duration,
    /// Worker that produced the result; `None` for tasks cancelled while queued
    pub worker_id: Option<WorkerId>,
    /// Serialized payload length in bytes
    pub payload_size: usize,
}

/// Feedback model state observed when the result was produced
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct AdaptationSnapshot {
    /// Adaptation score after this result was recorded
    pub score: f64,
    /// Performance value this result contributed
    pub performance: f64,
    /// Normalized pool load at dequeue
    pub worker_load: f64,
}

/// Outcome of one task; created once by the executing worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Task this result belongs to
    pub task_id: TaskId,
    /// Tier the task ran from
    pub priority: TaskPriority,
    /// Whether the callback returned a value
    pub success: bool,
    /// Callback output on success
    pub output: Option<Value>,
    /// Failure reason
    pub error: Option<TaskError>,
    /// Processing duration
    pub duration: Duration,
    /// Detailed measurements
    pub metrics: PerformanceMetrics,
    /// Feedback snapshot
    pub adaptation: AdaptationSnapshot,
    /// Wall-clock completion time
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    /// Successful result
    #[must_use]
    pub fn success(
        task_id: TaskId,
        priority: TaskPriority,
        output: Value,
        metrics: PerformanceMetrics,
    ) -> Self {
        Self {
            task_id,
            priority,
            success: true,
            output: Some(output),
            error: None,
            duration: metrics.duration,
            metrics,
            adaptation: AdaptationSnapshot::default(),
            completed_at: Utc::now(),
        }
    }

    /// Failed result
    #[must_use]
    pub fn failure(
        task_id: TaskId,
        priority: TaskPriority,
        error: TaskError,
        metrics: PerformanceMetrics,
    ) -> Self {
        Self {
            task_id,
            priority,
            success: false,
            output: None,
            error: Some(error),
            duration: metrics.duration,
            metrics,
            adaptation: AdaptationSnapshot::default(),
            completed_at: Utc::now(),
        }
    }

    /// Metrics label for the outcome
    #[must_use]
    pub const fn outcome_label(&self) -> &'static str {
        match &self.error {
            None => "success",
            Some(TaskError::DependencyUnmet { .. }) => "dependency_unmet",
            Some(TaskError::DeadlineExceeded { .. }) => "deadline_exceeded",
            Some(TaskError::ExecutionError { .. }) => "execution_error",
            Some(TaskError::Cancelled) => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metrics() -> PerformanceMetrics {
        PerformanceMetrics {
            duration: Duration::from_millis(5),
            queue_wait: Duration::from_millis(1),
            worker_id: Some(WorkerId::from_raw(3)),
            payload_size: 2,
        }
    }

    #[test]
    fn test_success_result() {
        let result = TaskResult::success(TaskId::new(), TaskPriority::High, json!(42), metrics());
        assert!(result.success);
        assert_eq!(result.output, Some(json!(42)));
        assert_eq!(result.duration, Duration::from_millis(5));
        assert_eq!(result.outcome_label(), "success");
    }

    #[test]
    fn test_failure_result_serializes() -> serde_json::Result<()> {
        let result = TaskResult::failure(
            TaskId::new(),
            TaskPriority::Low,
            TaskError::Cancelled,
            metrics(),
        );
        assert!(!result.success);
        assert_eq!(result.outcome_label(), "cancelled");

        let encoded = serde_json::to_value(&result)?;
        assert_eq!(encoded["priority"], json!("low"));
        assert_eq!(encoded["success"], json!(false));
        Ok(())
    }
}
