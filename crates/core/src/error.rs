//! Flowgate Error System
//!
//! Two error families live here. [`EngineError`] is returned to callers of the
//! engine API (submission, lifecycle, configuration). [`TaskError`] is never
//! returned from an API call; it travels inside a failed
//! [`TaskResult`](crate::engine::TaskResult) so per-task failures cannot take
//! down a worker or the monitor.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::engine::TaskPriority;
use crate::types::{TaskId, WorkerId};

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the engine API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Priority tier is at capacity; the task was not accepted
    #[error("Queue full for {priority} tier (capacity: {capacity})")]
    QueueFull {
        /// Tier that rejected the task
        priority: TaskPriority,
        /// Configured tier capacity
        capacity: usize,
    },

    /// A task with the same id is already known to the engine
    #[error("Duplicate task id: {task_id}")]
    DuplicateId {
        /// Conflicting identifier
        task_id: TaskId,
    },

    /// Engine is not running
    #[error("Engine is not running")]
    NotRunning,

    /// Engine is already running
    #[error("Engine is already running")]
    AlreadyRunning,

    /// Invalid or inconsistent configuration
    #[error("Configuration error in '{field}': {reason}")]
    Configuration {
        /// Offending field
        field: String,
        /// Why it was rejected
        reason: String,
    },

    /// Worker thread could not be started
    #[error("Failed to spawn worker: {reason}")]
    WorkerSpawn {
        /// OS error text
        reason: String,
    },
}

impl EngineError {
    /// Create configuration error
    pub fn config<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the same submission later
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }
}

impl From<garde::Report> for EngineError {
    fn from(report: garde::Report) -> Self {
        Self::config("config", format!("Validation failed: {report}"))
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        Self::config("source", err.to_string())
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        Self::config("toml", err.to_string())
    }
}

/// Per-task failure carried inside a result
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskError {
    /// A dependency had no collected result when the task was dequeued
    #[error("Dependency {dependency} has no result")]
    DependencyUnmet {
        /// First missing dependency
        dependency: TaskId,
    },

    /// Deadline had already passed when the task was dequeued
    #[error("Deadline exceeded by {overdue:?}")]
    DeadlineExceeded {
        /// How late the task was picked up
        overdue: Duration,
    },

    /// Callback returned an error or panicked
    #[error("Execution failed: {message}")]
    ExecutionError {
        /// Flattened error chain or panic message
        message: String,
    },

    /// Engine stopped before the task was picked up
    #[error("Task cancelled: engine stopped before execution")]
    Cancelled,
}

/// Adaptive controller failures; logged and recorded, never fatal
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// Tuning action could not be applied
    #[error("Controller action '{action}' failed: {reason}")]
    ActionFailed {
        /// Action name
        action: String,
        /// Failure reason
        reason: String,
    },
}

/// Worker pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Pool already at its configured ceiling
    #[error("Worker pool is full (capacity: {capacity})")]
    PoolFull {
        /// Max worker count
        capacity: usize,
    },

    /// Pool already at its configured floor
    #[error("Worker pool at minimum size ({minimum})")]
    AtMinimum {
        /// Min worker count
        minimum: usize,
    },

    /// Pool is shut down and not accepting new workers
    #[error("Worker pool is closed")]
    PoolClosed,

    /// Thread spawn failed
    #[error("Failed to start worker thread: {reason}")]
    SpawnFailed {
        /// OS error text
        reason: String,
    },

    /// Worker did not stop within the grace period
    #[error("Worker {worker_id} shutdown timeout")]
    ShutdownTimeout {
        /// Worker identifier
        worker_id: WorkerId,
    },

    /// Worker thread panicked outside task execution
    #[error("Worker thread panic: {worker_id}")]
    WorkerPanic {
        /// Worker identifier
        worker_id: WorkerId,
    },
}

impl From<WorkerError> for EngineError {
    fn from(err: WorkerError) -> Self {
        Self::WorkerSpawn {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_full_is_retryable() {
        let err = EngineError::QueueFull {
            priority: TaskPriority::Low,
            capacity: 1,
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("low"));
        assert!(!EngineError::NotRunning.is_retryable());
    }

    #[test]
    fn test_config_constructor() {
        let err = EngineError::config("initial_workers", "must be at least 1");
        assert_eq!(
            err.to_string(),
            "Configuration error in 'initial_workers': must be at least 1"
        );
    }

    #[test]
    fn test_task_error_messages() {
        let err = TaskError::ExecutionError {
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "Execution failed: boom");
        assert!(TaskError::Cancelled.to_string().contains("cancelled"));
    }

    #[test]
    fn test_worker_error_converts() {
        let err: EngineError = WorkerError::SpawnFailed {
            reason: "EAGAIN".to_string(),
        }
        .into();
        assert!(matches!(err, EngineError::WorkerSpawn { .. }));
    }
}
