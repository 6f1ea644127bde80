//! Flowgate Core Prelude
//!
//! Common imports for building and submitting tasks.

// Re-export core types
pub use crate::config::{
    AdaptationConfig, EngineConfig, FeedbackConfig, MetricsConfig, QueueCapacity,
};
pub use crate::engine::{
    AdaptationAction, AdaptationRecord, AdaptationTrigger, ControllerState, Engine, EngineState,
    EngineStatus, Executable, ExecutionContext, SystemMetrics, Task, TaskPriority, TaskResult,
    TaskState, WorkerStatSnapshot,
};
pub use crate::error::{EngineError, EngineResult, TaskError};
pub use crate::types::{TaskId, WorkerId};

// Re-export commonly used external types
pub use serde::{Deserialize, Serialize};
pub use serde_json::{json, Value};
pub use std::sync::Arc;
pub use std::time::{Duration, Instant};
pub use tracing::{debug, error, info, warn};

// Re-export validation
pub use garde::Validate;
