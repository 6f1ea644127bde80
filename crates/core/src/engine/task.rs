//! Task model
//!
//! A [`Task`] is built by the caller and handed to `Engine::submit`. Once
//! accepted it is wrapped in a [`ScheduledTask`] that carries the engine-side
//! bookkeeping (assigned id, submission instant, payload size estimate).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{TaskId, WorkerId};

/// Priority tier, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Served before everything else
    Critical,
    /// High priority
    High,
    /// Default tier
    #[default]
    Normal,
    /// Low priority
    Low,
    /// Served only when every other tier is empty
    Background,
}

impl TaskPriority {
    /// Every tier in dequeue scan order
    pub const ALL: [Self; 5] = [
        Self::Critical,
        Self::High,
        Self::Normal,
        Self::Low,
        Self::Background,
    ];

    /// Position in scan order (Critical = 0)
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
            Self::Background => 4,
        }
    }

    /// Priority mapped onto [0, 1] with Critical = 1.0 and Background = 0.0
    #[must_use]
    pub fn normalized(self) -> f64 {
        let rank = u32::try_from(4 - self.index()).unwrap_or(0);
        f64::from(rank) / 4.0
    }

    /// Lowercase tier name, used as a metrics label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Background => "background",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a callback can learn about the run it is part of
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Task being executed
    pub task_id: TaskId,
    /// Worker running the task
    pub worker_id: WorkerId,
    /// Tier the task came from
    pub priority: TaskPriority,
    /// When the worker pulled the task off the queue
    pub dequeued_at: Instant,
    /// Time spent queued
    pub queue_wait: Duration,
    /// Caller-supplied context map
    pub values: HashMap<String, Value>,
}

impl ExecutionContext {
    /// Look up a context value
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

/// Task callback capability
///
/// Implemented for any `Fn(&Value, &ExecutionContext) -> anyhow::Result<Value>`,
/// so closures can be submitted directly through [`Task::from_fn`].
#[cfg_attr(test, mockall::automock)]
pub trait Executable: Send + Sync {
    /// Run the task body
    ///
    /// # Errors
    ///
    /// Any error is captured into a failed result; it never reaches the worker loop.
    fn run(&self, payload: &Value, ctx: &ExecutionContext) -> anyhow::Result<Value>;
}

impl<F> Executable for F
where
    F: Fn(&Value, &ExecutionContext) -> anyhow::Result<Value> + Send + Sync,
{
    fn run(&self, payload: &Value, ctx: &ExecutionContext) -> anyhow::Result<Value> {
        self(payload, ctx)
    }
}

/// Unit of work submitted to the engine
#[derive(Clone)]
pub struct Task {
    pub(crate) id: Option<TaskId>,
    pub(crate) payload: Value,
    pub(crate) priority: TaskPriority,
    pub(crate) deadline: Option<Instant>,
    pub(crate) dependencies: Vec<TaskId>,
    pub(crate) estimated_duration: Option<Duration>,
    pub(crate) executable: Arc<dyn Executable>,
    pub(crate) context: HashMap<String, Value>,
}

impl Task {
    /// Create a Normal-priority task from any executable
    pub fn new(payload: Value, executable: Arc<dyn Executable>) -> Self {
        Self {
            id: None,
            payload,
            priority: TaskPriority::Normal,
            deadline: None,
            dependencies: Vec::new(),
            estimated_duration: None,
            executable,
            context: HashMap::new(),
        }
    }

    /// Create a Normal-priority task from a closure
    pub fn from_fn<F>(payload: Value, f: F) -> Self
    where
        F: Fn(&Value, &ExecutionContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::new(payload, Arc::new(f))
    }

    /// Use a caller-chosen id instead of a generated one
    #[must_use]
    pub const fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set priority tier
    #[must_use]
    pub const fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Fail with `DeadlineExceeded` if not dequeued before `deadline`
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now; a timeout too large to represent means no deadline
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Instant::now().checked_add(timeout);
        self
    }

    /// Require a collected result for `dependency` before running
    #[must_use]
    pub fn with_dependency(mut self, dependency: TaskId) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Hint used by the load-aware assigner
    #[must_use]
    pub const fn with_estimated_duration(mut self, estimate: Duration) -> Self {
        self.estimated_duration = Some(estimate);
        self
    }

    /// Attach a context value visible to the callback
    #[must_use]
    pub fn with_context<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Caller-chosen id, if any
    #[must_use]
    pub const fn id(&self) -> Option<TaskId> {
        self.id
    }

    /// Priority tier
    #[must_use]
    pub const fn priority(&self) -> TaskPriority {
        self.priority
    }

    /// Payload
    #[must_use]
    pub const fn payload(&self) -> &Value {
        &self.payload
    }

    /// Declared dependencies
    #[must_use]
    pub fn dependencies(&self) -> &[TaskId] {
        &self.dependencies
    }

    /// Relative cost in [0, 1) derived from the estimated duration; 0.5 when unknown
    #[must_use]
    pub fn complexity(&self) -> f64 {
        self.estimated_duration.map_or(0.5, |estimate| {
            let secs = estimate.as_secs_f64();
            secs / (1.0 + secs)
        })
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("deadline", &self.deadline)
            .field("dependencies", &self.dependencies)
            .field("estimated_duration", &self.estimated_duration)
            .field("context_keys", &self.context.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Accepted task plus submission bookkeeping
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    /// Assigned id
    pub id: TaskId,
    /// The submitted task
    pub task: Task,
    /// Monotonic submission time
    pub submitted_at: Instant,
    /// Wall-clock submission time
    pub submitted_wall: DateTime<Utc>,
    /// Serialized payload length in bytes
    pub payload_size: usize,
}

impl ScheduledTask {
    /// Wrap a task accepted under `id`
    #[must_use]
    pub fn new(id: TaskId, mut task: Task) -> Self {
        task.id = Some(id);
        let payload_size = task.payload.to_string().len();
        Self {
            id,
            task,
            submitted_at: Instant::now(),
            submitted_wall: Utc::now(),
            payload_size,
        }
    }

    /// Priority tier
    #[must_use]
    pub const fn priority(&self) -> TaskPriority {
        self.task.priority
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop() -> Task {
        Task::from_fn(json!({"n": 1}), |payload, _ctx| Ok(payload.clone()))
    }

    #[test]
    fn test_unrepresentable_timeout_means_no_deadline() {
        assert_eq!(noop().with_timeout(Duration::MAX).deadline, None);
        let bounded = noop().with_timeout(Duration::from_secs(5));
        assert!(bounded.deadline.is_some_and(|d| d > Instant::now()));
    }

    #[test]
    fn test_priority_scan_order() {
        let indices: Vec<usize> = TaskPriority::ALL.iter().map(|p| p.index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert!(TaskPriority::Critical < TaskPriority::Background);
    }

    #[test]
    fn test_priority_normalized() {
        assert!((TaskPriority::Critical.normalized() - 1.0).abs() < f64::EPSILON);
        assert!((TaskPriority::Normal.normalized() - 0.5).abs() < f64::EPSILON);
        assert!(TaskPriority::Background.normalized().abs() < f64::EPSILON);
    }

    #[test]
    fn test_priority_serde_lowercase() -> serde_json::Result<()> {
        assert_eq!(serde_json::to_string(&TaskPriority::High)?, "\"high\"");
        let parsed: TaskPriority = serde_json::from_str("\"background\"")?;
        assert_eq!(parsed, TaskPriority::Background);
        Ok(())
    }

    #[test]
    fn test_builder_sets_fields() {
        let dep = TaskId::new();
        let id = TaskId::new();
        let task = noop()
            .with_id(id)
            .with_priority(TaskPriority::Critical)
            .with_dependency(dep)
            .with_estimated_duration(Duration::from_secs(1))
            .with_context("tenant", json!("acme"));

        assert_eq!(task.id(), Some(id));
        assert_eq!(task.priority(), TaskPriority::Critical);
        assert_eq!(task.dependencies(), &[dep]);
        assert!((task.complexity() - 0.5).abs() < f64::EPSILON);
        assert_eq!(task.context.get("tenant"), Some(&json!("acme")));
    }

    #[test]
    fn test_complexity_defaults_to_half() {
        assert!((noop().complexity() - 0.5).abs() < f64::EPSILON);
        let quick = noop().with_estimated_duration(Duration::ZERO);
        assert!(quick.complexity().abs() < f64::EPSILON);
    }

    #[test]
    fn test_closure_executable_runs() -> anyhow::Result<()> {
        let task = noop();
        let ctx = ExecutionContext {
            task_id: TaskId::new(),
            worker_id: WorkerId::from_raw(1),
            priority: TaskPriority::Normal,
            dequeued_at: Instant::now(),
            queue_wait: Duration::ZERO,
            values: HashMap::new(),
        };
        let output = task.executable.run(task.payload(), &ctx)?;
        assert_eq!(output, json!({"n": 1}));
        Ok(())
    }

    #[test]
    fn test_scheduled_task_assigns_id() {
        let id = TaskId::new();
        let scheduled = ScheduledTask::new(id, noop());
        assert_eq!(scheduled.task.id(), Some(id));
        assert_eq!(scheduled.payload_size, r#"{"n":1}"#.len());
    }
}
