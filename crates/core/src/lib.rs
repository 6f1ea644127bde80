//! Flowgate Core - Adaptive Priority Task Engine
//!
//! A priority-scheduled worker pool with a closed feedback loop: results feed a
//! rolling performance model and sliding-window metrics, and an adaptive
//! controller uses them to resize the pool and retune its own cadence.
//!
//! # Features
//!
//! - **Strict priority**: five bounded tiers, FIFO within a tier, no preemption
//! - **Explicit backpressure**: a full tier rejects with `QueueFull`, never blocks
//! - **Captured failures**: callback errors and panics become failed results
//! - **Self-tuning**: pool size, adaptation frequency and monitor interval adapt at runtime
//! - **Zero-panic policy**: library code returns `Result` throughout
//!
//! # Architecture
//!
//! - [`engine`] - the engine facade plus queue, pool, collector, metrics and controller
//! - [`config`] - validated configuration with file and environment layering
//! - [`error`] - API errors and per-task failure reasons
//! - [`types`] - task and worker identifiers
//!
//! # Example
//!
//! ```rust
//! use flowgate_core::{Engine, EngineConfig, EngineResult, Task, TaskPriority};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! fn main() -> EngineResult<()> {
//!     let mut engine = Engine::new(EngineConfig::test())?;
//!     engine.start()?;
//!
//!     let task = Task::from_fn(json!({"x": 2}), |payload, _ctx| {
//!         Ok(json!(payload["x"].as_i64().unwrap_or(0) * 21))
//!     })
//!     .with_priority(TaskPriority::High);
//!
//!     let id = engine.submit(task)?;
//!     if let Some(result) = engine.get_result(&id, Duration::from_secs(5)) {
//!         assert_eq!(result.output, Some(json!(42)));
//!     }
//!
//!     engine.stop()?;
//!     Ok(())
//! }
//! ```

#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::large_stack_arrays,
    clippy::indexing_slicing
)]
#![warn(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::correctness,
    clippy::suspicious,
    clippy::perf,
    clippy::style,
    clippy::complexity,
    clippy::unreachable,
    clippy::redundant_pattern_matching,
    clippy::manual_let_else,
    clippy::needless_pass_by_ref_mut
)]
#![allow(
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::multiple_crate_versions
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Public modules
pub mod config;
pub mod error;
pub mod prelude;
pub mod types;

// Core functionality
pub mod engine;

// Re-exports for convenience
pub use config::{EngineConfig, QueueCapacity};
pub use engine::{
    Engine, EngineState, EngineStatus, Executable, ExecutionContext, SystemMetrics, Task,
    TaskPriority, TaskResult,
};
pub use error::{EngineError, EngineResult, TaskError};
pub use types::{TaskId, WorkerId};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build information
pub const BUILD_INFO: BuildInfo = BuildInfo {
    version: VERSION,
    git_hash: match option_env!("GIT_HASH") {
        Some(hash) => hash,
        None => "unknown",
    },
    profile: if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    },
};

/// Build information structure
#[derive(Debug, Clone)]
pub struct BuildInfo {
    /// Crate version
    pub version: &'static str,
    /// Git commit hash
    pub git_hash: &'static str,
    /// Build profile
    pub profile: &'static str,
}

impl BuildInfo {
    /// Get formatted build information
    #[must_use]
    pub fn formatted(&self) -> String {
        format!(
            "Flowgate Core v{} ({}) git {}",
            self.version, self.profile, self.git_hash
        )
    }
}

/// Create and start an engine from layered configuration
///
/// Reads `path` (if given) and `FLOWGATE__*` environment overrides on top of
/// the defaults.
///
/// # Errors
///
/// Returns error if the configuration is invalid or the engine fails to start.
pub fn init(path: Option<&std::path::Path>) -> EngineResult<Engine> {
    init_with_config(EngineConfig::load(path)?)
}

/// Create and start an engine with an explicit configuration
///
/// # Errors
///
/// Returns error if the configuration is invalid or the engine fails to start.
pub fn init_with_config(config: EngineConfig) -> EngineResult<Engine> {
    tracing::info!("{}", BUILD_INFO.formatted());
    let mut engine = Engine::new(config)?;
    engine.start()?;
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_info() {
        let formatted = BUILD_INFO.formatted();
        assert!(formatted.contains(VERSION));
        assert!(formatted.starts_with("Flowgate Core"));
    }

    #[test]
    fn test_init_with_config_starts_engine() -> EngineResult<()> {
        let mut engine = init_with_config(EngineConfig::test())?;
        assert!(engine.is_running());
        engine.stop()
    }
}
