//! # Taskflow - asynchronous task-flow orchestration
//!
//! Named templates expand into persisted graphs of retryable tasks. A
//! scheduler dispatches ready tasks to registered actions under bounded
//! concurrency, cascades failures to dependents and keeps each flow's
//! aggregate status current.
//!
//! ## Features
//!
//! - Core engine with an in-memory backend is always included
//! - `redis`: Redis backend store for multi-process deployments
//! - `full`: Enables all features
//!
//! ```toml
//! [dependencies]
//! taskflow = { version = "0.3.0", features = ["redis"] }
//! ```

use tracing_subscriber::{fmt, EnvFilter};

/// Install a `tracing` subscriber honouring `RUST_LOG`, defaulting to `info`.
pub fn init() {
    init_with_filter("info");
}

/// Install a `tracing` subscriber with `default_filter` unless `RUST_LOG`
/// is set. Calling it twice is harmless.
pub fn init_with_filter(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = fmt().with_env_filter(filter).try_init();
}

pub use taskflow_core as core;

#[cfg(feature = "redis")]
pub use taskflow_redis as redis;

pub use taskflow_core::{
    Action, ActionError, ActionRegistry, AddFlowReq, Binding, EngineConfig, ExecuteCtx, FlowStatus,
    InMemoryBackend, Kit, Producer, RetryPolicy, Scheduler, TaskStatus, TaskflowError, Template,
    TemplateCatalog, TemplateStep,
};
