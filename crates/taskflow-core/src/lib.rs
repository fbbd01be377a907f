//! Core of the taskflow engine: templates expand into persisted task graphs
//! that a scheduler runs with retries, cascading cancellation and
//! compare-and-set claims.

pub mod action;
pub mod backend;
pub mod binding;
pub mod config;
pub mod context;
pub mod error;
pub mod expander;
pub mod metrics;
pub mod model;
pub mod payload;
pub mod producer;
pub mod retry;
pub mod scheduler;
pub mod status;
pub mod template;

pub use action::{Action, ActionParams, ActionRegistry, ActionRegistryBuilder, ErasedAction, InvokeError, RegistryError};
pub use backend::{Backend, BackendError, InMemoryBackend};
pub use binding::{Binding, BindingError, DeferredBinding};
pub use config::EngineConfig;
pub use context::{ExecuteCtx, Kit};
pub use error::{ActionError, ErrorCode, ErrorKind, TaskflowError};
pub use expander::FlowExpander;
pub use metrics::{ActionMetrics, InMemoryMetrics, MetricsSink, NoopMetrics};
pub use model::{
    Flow, FlowFilter, FlowReason, FlowStatus, FlowView, Page, Task, TaskPatch, TaskReason,
    TaskStatus,
};
pub use payload::Payload;
pub use producer::{AddFlowReq, Producer};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use scheduler::{DispatchOutcome, Scheduler, SchedulerHandle};
pub use status::reduce_flow_status;
pub use template::{CatalogError, Template, TemplateCatalog, TemplateCatalogBuilder, TemplateStep};
