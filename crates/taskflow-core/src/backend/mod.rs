//! Durable persistence contract for flows and tasks.
//!
//! The engine talks to storage only through [`Backend`]. Every mutation the
//! scheduler performs is either an atomic multi-row insert
//! ([`Backend::create_flow_with_tasks`]) or a per-row compare-and-set, so
//! several scheduler processes may share one backend without a lock server.

pub mod memory;

pub use memory::InMemoryBackend;

use crate::error::ErrorKind;
use crate::model::{
    Flow, FlowFilter, FlowReason, FlowStatus, Page, Task, TaskPatch, TaskReason, TaskStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in a Backend implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Other error: {0}")]
    Other(String),
}

/// Storage operations consumed by the expander, producer and scheduler.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Persist a flow and all of its tasks in one atomic operation.
    /// Either the whole graph becomes visible or nothing does.
    async fn create_flow_with_tasks(&self, flow: Flow, tasks: Vec<Task>) -> Result<String, BackendError>;

    /// Fetch one flow. Fails with `NotFound` if it does not exist.
    async fn get_flow(&self, flow_id: &str) -> Result<Flow, BackendError>;

    /// Flows matching `filter`, oldest first, restricted to `page`.
    async fn list_flows(&self, filter: &FlowFilter, page: Page) -> Result<Vec<Flow>, BackendError>;

    /// All tasks of a flow in step order.
    async fn get_tasks(&self, flow_id: &str) -> Result<Vec<Task>, BackendError>;

    /// Fetch one task. Fails with `NotFound` if it does not exist.
    async fn get_task(&self, task_id: &str) -> Result<Task, BackendError>;

    /// Atomically move a task from `expected` to `new`, applying `patch`.
    /// Returns `false` without writing if the stored status is not `expected`.
    async fn compare_and_set_task_status(
        &self,
        task_id: &str,
        expected: TaskStatus,
        new: TaskStatus,
        patch: TaskPatch,
    ) -> Result<bool, BackendError>;

    /// Set a flow's aggregate status. Terminal statuses are final: returns
    /// `false` without writing if the flow is already terminal.
    async fn update_flow_status(
        &self,
        flow_id: &str,
        status: FlowStatus,
        reason: Option<FlowReason>,
    ) -> Result<bool, BackendError>;

    /// Up to `limit` tasks that are `Pending`, or `Retrying` past their
    /// backoff deadline, and whose dependencies have all succeeded.
    async fn list_ready_tasks(&self, limit: usize) -> Result<Vec<Task>, BackendError>;

    /// Reclaim every task that has been `Running` longer than `lease_timeout`.
    /// A task with attempts left moves to `Retrying`, immediately due. A task
    /// that has used its `max_attempts` (or `default_max_attempts` when the
    /// task has none) moves straight to `Failed` in the same write, so no
    /// other worker can claim it in between. Returns the reclaimed tasks as
    /// stored.
    async fn reclaim_stale_running(
        &self,
        lease_timeout: Duration,
        default_max_attempts: u32,
    ) -> Result<Vec<Task>, BackendError>;
}

/// Convert a std duration to a chrono one, saturating on overflow.
pub fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Status and reason for a task whose lease expired, decided from the
/// attempts it has used.
pub fn reclaim_transition(task: &Task, default_max_attempts: u32, now: DateTime<Utc>) -> (TaskStatus, TaskPatch) {
    let max = task.max_attempts.unwrap_or(default_max_attempts);
    if task.attempt >= max {
        let reason = TaskReason {
            kind: ErrorKind::Permanent,
            message: format!("lease expired after {} attempts", task.attempt),
            attempt: task.attempt,
            at: now,
        };
        (TaskStatus::Failed, TaskPatch::new().reason(reason).finished_at(now))
    } else {
        let reason = TaskReason {
            kind: ErrorKind::Transient,
            message: "lease expired while running".into(),
            attempt: task.attempt,
            at: now,
        };
        (TaskStatus::Retrying, TaskPatch::new().reason(reason).next_attempt_at(now))
    }
}
