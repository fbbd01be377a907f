//! In-memory implementation of [`Backend`] for testing and local development.

use super::{chrono_duration, reclaim_transition, Backend, BackendError};
use crate::model::{Flow, FlowFilter, FlowReason, FlowStatus, Page, Task, TaskPatch, TaskStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{instrument, trace};

#[derive(Default)]
struct State {
    flows: HashMap<String, Flow>,
    flow_order: Vec<String>,
    tasks: HashMap<String, Task>,
    task_order: Vec<String>,
}

/// In-memory backend. Every operation holds one lock, which makes each
/// call atomic with respect to every other call.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    inner: Arc<Mutex<State>>,
    #[cfg(test)]
    fail_after_tasks: Option<usize>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose next graph write fails after `n` tasks were inserted.
    #[cfg(test)]
    pub(crate) fn failing_after(n: usize) -> Self {
        Self {
            fail_after_tasks: Some(n),
            ..Self::default()
        }
    }

    /// Number of flows currently stored.
    pub async fn flow_count(&self) -> usize {
        self.inner.lock().await.flows.len()
    }

    /// Number of tasks currently stored.
    pub async fn task_count(&self) -> usize {
        self.inner.lock().await.tasks.len()
    }
}

fn validate_graph(state: &State, flow: &Flow, tasks: &[Task]) -> Result<(), BackendError> {
    if state.flows.contains_key(&flow.id) {
        return Err(BackendError::Conflict(format!("flow {} already exists", flow.id)));
    }
    let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    if ids.len() != tasks.len() {
        return Err(BackendError::Conflict("duplicate task id in graph".into()));
    }
    for task in tasks {
        if task.flow_id != flow.id {
            return Err(BackendError::Other(format!(
                "task {} belongs to flow {}, not {}",
                task.id, task.flow_id, flow.id
            )));
        }
        if state.tasks.contains_key(&task.id) {
            return Err(BackendError::Conflict(format!("task {} already exists", task.id)));
        }
        if let Some(dep) = task.depends_on.iter().find(|d| !ids.contains(d.as_str())) {
            return Err(BackendError::Other(format!(
                "task {} depends on {} outside its flow",
                task.id, dep
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl Backend for InMemoryBackend {
    #[instrument(skip(self, flow, tasks), fields(flow_id = %flow.id), level = "trace")]
    async fn create_flow_with_tasks(&self, flow: Flow, tasks: Vec<Task>) -> Result<String, BackendError> {
        let mut state = self.inner.lock().await;
        validate_graph(&state, &flow, &tasks)?;

        let mut inserted: Vec<String> = Vec::with_capacity(tasks.len());
        for (_idx, task) in tasks.into_iter().enumerate() {
            #[cfg(test)]
            if self.fail_after_tasks == Some(_idx) {
                for id in &inserted {
                    state.tasks.remove(id);
                }
                let keep = state.task_order.len() - inserted.len();
                state.task_order.truncate(keep);
                return Err(BackendError::Io("injected write failure".into()));
            }
            inserted.push(task.id.clone());
            state.task_order.push(task.id.clone());
            state.tasks.insert(task.id.clone(), task);
        }

        let flow_id = flow.id.clone();
        state.flow_order.push(flow_id.clone());
        state.flows.insert(flow_id.clone(), flow);
        trace!(tasks = inserted.len(), "Created flow {}", flow_id);
        Ok(flow_id)
    }

    async fn get_flow(&self, flow_id: &str) -> Result<Flow, BackendError> {
        let state = self.inner.lock().await;
        state
            .flows
            .get(flow_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("flow {flow_id}")))
    }

    async fn list_flows(&self, filter: &FlowFilter, page: Page) -> Result<Vec<Flow>, BackendError> {
        let state = self.inner.lock().await;
        Ok(state
            .flow_order
            .iter()
            .filter_map(|id| state.flows.get(id))
            .filter(|f| filter.matches(f))
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }

    async fn get_tasks(&self, flow_id: &str) -> Result<Vec<Task>, BackendError> {
        let state = self.inner.lock().await;
        let flow = state
            .flows
            .get(flow_id)
            .ok_or_else(|| BackendError::NotFound(format!("flow {flow_id}")))?;
        Ok(flow
            .task_ids
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .cloned()
            .collect())
    }

    async fn get_task(&self, task_id: &str) -> Result<Task, BackendError> {
        let state = self.inner.lock().await;
        state
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("task {task_id}")))
    }

    #[instrument(skip(self, patch), level = "trace")]
    async fn compare_and_set_task_status(
        &self,
        task_id: &str,
        expected: TaskStatus,
        new: TaskStatus,
        patch: TaskPatch,
    ) -> Result<bool, BackendError> {
        let mut state = self.inner.lock().await;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| BackendError::NotFound(format!("task {task_id}")))?;
        if task.status != expected {
            trace!(actual = %task.status, "CAS lost for task {}", task_id);
            return Ok(false);
        }
        patch.apply(task, new);
        Ok(true)
    }

    #[instrument(skip(self, reason), level = "trace")]
    async fn update_flow_status(
        &self,
        flow_id: &str,
        status: FlowStatus,
        reason: Option<FlowReason>,
    ) -> Result<bool, BackendError> {
        let mut state = self.inner.lock().await;
        let flow = state
            .flows
            .get_mut(flow_id)
            .ok_or_else(|| BackendError::NotFound(format!("flow {flow_id}")))?;
        if flow.status.is_terminal() {
            return Ok(false);
        }
        flow.status = status;
        if reason.is_some() {
            flow.reason = reason;
        }
        flow.updated_at = Utc::now();
        Ok(true)
    }

    async fn list_ready_tasks(&self, limit: usize) -> Result<Vec<Task>, BackendError> {
        let state = self.inner.lock().await;
        let now = Utc::now();
        let ready = state
            .task_order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|t| t.is_due(now))
            .filter(|t| {
                t.depends_on.iter().all(|dep| {
                    state
                        .tasks
                        .get(dep)
                        .map_or(false, |d| d.status == TaskStatus::Success)
                })
            })
            .take(limit)
            .cloned()
            .collect();
        Ok(ready)
    }

    #[instrument(skip(self), level = "trace")]
    async fn reclaim_stale_running(
        &self,
        lease_timeout: Duration,
        default_max_attempts: u32,
    ) -> Result<Vec<Task>, BackendError> {
        let mut state = self.inner.lock().await;
        let now = Utc::now();
        let cutoff = now - chrono_duration(lease_timeout);
        let mut reclaimed = Vec::new();
        for task in state.tasks.values_mut() {
            let stale = task.status == TaskStatus::Running
                && task.started_at.map_or(true, |at| at < cutoff);
            if !stale {
                continue;
            }
            let (status, patch) = reclaim_transition(task, default_max_attempts, now);
            patch.apply(task, status);
            reclaimed.push(task.clone());
        }
        Ok(reclaimed)
    }
}
