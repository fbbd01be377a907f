//! Caller-facing façade: submit, list, fetch and cancel flows.

use crate::backend::{Backend, BackendError};
use crate::config::EngineConfig;
use crate::context::Kit;
use crate::error::TaskflowError;
use crate::expander::FlowExpander;
use crate::model::{FlowFilter, FlowStatus, FlowView, Page, TaskPatch, TaskStatus};
use crate::template::TemplateCatalog;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const MAX_TEMPLATE_NAME: usize = 64;

/// Submit-flow request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddFlowReq {
    pub template: String,
    #[serde(default = "empty_object")]
    pub params: Value,
    #[serde(default)]
    pub memo: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl AddFlowReq {
    pub fn new(template: impl Into<String>, params: Value) -> Self {
        Self {
            template: template.into(),
            params,
            memo: None,
        }
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }
}

/// Entry point used by an outer API layer.
pub struct Producer<B: Backend> {
    backend: Arc<B>,
    expander: FlowExpander<B>,
    config: EngineConfig,
}

impl<B: Backend> Clone for Producer<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            expander: self.expander.clone(),
            config: self.config.clone(),
        }
    }
}

fn validate_template_name(name: &str) -> Result<(), TaskflowError> {
    if name.is_empty() || name.len() > MAX_TEMPLATE_NAME {
        return Err(TaskflowError::InvalidParameter(format!(
            "template name must be 1..={MAX_TEMPLATE_NAME} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(TaskflowError::InvalidParameter(format!(
            "template name {name:?} contains invalid characters"
        )));
    }
    Ok(())
}

impl<B: Backend> Producer<B> {
    pub fn new(backend: Arc<B>, catalog: TemplateCatalog, config: EngineConfig) -> Self {
        Self {
            expander: FlowExpander::new(backend.clone(), catalog),
            backend,
            config,
        }
    }

    /// Submit a new flow and return its id without waiting for execution.
    #[instrument(skip(self, req), fields(rid = %kit.rid, template = %req.template), level = "debug")]
    pub async fn add_flow(&self, kit: &Kit, req: AddFlowReq) -> Result<String, TaskflowError> {
        validate_template_name(&req.template)?;
        if !req.params.is_object() {
            return Err(TaskflowError::InvalidParameter(
                "request parameters must be a JSON object".into(),
            ));
        }
        self.expander
            .expand(kit, &req.template, &req.params, req.memo)
            .await
    }

    /// Flows matching `filter` with their tasks attached. The page size is
    /// capped by the engine's `max_list_page`.
    #[instrument(skip(self, filter), level = "trace")]
    pub async fn list_flows(&self, filter: &FlowFilter, page: Page) -> Result<Vec<FlowView>, TaskflowError> {
        let page = Page::new(page.offset, page.limit.min(self.config.max_list_page));
        let flows = self.backend.list_flows(filter, page).await?;
        let mut views = Vec::with_capacity(flows.len());
        for flow in flows {
            let tasks = self.backend.get_tasks(&flow.id).await?;
            views.push(FlowView { flow, tasks });
        }
        Ok(views)
    }

    /// One flow with its full task list.
    pub async fn get_flow(&self, flow_id: &str) -> Result<FlowView, TaskflowError> {
        let flow = self.backend.get_flow(flow_id).await?;
        let tasks = self.backend.get_tasks(flow_id).await?;
        Ok(FlowView { flow, tasks })
    }

    /// Cancel a flow. Tasks that have not finished are moved to `Cancelled`;
    /// a running action observes cancellation through its context and its
    /// late result is discarded. Returns `false` if the flow was already
    /// terminal.
    #[instrument(skip(self), level = "debug")]
    pub async fn cancel_flow(&self, flow_id: &str) -> Result<bool, TaskflowError> {
        let flow = self.backend.get_flow(flow_id).await?;
        if flow.status.is_terminal() {
            return Ok(false);
        }
        let now = Utc::now();
        for task in self.backend.get_tasks(flow_id).await? {
            if task.status.is_terminal() {
                continue;
            }
            // The task may move between our read and the write; try the
            // statuses it can still be in, in lifecycle order.
            for expected in [TaskStatus::Pending, TaskStatus::Retrying, TaskStatus::Running] {
                match self
                    .backend
                    .compare_and_set_task_status(
                        &task.id,
                        expected,
                        TaskStatus::Cancelled,
                        TaskPatch::new().finished_at(now),
                    )
                    .await
                {
                    Ok(true) => break,
                    Ok(false) => continue,
                    Err(BackendError::NotFound(_)) => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        let updated = self
            .backend
            .update_flow_status(flow_id, FlowStatus::Cancelled, None)
            .await?;
        if updated {
            debug!(flow_id, "Flow cancelled");
        } else {
            warn!(flow_id, "Flow reached a terminal status before cancellation");
        }
        Ok(updated)
    }

    /// Poll until the flow reaches a terminal status.
    pub async fn wait_for_completion(
        &self,
        flow_id: &str,
        poll_interval: Duration,
    ) -> Result<FlowView, TaskflowError> {
        loop {
            let flow = self.backend.get_flow(flow_id).await?;
            if flow.status.is_terminal() {
                let tasks = self.backend.get_tasks(flow_id).await?;
                return Ok(FlowView { flow, tasks });
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }
}
