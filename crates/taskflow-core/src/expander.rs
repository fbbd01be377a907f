//! Compiles a template and a request into a persisted task graph.

use crate::backend::Backend;
use crate::context::Kit;
use crate::error::TaskflowError;
use crate::model::{Flow, FlowStatus, Task, TaskStatus};
use crate::payload::Payload;
use crate::template::{CatalogError, TemplateCatalog};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, instrument};
use uuid::Uuid;

/// Turns a named template into a `Flow` plus its `Task`s and writes them in
/// one atomic backend operation.
pub struct FlowExpander<B: Backend> {
    backend: Arc<B>,
    catalog: TemplateCatalog,
}

impl<B: Backend> Clone for FlowExpander<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            catalog: self.catalog.clone(),
        }
    }
}

impl<B: Backend> FlowExpander<B> {
    pub fn new(backend: Arc<B>, catalog: TemplateCatalog) -> Self {
        Self { backend, catalog }
    }

    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    /// Expand `template_name` against `request` and persist the result.
    ///
    /// Step indices are translated to task ids once, here. Bindings to
    /// sibling results are stored on the task as deferred bindings. On any
    /// persistence failure no flow or task is left behind.
    #[instrument(skip(self, request, memo), fields(rid = %kit.rid), level = "debug")]
    pub async fn expand(
        &self,
        kit: &Kit,
        template_name: &str,
        request: &Value,
        memo: Option<String>,
    ) -> Result<String, TaskflowError> {
        let template = self.catalog.select(template_name).map_err(|e| match e {
            CatalogError::UnknownTemplate(name) => TaskflowError::UnknownTemplate(name),
            other => TaskflowError::Config(other.to_string()),
        })?;

        let now = Utc::now();
        let flow_id = Uuid::new_v4().to_string();
        let task_ids: Vec<String> = template
            .steps
            .iter()
            .map(|_| Uuid::new_v4().to_string())
            .collect();

        let mut tasks = Vec::with_capacity(template.steps.len());
        for (idx, step) in template.steps.iter().enumerate() {
            let (body, deferred) = step
                .params
                .materialize(request, &task_ids)
                .map_err(|e| TaskflowError::InvalidParameter(format!("step {idx} ({}): {e}", step.action)))?;
            tasks.push(Task {
                id: task_ids[idx].clone(),
                flow_id: flow_id.clone(),
                step: idx,
                action: step.action.clone(),
                parameters: Payload::new(step.action.clone(), body),
                deferred,
                depends_on: step.depends_on.iter().map(|d| task_ids[*d].clone()).collect(),
                status: TaskStatus::Pending,
                attempt: 0,
                max_attempts: step.max_attempts,
                timeout_secs: step.timeout_secs,
                result: None,
                reason: None,
                next_attempt_at: None,
                created_at: now,
                started_at: None,
                finished_at: None,
            });
        }

        let flow = Flow {
            id: flow_id.clone(),
            template: template.name.clone(),
            status: FlowStatus::Pending,
            rid: kit.rid.clone(),
            memo,
            reason: None,
            task_ids,
            created_at: now,
            updated_at: now,
        };

        let n = tasks.len();
        self.backend
            .create_flow_with_tasks(flow, tasks)
            .await
            .map_err(|e| {
                error!(template = template_name, error = %e, "Failed to persist task graph");
                TaskflowError::ExpansionFailed(e.to_string())
            })?;
        debug!(flow_id = %flow_id, tasks = n, "Expanded template {}", template_name);
        Ok(flow_id)
    }
}
