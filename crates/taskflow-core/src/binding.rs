//! Parameter binding expressions.
//!
//! A template step describes its parameters as a [`Binding`] tree. During
//! expansion everything that can be known up front (literals, request
//! fields) is materialized into the task's payload; references to an
//! earlier step's result become [`DeferredBinding`]s that the scheduler
//! fills in just before dispatch.

use crate::payload::Payload;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A parameter-binding expression declared on a template step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Binding {
    /// A constant value.
    Literal { value: Value },
    /// The caller's request, or the value at a JSON pointer inside it.
    Request {
        #[serde(default)]
        pointer: Option<String>,
    },
    /// The result of an earlier step, or the value at a JSON pointer inside it.
    StepResult {
        step: usize,
        #[serde(default)]
        pointer: Option<String>,
    },
    /// An object whose fields are bound independently.
    Object { fields: BTreeMap<String, Binding> },
}

impl Default for Binding {
    fn default() -> Self {
        Binding::Request { pointer: None }
    }
}

impl Binding {
    pub fn literal(value: Value) -> Self {
        Binding::Literal { value }
    }

    pub fn request() -> Self {
        Binding::Request { pointer: None }
    }

    pub fn request_field(pointer: impl Into<String>) -> Self {
        Binding::Request {
            pointer: Some(pointer.into()),
        }
    }

    pub fn step_result(step: usize) -> Self {
        Binding::StepResult { step, pointer: None }
    }

    pub fn step_field(step: usize, pointer: impl Into<String>) -> Self {
        Binding::StepResult {
            step,
            pointer: Some(pointer.into()),
        }
    }

    pub fn object<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Binding)>,
        K: Into<String>,
    {
        Binding::Object {
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Every step index this expression reads a result from.
    pub fn referenced_steps(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.collect_steps(&mut out);
        out
    }

    fn collect_steps(&self, out: &mut Vec<usize>) {
        match self {
            Binding::StepResult { step, .. } => out.push(*step),
            Binding::Object { fields } => fields.values().for_each(|b| b.collect_steps(out)),
            Binding::Literal { .. } | Binding::Request { .. } => {}
        }
    }

    /// Resolve against the request. `task_ids` maps step index to the
    /// concrete task id created for it in this expansion.
    pub fn materialize(
        &self,
        request: &Value,
        task_ids: &[String],
    ) -> Result<(Value, Vec<DeferredBinding>), BindingError> {
        let mut deferred = Vec::new();
        let value = self.materialize_at(request, task_ids, String::new(), &mut deferred)?;
        Ok((value, deferred))
    }

    fn materialize_at(
        &self,
        request: &Value,
        task_ids: &[String],
        target: String,
        deferred: &mut Vec<DeferredBinding>,
    ) -> Result<Value, BindingError> {
        match self {
            Binding::Literal { value } => Ok(value.clone()),
            Binding::Request { pointer } => match pointer.as_deref() {
                None | Some("") => Ok(request.clone()),
                Some(p) => request
                    .pointer(p)
                    .cloned()
                    .ok_or_else(|| BindingError::MissingRequestField(p.to_string())),
            },
            Binding::StepResult { step, pointer } => {
                let source_task = task_ids
                    .get(*step)
                    .ok_or(BindingError::UnknownStep(*step))?
                    .clone();
                deferred.push(DeferredBinding {
                    target,
                    source_task,
                    pointer: pointer.clone(),
                });
                Ok(Value::Null)
            }
            Binding::Object { fields } => {
                let mut map = Map::new();
                for (key, binding) in fields {
                    let child = format!("{}/{}", target, escape_pointer_token(key));
                    let v = binding.materialize_at(request, task_ids, child, deferred)?;
                    map.insert(key.clone(), v);
                }
                Ok(Value::Object(map))
            }
        }
    }
}

/// A reference to a sibling task's result, stored on a task at expansion
/// time and resolved by the scheduler once that sibling has succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredBinding {
    /// JSON pointer inside the task's parameters to write to; empty for the root.
    pub target: String,
    pub source_task: String,
    pub pointer: Option<String>,
}

impl DeferredBinding {
    /// Write the selected part of `source` (the sibling's result) into `params`.
    pub fn apply(&self, params: &mut Value, source: &Payload) -> Result<(), BindingError> {
        let value = source
            .select(self.pointer.as_deref())
            .cloned()
            .ok_or_else(|| BindingError::MissingResultField {
                task_id: self.source_task.clone(),
                pointer: self.pointer.clone().unwrap_or_default(),
            })?;
        if self.target.is_empty() {
            *params = value;
            return Ok(());
        }
        let slot = params
            .pointer_mut(&self.target)
            .ok_or_else(|| BindingError::MissingTarget(self.target.clone()))?;
        *slot = value;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindingError {
    #[error("request has no field at {0}")]
    MissingRequestField(String),
    #[error("binding references unknown step {0}")]
    UnknownStep(usize),
    #[error("result of task {task_id} has no field at {pointer}")]
    MissingResultField { task_id: String, pointer: String },
    #[error("parameters have no slot at {0}")]
    MissingTarget(String),
}

fn escape_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}
