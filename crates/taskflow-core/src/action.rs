//! Actions and the action registry.
//!
//! An [`Action`] is a named unit of business logic. Tasks refer to actions by
//! name; the registry resolves that name at dispatch time to a type-erased
//! [`ErasedAction`] that decodes the task payload into the action's own
//! parameter type, runs it and encodes the result.

use crate::context::ExecuteCtx;
use crate::error::ActionError;
use crate::payload::Payload;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Parameter shape of an action.
pub trait ActionParams: DeserializeOwned + Send + 'static {
    /// Check decoded parameters before the action runs.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl ActionParams for serde_json::Value {}

/// A named, polymorphic unit of work invoked by a task.
#[async_trait]
pub trait Action: Send + Sync + 'static {
    /// Parameters decoded from the task payload.
    type Params: ActionParams;
    /// Value stored as the task result on success.
    type Output: Serialize + Send;

    /// Canonical action name; must match the registry key.
    fn name(&self) -> &str;

    /// Execute the action.
    async fn run(&self, ctx: &ExecuteCtx, params: Self::Params) -> Result<Self::Output, ActionError>;
}

/// Why an erased invocation did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    /// The payload did not decode into, or validate as, the action's parameters.
    Decode(String),
    /// The action body failed.
    Action(ActionError),
}

/// Object-safe view of an [`Action`], stored in the registry.
#[async_trait]
pub trait ErasedAction: Send + Sync {
    fn name(&self) -> &str;

    /// Decode and validate `params`, run the action, encode its output.
    async fn invoke(&self, ctx: &ExecuteCtx, params: &Payload) -> Result<Payload, InvokeError>;
}

#[async_trait]
impl<A: Action> ErasedAction for A {
    fn name(&self) -> &str {
        Action::name(self)
    }

    async fn invoke(&self, ctx: &ExecuteCtx, params: &Payload) -> Result<Payload, InvokeError> {
        let decoded: A::Params = params
            .decode()
            .map_err(|e| InvokeError::Decode(e.to_string()))?;
        decoded.validate().map_err(InvokeError::Decode)?;
        let output = self.run(ctx, decoded).await.map_err(InvokeError::Action)?;
        Payload::encode(Action::name(self), &output)
            .map_err(|e| InvokeError::Action(ActionError::permanent(format!("encode result: {e}"))))
    }
}

/// Configuration errors raised while building the registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("action {0} is already registered")]
    Duplicate(String),
    #[error("action registered as {key} reports name {name}")]
    NameMismatch { key: String, name: String },
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("a global action registry is already installed")]
    AlreadyInstalled,
}

static GLOBAL_ACTIONS: OnceLock<ActionRegistry> = OnceLock::new();

/// Maps action names to their implementations.
///
/// Built once at startup; cloning shares the same read-only table.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: Arc<HashMap<String, Arc<dyn ErasedAction>>>,
}

impl ActionRegistry {
    pub fn builder() -> ActionRegistryBuilder {
        ActionRegistryBuilder::default()
    }

    /// Resolve an action by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ErasedAction>, RegistryError> {
        self.actions
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownAction(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Install this registry as the process-wide one. Succeeds only once.
    pub fn install_global(self) -> Result<(), RegistryError> {
        GLOBAL_ACTIONS
            .set(self)
            .map_err(|_| RegistryError::AlreadyInstalled)
    }

    /// The process-wide registry, if one was installed.
    pub fn global() -> Option<ActionRegistry> {
        GLOBAL_ACTIONS.get().cloned()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

/// Collects registrations; registration is only possible before `build`.
#[derive(Default)]
pub struct ActionRegistryBuilder {
    actions: HashMap<String, Arc<dyn ErasedAction>>,
}

impl ActionRegistryBuilder {
    /// Register `action` under `name`.
    pub fn register<A: Action>(mut self, name: &str, action: A) -> Result<Self, RegistryError> {
        if Action::name(&action) != name {
            return Err(RegistryError::NameMismatch {
                key: name.to_string(),
                name: Action::name(&action).to_string(),
            });
        }
        if self.actions.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.actions.insert(name.to_string(), Arc::new(action));
        Ok(self)
    }

    pub fn build(self) -> ActionRegistry {
        ActionRegistry {
            actions: Arc::new(self.actions),
        }
    }
}
