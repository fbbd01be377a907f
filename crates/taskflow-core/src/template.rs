//! Flow templates and the template catalog.
//!
//! A template is an ordered list of steps. Each step names an action, a
//! parameter binding and the indices of earlier steps it depends on.
//! Templates are validated when they enter the catalog, so an invalid
//! dependency shape is a startup error and never reaches expansion.

use crate::action::ActionRegistry;
use crate::binding::Binding;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// One step of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateStep {
    pub action: String,
    #[serde(default)]
    pub params: Binding,
    #[serde(default)]
    pub depends_on: Vec<usize>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl TemplateStep {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            params: Binding::default(),
            depends_on: Vec::new(),
            max_attempts: None,
            timeout_secs: None,
        }
    }

    pub fn params(mut self, params: Binding) -> Self {
        self.params = params;
        self
    }

    pub fn depends_on(mut self, steps: impl IntoIterator<Item = usize>) -> Self {
        self.depends_on = steps.into_iter().collect();
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// Static definition of a flow's step sequence and dependency shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub steps: Vec<TemplateStep>,
}

impl Template {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: TemplateStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Check the dependency shape and result bindings.
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.name.trim().is_empty() {
            return Err(CatalogError::Invalid {
                template: self.name.clone(),
                reason: "template name is empty".into(),
            });
        }
        if self.steps.is_empty() {
            return Err(CatalogError::Invalid {
                template: self.name.clone(),
                reason: "template has no steps".into(),
            });
        }
        // ancestors[i] = every step i transitively depends on
        let mut ancestors: Vec<BTreeSet<usize>> = Vec::with_capacity(self.steps.len());
        for (idx, step) in self.steps.iter().enumerate() {
            if step.action.trim().is_empty() {
                return Err(CatalogError::Invalid {
                    template: self.name.clone(),
                    reason: format!("step {idx} has no action"),
                });
            }
            if step.max_attempts == Some(0) {
                return Err(CatalogError::Invalid {
                    template: self.name.clone(),
                    reason: format!("step {idx} allows zero attempts"),
                });
            }
            let mut set = BTreeSet::new();
            for &dep in &step.depends_on {
                if dep >= idx {
                    return Err(CatalogError::ForwardDependency {
                        template: self.name.clone(),
                        step: idx,
                        depends_on: dep,
                    });
                }
                set.insert(dep);
                set.extend(ancestors[dep].iter().copied());
            }
            if has_duplicates(&step.depends_on) {
                return Err(CatalogError::Invalid {
                    template: self.name.clone(),
                    reason: format!("step {idx} lists a dependency twice"),
                });
            }
            for referenced in step.params.referenced_steps() {
                if !set.contains(&referenced) {
                    return Err(CatalogError::UnboundResult {
                        template: self.name.clone(),
                        step: idx,
                        referenced,
                    });
                }
            }
            ancestors.push(set);
        }
        Ok(())
    }
}

fn has_duplicates(items: &[usize]) -> bool {
    let unique: BTreeSet<_> = items.iter().collect();
    unique.len() != items.len()
}

/// Configuration errors raised while loading templates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("template {0} is already registered")]
    Duplicate(String),
    #[error("template {template}: step {step} depends on step {depends_on}, which is not earlier")]
    ForwardDependency {
        template: String,
        step: usize,
        depends_on: usize,
    },
    #[error("template {template}: step {step} binds the result of step {referenced}, which it does not depend on")]
    UnboundResult {
        template: String,
        step: usize,
        referenced: usize,
    },
    #[error("template {template}: step {step} uses unknown action {action}")]
    UnknownAction {
        template: String,
        step: usize,
        action: String,
    },
    #[error("template {template} is invalid: {reason}")]
    Invalid { template: String, reason: String },
    #[error("unknown template: {0}")]
    UnknownTemplate(String),
    #[error("template document could not be parsed: {0}")]
    Parse(String),
    #[error("a global template catalog is already installed")]
    AlreadyInstalled,
}

static GLOBAL_TEMPLATES: OnceLock<TemplateCatalog> = OnceLock::new();

/// Read-mostly map from template name to validated definition.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: Arc<HashMap<String, Arc<Template>>>,
}

impl TemplateCatalog {
    pub fn builder() -> TemplateCatalogBuilder {
        TemplateCatalogBuilder::default()
    }

    /// Parse and validate a JSON array of templates.
    pub fn from_json(doc: &str) -> Result<Self, CatalogError> {
        let templates: Vec<Template> =
            serde_json::from_str(doc).map_err(|e| CatalogError::Parse(e.to_string()))?;
        templates
            .into_iter()
            .try_fold(Self::builder(), |b, t| b.register(t))
            .map(TemplateCatalogBuilder::build)
    }

    pub fn select(&self, name: &str) -> Result<Arc<Template>, CatalogError> {
        self.templates
            .get(name)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownTemplate(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.templates.keys().cloned().collect();
        names.sort();
        names
    }

    /// Verify every step names an action present in `registry`.
    pub fn check_actions(&self, registry: &ActionRegistry) -> Result<(), CatalogError> {
        for template in self.templates.values() {
            for (step, s) in template.steps.iter().enumerate() {
                if !registry.contains(&s.action) {
                    return Err(CatalogError::UnknownAction {
                        template: template.name.clone(),
                        step,
                        action: s.action.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Install this catalog as the process-wide one. Succeeds only once.
    pub fn install_global(self) -> Result<(), CatalogError> {
        GLOBAL_TEMPLATES
            .set(self)
            .map_err(|_| CatalogError::AlreadyInstalled)
    }

    /// The process-wide catalog, if one was installed.
    pub fn global() -> Option<TemplateCatalog> {
        GLOBAL_TEMPLATES.get().cloned()
    }
}

#[derive(Debug, Default)]
pub struct TemplateCatalogBuilder {
    templates: HashMap<String, Arc<Template>>,
}

impl TemplateCatalogBuilder {
    pub fn register(mut self, template: Template) -> Result<Self, CatalogError> {
        template.validate()?;
        if self.templates.contains_key(&template.name) {
            return Err(CatalogError::Duplicate(template.name));
        }
        self.templates
            .insert(template.name.clone(), Arc::new(template));
        Ok(self)
    }

    pub fn build(self) -> TemplateCatalog {
        TemplateCatalog {
            templates: Arc::new(self.templates),
        }
    }
}
