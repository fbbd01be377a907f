//! Metrics hooks for dispatch outcomes.
//!
//! The scheduler reports every dispatch, success, failure, retry and
//! cancellation to a [`MetricsSink`], keyed by template and action name.
//! Exporting the numbers is left to the sink implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Counters for one `(template, action)` pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionMetrics {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    /// Sum of run durations across every finished attempt.
    pub total_duration: Duration,
}

/// Receiver of scheduler events.
#[async_trait]
pub trait MetricsSink: Send + Sync + 'static {
    async fn on_dispatch(&self, template: &str, action: &str);
    async fn on_success(&self, template: &str, action: &str, elapsed: Duration);
    async fn on_failure(&self, template: &str, action: &str, elapsed: Duration);
    async fn on_retry(&self, template: &str, action: &str, elapsed: Duration);
    async fn on_cancelled(&self, template: &str, action: &str);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

#[async_trait]
impl MetricsSink for NoopMetrics {
    async fn on_dispatch(&self, _template: &str, _action: &str) {}
    async fn on_success(&self, _template: &str, _action: &str, _elapsed: Duration) {}
    async fn on_failure(&self, _template: &str, _action: &str, _elapsed: Duration) {}
    async fn on_retry(&self, _template: &str, _action: &str, _elapsed: Duration) {}
    async fn on_cancelled(&self, _template: &str, _action: &str) {}
}

/// In-memory counters for testing and local development.
#[derive(Clone, Default)]
pub struct InMemoryMetrics {
    inner: Arc<Mutex<HashMap<(String, String), ActionMetrics>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for one template/action pair.
    pub async fn get(&self, template: &str, action: &str) -> ActionMetrics {
        let map = self.inner.lock().await;
        map.get(&(template.to_string(), action.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Counters for an action summed over every template.
    pub async fn for_action(&self, action: &str) -> ActionMetrics {
        let map = self.inner.lock().await;
        map.iter()
            .filter(|((_, a), _)| a == action)
            .fold(ActionMetrics::default(), |mut acc, (_, m)| {
                acc.dispatched += m.dispatched;
                acc.succeeded += m.succeeded;
                acc.failed += m.failed;
                acc.retried += m.retried;
                acc.cancelled += m.cancelled;
                acc.total_duration += m.total_duration;
                acc
            })
    }

    /// Copy of every counter.
    pub async fn snapshot(&self) -> HashMap<(String, String), ActionMetrics> {
        self.inner.lock().await.clone()
    }

    async fn update(&self, template: &str, action: &str, f: impl FnOnce(&mut ActionMetrics) + Send) {
        let mut map = self.inner.lock().await;
        let entry = map
            .entry((template.to_string(), action.to_string()))
            .or_default();
        f(entry);
    }
}

#[async_trait]
impl MetricsSink for InMemoryMetrics {
    async fn on_dispatch(&self, template: &str, action: &str) {
        self.update(template, action, |m| m.dispatched += 1).await;
    }

    async fn on_success(&self, template: &str, action: &str, elapsed: Duration) {
        self.update(template, action, |m| {
            m.succeeded += 1;
            m.total_duration += elapsed;
        })
        .await;
    }

    async fn on_failure(&self, template: &str, action: &str, elapsed: Duration) {
        self.update(template, action, |m| {
            m.failed += 1;
            m.total_duration += elapsed;
        })
        .await;
    }

    async fn on_retry(&self, template: &str, action: &str, elapsed: Duration) {
        self.update(template, action, |m| {
            m.retried += 1;
            m.total_duration += elapsed;
        })
        .await;
    }

    async fn on_cancelled(&self, template: &str, action: &str) {
        self.update(template, action, |m| m.cancelled += 1).await;
    }
}
