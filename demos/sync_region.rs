//! Runs the `sync-region` template on the in-memory backend.
//!
//! `fetch_remote` lists the vendor's security groups for a region,
//! `diff_against_store` compares them with the stored copy and
//! `apply_changes` writes the difference back.
//!
//! ```sh
//! cargo run --example sync_region
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use taskflow::core::{ActionParams, InMemoryMetrics};
use taskflow::*;
use tracing::info;

#[derive(Debug, Deserialize)]
struct RegionParams {
    region: String,
}

impl ActionParams for RegionParams {
    fn validate(&self) -> Result<(), String> {
        if self.region.is_empty() {
            return Err("region must not be empty".into());
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Remote {
    region: String,
    groups: Vec<String>,
}

struct FetchRemote;

#[async_trait]
impl Action for FetchRemote {
    type Params = RegionParams;
    type Output = Remote;

    fn name(&self) -> &str {
        "fetch_remote"
    }

    async fn run(&self, ctx: &ExecuteCtx, params: RegionParams) -> Result<Remote, ActionError> {
        info!(rid = ctx.rid(), region = %params.region, "Fetching remote security groups");
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(Remote {
            region: params.region,
            groups: vec!["sg-web".into(), "sg-db".into(), "sg-batch".into()],
        })
    }
}

#[derive(Debug, Deserialize)]
struct DiffParams {
    remote: Remote,
}

impl ActionParams for DiffParams {}

#[derive(Debug, Serialize, Deserialize)]
struct Diff {
    region: String,
    added: Vec<String>,
}

struct DiffAgainstStore {
    stored: Vec<String>,
}

#[async_trait]
impl Action for DiffAgainstStore {
    type Params = DiffParams;
    type Output = Diff;

    fn name(&self) -> &str {
        "diff_against_store"
    }

    async fn run(&self, _ctx: &ExecuteCtx, params: DiffParams) -> Result<Diff, ActionError> {
        let added = params
            .remote
            .groups
            .into_iter()
            .filter(|g| !self.stored.contains(g))
            .collect();
        Ok(Diff {
            region: params.remote.region,
            added,
        })
    }
}

struct ApplyChanges;

#[async_trait]
impl Action for ApplyChanges {
    type Params = Diff;
    type Output = usize;

    fn name(&self) -> &str {
        "apply_changes"
    }

    async fn run(&self, ctx: &ExecuteCtx, diff: Diff) -> Result<usize, ActionError> {
        if ctx.attempt() == 1 {
            // first write hits a throttled vendor API
            return Err(ActionError::transient("rate limited"));
        }
        info!(region = %diff.region, added = ?diff.added, "Applying changes");
        Ok(diff.added.len())
    }
}

impl ActionParams for Diff {}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    taskflow::init();

    let registry = ActionRegistry::builder()
        .register("fetch_remote", FetchRemote)?
        .register(
            "diff_against_store",
            DiffAgainstStore {
                stored: vec!["sg-web".into()],
            },
        )?
        .register("apply_changes", ApplyChanges)?
        .build();

    let catalog = TemplateCatalog::from_json(
        r#"[{
            "name": "sync-region",
            "steps": [
                {"action": "fetch_remote", "params": {"kind": "request"}},
                {"action": "diff_against_store", "depends_on": [0],
                 "params": {"kind": "object", "fields": {"remote": {"kind": "step_result", "step": 0}}}},
                {"action": "apply_changes", "depends_on": [1], "max_attempts": 3,
                 "params": {"kind": "step_result", "step": 1}}
            ]
        }]"#,
    )?;
    catalog.check_actions(&registry)?;

    let backend = Arc::new(InMemoryBackend::new());
    let config = EngineConfig::new()
        .with_worker_count(4)
        .with_poll_interval(Duration::from_millis(10))
        .with_retry_policy(RetryPolicy::new(
            3,
            Duration::from_millis(50),
            Duration::from_secs(1),
            taskflow::core::BackoffStrategy::Exponential,
        ));
    let metrics = Arc::new(InMemoryMetrics::new());
    let producer = Producer::new(backend.clone(), catalog, config.clone());
    let scheduler = Scheduler::with_metrics(backend, registry, config, metrics.clone());

    let mut handle = scheduler.spawn();
    let flow_id = producer
        .add_flow(
            &Kit::new(),
            AddFlowReq::new("sync-region", serde_json::json!({"region": "us-east-1"}))
                .with_memo("nightly sync"),
        )
        .await?;
    info!(%flow_id, "Submitted flow");

    let view = producer
        .wait_for_completion(&flow_id, Duration::from_millis(20))
        .await?;
    handle.stop();
    handle.join().await;

    info!(status = %view.flow.status, "Flow finished");
    for task in &view.tasks {
        info!(step = task.step, action = %task.action, status = %task.status, attempt = task.attempt, "Task");
    }
    let apply = metrics.for_action("apply_changes").await;
    info!(retried = apply.retried, succeeded = apply.succeeded, "apply_changes metrics");
    Ok(())
}
