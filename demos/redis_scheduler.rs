//! Runs a producer and two schedulers against one Redis database.
//!
//! ```sh
//! TASKFLOW_REDIS_URL=redis://127.0.0.1:6379/ cargo run --example redis_scheduler --features redis
//! ```

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use taskflow::redis::{RedisBackend, RedisClient, RedisConfig};
use taskflow::*;
use tracing::info;

struct Echo(&'static str);

#[async_trait]
impl Action for Echo {
    type Params = Value;
    type Output = Value;

    fn name(&self) -> &str {
        self.0
    }

    async fn run(&self, ctx: &ExecuteCtx, params: Value) -> Result<Value, ActionError> {
        info!(action = self.0, task_id = ctx.task_id(), attempt = ctx.attempt(), "Running");
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(json!({ "action": self.0, "input": params }))
    }
}

fn registry() -> Result<ActionRegistry, Box<dyn std::error::Error>> {
    Ok(ActionRegistry::builder()
        .register("fetch_remote", Echo("fetch_remote"))?
        .register("diff_against_store", Echo("diff_against_store"))?
        .register("apply_changes", Echo("apply_changes"))?
        .build())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    taskflow::init();

    let url = std::env::var("TASKFLOW_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".into());
    let client = RedisClient::new(
        RedisConfig::new(url)
            .with_key_prefix("taskflow-demo:")
            .with_connection_timeout(Duration::from_secs(5)),
    )
    .await?;
    let backend = Arc::new(RedisBackend::new(client));

    let catalog = TemplateCatalog::builder()
        .register(
            Template::new("sync-region")
                .step(TemplateStep::new("fetch_remote").params(Binding::request_field("/region")))
                .step(
                    TemplateStep::new("diff_against_store")
                        .depends_on([0])
                        .params(Binding::step_result(0)),
                )
                .step(
                    TemplateStep::new("apply_changes")
                        .depends_on([1])
                        .params(Binding::step_field(1, "/input")),
                ),
        )?
        .build();

    let config = EngineConfig::new()
        .with_worker_count(2)
        .with_poll_interval(Duration::from_millis(50));
    let producer = Producer::new(backend.clone(), catalog, config.clone());

    // Two schedulers share the store; compare-and-set claims keep them apart.
    let mut handles = vec![
        Scheduler::new(backend.clone(), registry()?, config.clone()).spawn(),
        Scheduler::new(backend.clone(), registry()?, config).spawn(),
    ];

    let mut flows = Vec::new();
    for region in ["us-east-1", "eu-west-1", "ap-south-1"] {
        let id = producer
            .add_flow(&Kit::new(), AddFlowReq::new("sync-region", json!({ "region": region })))
            .await?;
        info!(flow_id = %id, region, "Submitted flow");
        flows.push(id);
    }

    for id in &flows {
        let view = producer.wait_for_completion(id, Duration::from_millis(100)).await?;
        info!(flow_id = %id, status = %view.flow.status, "Flow finished");
    }

    for handle in &handles {
        handle.stop();
    }
    for handle in &mut handles {
        handle.join().await;
    }
    Ok(())
}
