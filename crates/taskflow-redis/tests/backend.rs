mod helpers;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::time::Duration;
use taskflow_core::*;

struct Step {
    name: &'static str,
    fail: bool,
}

#[async_trait]
impl Action for Step {
    type Params = Value;
    type Output = Value;

    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, _ctx: &ExecuteCtx, params: Value) -> Result<Value, ActionError> {
        if self.fail {
            return Err(ActionError::permanent(format!("{} failed", self.name)));
        }
        Ok(json!({ "done": self.name, "input": params }))
    }
}

fn catalog() -> TemplateCatalog {
    TemplateCatalog::builder()
        .register(
            Template::new("sync-region")
                .step(TemplateStep::new("fetch_remote").params(Binding::request_field("/region")))
                .step(
                    TemplateStep::new("diff_against_store")
                        .depends_on([0])
                        .params(Binding::step_field(0, "/input")),
                )
                .step(TemplateStep::new("apply_changes").depends_on([1])),
        )
        .unwrap()
        .build()
}

fn registry(failing: &str) -> ActionRegistry {
    ["fetch_remote", "diff_against_store", "apply_changes"]
        .into_iter()
        .try_fold(ActionRegistry::builder(), |b, name| {
            b.register(name, Step { name, fail: name == failing })
        })
        .unwrap()
        .build()
}

fn engine_config() -> EngineConfig {
    EngineConfig::new()
        .with_poll_interval(Duration::from_millis(10))
        .with_retry_policy(RetryPolicy::new(
            3,
            Duration::ZERO,
            Duration::ZERO,
            BackoffStrategy::Exponential,
        ))
}

#[tokio::test]
async fn test_create_get_and_list() {
    helpers::init_tracing();
    let mut redis = helpers::TestRedis::start().await;
    let backend = redis.backend("t1:").await;
    let producer = Producer::new(backend.clone(), catalog(), engine_config());

    let kit = Kit::with_rid("rid-1");
    let a = producer
        .add_flow(&kit, AddFlowReq::new("sync-region", json!({"region": "us-east-1"})).with_memo("first"))
        .await
        .expect("add flow");
    tokio::time::sleep(Duration::from_millis(5)).await;
    let b = producer
        .add_flow(&kit, AddFlowReq::new("sync-region", json!({"region": "eu-west-1"})))
        .await
        .expect("add flow");

    let view = producer.get_flow(&a).await.expect("get flow");
    assert_eq!(view.flow.memo.as_deref(), Some("first"));
    assert_eq!(view.flow.rid, "rid-1");
    assert_eq!(view.tasks.len(), 3);
    assert_eq!(view.tasks[1].depends_on, vec![view.tasks[0].id.clone()]);
    assert_eq!(view.tasks[0].parameters.body, json!("us-east-1"));

    let listed = producer
        .list_flows(&FlowFilter::default(), Page::first(10))
        .await
        .expect("list");
    assert_eq!(listed.iter().map(|v| v.flow.id.clone()).collect::<Vec<_>>(), vec![a.clone(), b]);
    let second_page = producer
        .list_flows(&FlowFilter::default(), Page::new(1, 10))
        .await
        .expect("list");
    assert_eq!(second_page.len(), 1);

    let missing = producer.get_flow("missing").await.unwrap_err();
    assert_eq!(missing.code(), ErrorCode::NotFound);
    redis.cleanup().await;
}

#[tokio::test]
async fn test_concurrent_cas_single_winner() {
    helpers::init_tracing();
    let mut redis = helpers::TestRedis::start().await;
    let backend = redis.backend("t2:").await;
    let producer = Producer::new(backend.clone(), catalog(), engine_config());
    let id = producer
        .add_flow(&Kit::new(), AddFlowReq::new("sync-region", json!({"region": "x"})))
        .await
        .expect("add flow");
    let task_id = backend.get_tasks(&id).await.expect("tasks")[0].id.clone();

    let attempts = (0..8).map(|_| {
        let backend = backend.clone();
        let task_id = task_id.clone();
        async move {
            backend
                .compare_and_set_task_status(
                    &task_id,
                    TaskStatus::Pending,
                    TaskStatus::Running,
                    TaskPatch::new().attempt(1).started_at(Utc::now()),
                )
                .await
                .expect("cas")
        }
    });
    let results = futures::future::join_all(attempts).await;
    assert_eq!(results.iter().filter(|won| **won).count(), 1);
    let task = backend.get_task(&task_id).await.expect("task");
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.attempt, 1);
    redis.cleanup().await;
}

#[tokio::test]
async fn test_ready_tasks_and_lease_reclaim() {
    helpers::init_tracing();
    let mut redis = helpers::TestRedis::start().await;
    let backend = redis.backend("t3:").await;
    let producer = Producer::new(backend.clone(), catalog(), engine_config());
    let id = producer
        .add_flow(&Kit::new(), AddFlowReq::new("sync-region", json!({"region": "x"})))
        .await
        .expect("add flow");
    let tasks = backend.get_tasks(&id).await.expect("tasks");

    let ready = backend.list_ready_tasks(10).await.expect("ready");
    assert_eq!(ready.iter().map(|t| t.id.clone()).collect::<Vec<_>>(), vec![tasks[0].id.clone()]);

    let long_ago = Utc::now() - chrono::Duration::minutes(10);
    assert!(backend
        .compare_and_set_task_status(
            &tasks[0].id,
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskPatch::new().attempt(1).started_at(long_ago),
        )
        .await
        .expect("cas"));
    assert!(backend.list_ready_tasks(10).await.expect("ready").is_empty());

    let reclaimed = backend
        .reclaim_stale_running(Duration::from_secs(60), 3)
        .await
        .expect("reclaim");
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].status, TaskStatus::Retrying);
    assert_eq!(redis.index("t3:", "tasks:retrying").await, vec![tasks[0].id.clone()]);
    assert!(redis.index("t3:", "tasks:running").await.is_empty());
    let ready = backend.list_ready_tasks(10).await.expect("ready");
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].attempt, 1);

    // A retry scheduled in the future is not ready yet.
    assert!(backend
        .compare_and_set_task_status(
            &tasks[0].id,
            TaskStatus::Retrying,
            TaskStatus::Running,
            TaskPatch::new().attempt(2).started_at(Utc::now()),
        )
        .await
        .expect("cas"));
    assert!(backend
        .compare_and_set_task_status(
            &tasks[0].id,
            TaskStatus::Running,
            TaskStatus::Retrying,
            TaskPatch::new().next_attempt_at(Utc::now() + chrono::Duration::minutes(5)),
        )
        .await
        .expect("cas"));
    assert!(backend.list_ready_tasks(10).await.expect("ready").is_empty());
    redis.cleanup().await;
}

#[tokio::test]
async fn test_terminal_flow_status_is_final() {
    helpers::init_tracing();
    let mut redis = helpers::TestRedis::start().await;
    let backend = redis.backend("t4:").await;
    let producer = Producer::new(backend.clone(), catalog(), engine_config());
    let id = producer
        .add_flow(&Kit::new(), AddFlowReq::new("sync-region", json!({"region": "x"})))
        .await
        .expect("add flow");

    assert!(producer.cancel_flow(&id).await.expect("cancel"));
    assert!(!backend
        .update_flow_status(&id, FlowStatus::Success, None)
        .await
        .expect("update"));
    let view = producer.get_flow(&id).await.expect("get");
    assert_eq!(view.flow.status, FlowStatus::Cancelled);
    assert!(view.tasks.iter().all(|t| t.status == TaskStatus::Cancelled));
    assert!(backend.list_ready_tasks(10).await.expect("ready").is_empty());
    redis.cleanup().await;
}

#[tokio::test]
async fn test_scheduler_runs_flow_on_redis() {
    helpers::init_tracing();
    let mut redis = helpers::TestRedis::start().await;
    let backend = redis.backend("t5:").await;
    let producer = Producer::new(backend.clone(), catalog(), engine_config());

    let ok = producer
        .add_flow(&Kit::new(), AddFlowReq::new("sync-region", json!({"region": "us-east-1"})))
        .await
        .expect("add flow");
    let scheduler = Scheduler::new(backend.clone(), registry("none"), engine_config());
    scheduler.drain().await.expect("drain");
    let view = producer.get_flow(&ok).await.expect("get");
    assert_eq!(view.flow.status, FlowStatus::Success);
    let diff = view.tasks[1].result.as_ref().expect("result");
    assert_eq!(diff.body["input"], json!("us-east-1"));

    let bad = producer
        .add_flow(&Kit::new(), AddFlowReq::new("sync-region", json!({"region": "us-east-1"})))
        .await
        .expect("add flow");
    let scheduler = Scheduler::new(backend.clone(), registry("diff_against_store"), engine_config());
    scheduler.drain().await.expect("drain");
    let view = producer.get_flow(&bad).await.expect("get");
    assert_eq!(view.tasks[0].status, TaskStatus::Success);
    assert_eq!(view.tasks[1].status, TaskStatus::Failed);
    assert_eq!(view.tasks[2].status, TaskStatus::Cancelled);
    assert_eq!(view.flow.status, FlowStatus::Failed);
    for index in ["tasks:pending", "tasks:retrying", "tasks:running"] {
        assert!(redis.index("t5:", index).await.is_empty(), "{index} not empty");
    }
    redis.cleanup().await;
}

#[tokio::test]
async fn test_reclaim_fails_task_without_attempts_left() {
    helpers::init_tracing();
    let mut redis = helpers::TestRedis::start().await;
    let backend = redis.backend("t6:").await;
    let producer = Producer::new(backend.clone(), catalog(), engine_config());
    let id = producer
        .add_flow(&Kit::new(), AddFlowReq::new("sync-region", json!({"region": "x"})))
        .await
        .expect("add flow");
    let tasks = backend.get_tasks(&id).await.expect("tasks");
    assert_eq!(redis.index("t6:", "tasks:pending").await.len(), 3);

    let long_ago = Utc::now() - chrono::Duration::minutes(10);
    assert!(backend
        .compare_and_set_task_status(
            &tasks[0].id,
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskPatch::new().attempt(3).started_at(long_ago),
        )
        .await
        .expect("cas"));
    assert_eq!(redis.index("t6:", "tasks:running").await, vec![tasks[0].id.clone()]);

    let reclaimed = backend
        .reclaim_stale_running(Duration::from_secs(60), 3)
        .await
        .expect("reclaim");
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].status, TaskStatus::Failed);
    assert!(redis.index("t6:", "tasks:running").await.is_empty());
    assert!(redis.index("t6:", "tasks:retrying").await.is_empty());
    assert!(backend.list_ready_tasks(10).await.expect("ready").is_empty());
    let stored = backend.get_task(&tasks[0].id).await.expect("task");
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.reason.expect("reason").kind, ErrorKind::Permanent);
    redis.cleanup().await;
}

#[tokio::test]
async fn test_list_flows_pages_with_and_without_filters() {
    helpers::init_tracing();
    let mut redis = helpers::TestRedis::start().await;
    let backend = redis.backend("t7:").await;
    let producer = Producer::new(backend.clone(), catalog(), engine_config());
    let mut ids = Vec::new();
    for region in ["a", "b", "c", "d"] {
        let id = producer
            .add_flow(&Kit::new(), AddFlowReq::new("sync-region", json!({ "region": region })))
            .await
            .expect("add flow");
        ids.push(id);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(producer.cancel_flow(&ids[1]).await.expect("cancel"));

    let page = backend
        .list_flows(&FlowFilter::default(), Page::new(1, 2))
        .await
        .expect("list");
    assert_eq!(page.iter().map(|f| f.id.clone()).collect::<Vec<_>>(), vec![ids[1].clone(), ids[2].clone()]);

    let pending = FlowFilter {
        status: Some(FlowStatus::Pending),
        ..Default::default()
    };
    let page = backend.list_flows(&pending, Page::new(1, 2)).await.expect("list");
    assert_eq!(page.iter().map(|f| f.id.clone()).collect::<Vec<_>>(), vec![ids[2].clone(), ids[3].clone()]);

    let past_end = backend
        .list_flows(&FlowFilter::default(), Page::new(10, 5))
        .await
        .expect("list");
    assert!(past_end.is_empty());
    redis.cleanup().await;
}

#[tokio::test]
async fn test_prefixes_are_isolated() {
    helpers::init_tracing();
    let mut redis = helpers::TestRedis::start().await;
    let east = redis.backend("east:").await;
    let west = redis.backend("west:").await;
    let east_flow = Producer::new(east.clone(), catalog(), engine_config())
        .add_flow(&Kit::new(), AddFlowReq::new("sync-region", json!({"region": "us-east-1"})))
        .await
        .expect("add flow");
    let west_flow = Producer::new(west.clone(), catalog(), engine_config())
        .add_flow(&Kit::new(), AddFlowReq::new("sync-region", json!({"region": "us-west-2"})))
        .await
        .expect("add flow");

    let listed = east
        .list_flows(&FlowFilter::default(), Page::first(10))
        .await
        .expect("list");
    assert_eq!(listed.iter().map(|f| f.id.clone()).collect::<Vec<_>>(), vec![east_flow.clone()]);
    assert_eq!(west.list_ready_tasks(10).await.expect("ready").len(), 1);

    redis.flush_prefix("east:").await;
    assert!(redis.keys("east:").await.is_empty());
    assert!(!redis.keys("west:").await.is_empty());
    assert_eq!(
        east.get_flow(&east_flow).await.unwrap_err(),
        BackendError::NotFound(format!("flow {east_flow}"))
    );
    assert_eq!(west.get_flow(&west_flow).await.expect("flow").id, west_flow);
    redis.cleanup().await;
}
