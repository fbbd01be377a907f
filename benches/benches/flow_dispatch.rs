use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use taskflow_core::*;

struct Noop;

#[async_trait]
impl Action for Noop {
    type Params = Value;
    type Output = Value;

    fn name(&self) -> &str {
        "noop"
    }

    async fn run(&self, _ctx: &ExecuteCtx, params: Value) -> Result<Value, ActionError> {
        Ok(params)
    }
}

/// A fan-out/fan-in graph: one root, `width` parallel steps, one join.
fn fan_template(width: usize) -> Template {
    let mut template = Template::new("fan").step(TemplateStep::new("noop").params(Binding::request()));
    for _ in 0..width {
        template = template.step(
            TemplateStep::new("noop")
                .depends_on([0])
                .params(Binding::step_result(0)),
        );
    }
    template.step(TemplateStep::new("noop").depends_on(1..=width))
}

fn catalog(width: usize) -> TemplateCatalog {
    TemplateCatalog::builder()
        .register(fan_template(width))
        .expect("valid template")
        .build()
}

fn registry() -> ActionRegistry {
    ActionRegistry::builder()
        .register("noop", Noop)
        .expect("register")
        .build()
}

fn benchmark_expansion(c: &mut Criterion) {
    let mut group = c.benchmark_group("flow_expansion");
    let rt = tokio::runtime::Runtime::new().expect("runtime");

    for width in [4usize, 32] {
        let producer = Producer::new(
            Arc::new(InMemoryBackend::new()),
            catalog(width),
            EngineConfig::new(),
        );
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.to_async(&rt).iter(|| async {
                producer
                    .add_flow(&Kit::new(), AddFlowReq::new("fan", json!({"n": 1})))
                    .await
                    .expect("add flow")
            })
        });
    }
    group.finish();
}

fn benchmark_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("flow_drain");
    group.measurement_time(Duration::from_secs(10));
    let rt = tokio::runtime::Runtime::new().expect("runtime");

    for width in [4usize, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            b.to_async(&rt).iter(|| async move {
                let backend = Arc::new(InMemoryBackend::new());
                let config = EngineConfig::new().with_worker_count(16);
                let producer = Producer::new(backend.clone(), catalog(width), config.clone());
                producer
                    .add_flow(&Kit::new(), AddFlowReq::new("fan", json!({"n": 1})))
                    .await
                    .expect("add flow");
                Scheduler::new(backend, registry(), config)
                    .drain()
                    .await
                    .expect("drain")
            })
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_expansion, benchmark_drain);
criterion_main!(benches);
