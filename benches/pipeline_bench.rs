//! Benchmarks for pipeline execution.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;

use stepflow::prelude::*;
use stepflow::testing::fixtures::TestHarness;

fn linear_pipeline(length: usize) -> Pipeline {
    let mut pipeline = Pipeline::new("bench");
    for i in 0..length {
        let mut step = FlowStep::function(
            format!("s{i}"),
            StepFunctionRef::native("flow", "Common", "echo"),
        )
        .with_param(Parameter::mapping("value", format!("value {i}")));
        if i + 1 < length {
            step = step.with_next(format!("s{}", i + 1));
        }
        pipeline = pipeline.with_step(step);
    }
    pipeline
}

fn pipeline_benchmark(c: &mut Criterion) {
    let runtime = Runtime::new().expect("tokio runtime");
    let harness = TestHarness::new();
    let pipeline = linear_pipeline(10);

    c.bench_function("linear_10_steps", |b| {
        b.to_async(&runtime).iter(|| {
            let ctx = harness.context();
            async {
                let result = PipelineExecutor::new()
                    .execute(black_box(&pipeline), ctx)
                    .await;
                black_box(result.success)
            }
        });
    });
}

criterion_group!(benches, pipeline_benchmark);
criterion_main!(benches);
