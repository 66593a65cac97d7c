//! Benchmarks for planning, cache-key derivation and cached reruns.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use flowrun::cache::{derive_key, CacheStrategy};
use flowrun::executor::{Engine, RunRequest};
use flowrun::pipeline::{plan, PipelineBuilder, PipelineGraph, StepDescriptor};
use flowrun::testing::ConstStep;
use serde_json::json;
use std::collections::BTreeMap;

/// `width` parallel chains of `depth` steps, every chain in its own group.
fn layered_graph(width: usize, depth: usize) -> PipelineGraph {
    let mut builder = PipelineBuilder::new("bench");
    for chain in 0..width {
        for level in 0..depth {
            let output = format!("o{chain}_{level}");
            let mut step = StepDescriptor::new(format!("s{chain}_{level}"), ConstStep::single(output.clone(), json!(level)))
                .with_outputs([output])
                .with_group(format!("g{chain}"));
            if level > 0 {
                step = step.with_inputs([format!("o{chain}_{}", level - 1)]);
            }
            builder = builder.step(step);
        }
    }
    builder.build().expect("bench graph is valid")
}

fn planning_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan");
    for (width, depth) in [(4, 10), (16, 25), (32, 50)] {
        let graph = layered_graph(width, depth);
        group.bench_with_input(
            BenchmarkId::from_parameter(width * depth),
            &graph,
            |b, graph| b.iter(|| black_box(plan(graph))),
        );
    }
    group.finish();
}

fn cache_key_benchmark(c: &mut Criterion) {
    let small = json!({"rows": 3, "columns": ["a", "b"]});
    let large = json!((0..1000).map(|i| json!({"id": i, "label": format!("row-{i}")})).collect::<Vec<_>>());
    let params = BTreeMap::from([("lr".to_string(), json!(0.01))]);

    c.bench_function("derive_key/small", |b| {
        b.iter(|| {
            derive_key(
                black_box("train"),
                CacheStrategy::CodeAndInput,
                "fingerprint",
                &[("data", &small)],
                &params,
            )
        });
    });
    c.bench_function("derive_key/large", |b| {
        b.iter(|| {
            derive_key(
                black_box("train"),
                CacheStrategy::CodeAndInput,
                "fingerprint",
                &[("data", &large)],
                &params,
            )
        });
    });
}

fn cached_rerun_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let engine = Engine::in_memory();
    let graph = layered_graph(8, 8);
    runtime
        .block_on(engine.run(&graph, RunRequest::new()))
        .expect("warm-up run");

    c.bench_function("run/fully_cached_64_steps", |b| {
        b.iter(|| runtime.block_on(engine.run(&graph, RunRequest::new())));
    });
}

criterion_group!(benches, planning_benchmark, cache_key_benchmark, cached_rerun_benchmark);
criterion_main!(benches);
