use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kolosal_nas::nas::{MacroGraph, OperationRegistry, SearchConfig, Tensor};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::sync::Arc;

fn search_config(layers: usize) -> SearchConfig {
    SearchConfig::default()
        .with_channels(8)
        .with_layers(layers)
        .with_steps(4)
        .with_input_size(16)
}

fn random_batch(size: usize) -> Tensor {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
    Tensor::from_shape_fn((2, 3, size, size), |_| rng.gen::<f64>() - 0.5)
}

fn bench_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward");
    group.sample_size(10); // Fewer samples for full-network passes

    let registry = Arc::new(OperationRegistry::nas_bench_201());
    for layers in [3, 5].iter() {
        let graph = MacroGraph::new(&search_config(*layers), Arc::clone(&registry)).unwrap();
        let child = graph.discretize(&search_config(*layers), &[2; 4]).unwrap();
        let x = random_batch(16);

        group.bench_with_input(BenchmarkId::new("search", layers), &x, |b, x| {
            b.iter(|| graph.forward(black_box(x)).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("discrete", layers), &x, |b, x| {
            b.iter(|| child.forward(black_box(x)).unwrap())
        });
    }

    group.finish();
}

fn bench_discretize(c: &mut Criterion) {
    let mut group = c.benchmark_group("discretize");

    let registry = Arc::new(OperationRegistry::darts());
    for layers in [5, 8].iter() {
        let config = search_config(*layers).with_primitives(&kolosal_nas::nas::DARTS_PRIMITIVES);
        let graph = MacroGraph::new(&config, Arc::clone(&registry)).unwrap();

        group.bench_with_input(BenchmarkId::new("top2", layers), &config, |b, config| {
            b.iter(|| graph.discretize(black_box(config), &[2; 4]).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_forward, bench_discretize);
criterion_main!(benches);
