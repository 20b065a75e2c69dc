//! HNSW insert and search throughput.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use rand::Rng;
use scintirete_core::{HnswParams, MetricKind, OpGuard, VectorId};
use scintirete_index::HnswGraph;
use std::collections::HashMap;

const DIM: usize = 128;

fn random_store(n: usize) -> HashMap<VectorId, Vec<f32>> {
    let mut rng = rand::rng();
    (1..=n as VectorId)
        .map(|id| {
            let v: Vec<f32> = (0..DIM).map(|_| rng.random_range(-1.0..1.0)).collect();
            (id, v)
        })
        .collect()
}

fn bench_insert(c: &mut Criterion) {
    let source = random_store(1000);
    let ids: Vec<VectorId> = source.keys().copied().collect();
    let guard = OpGuard::unbounded();

    c.bench_function("hnsw_build_1k_128d", |b| {
        b.iter(|| {
            let graph = HnswGraph::build(
                HnswParams::default(),
                MetricKind::Cosine,
                black_box(&ids),
                &source,
                &guard,
            )
            .unwrap();
            black_box(graph.node_count())
        })
    });
}

fn bench_search(c: &mut Criterion) {
    let source = random_store(10_000);
    let mut ids: Vec<VectorId> = source.keys().copied().collect();
    ids.sort_unstable();
    let guard = OpGuard::unbounded();
    let graph = HnswGraph::build(
        HnswParams::default(),
        MetricKind::Cosine,
        &ids,
        &source,
        &guard,
    )
    .unwrap();

    let query: Vec<f32> = (0..DIM).map(|i| (i as f32 * 0.37).sin()).collect();
    c.bench_function("hnsw_search_10k_128d_top10", |b| {
        b.iter(|| {
            graph
                .search(black_box(&query), 10, 100, &source, &guard)
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_insert, bench_search);
criterion_main!(benches);
