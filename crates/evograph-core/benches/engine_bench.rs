//! # Engine Benchmarks
//!
//! Append, replay and conceptual k-NN.
//!
//! Run with: `cargo bench -p evograph-core`

#![allow(clippy::float_arithmetic)]

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use evograph_core::aggregate::DomainEvent;
use evograph_core::{
    AggregateId, AggregateRoot, ConceptualIndex, ConceptualPoint, ConceptualSpace, EventStore,
    GraphAggregate, GraphEvent, GraphId, InMemoryEventStore, Metric, NewEvent, NodeId,
};
use std::collections::BTreeMap;
use std::hint::black_box;

/// A graph creation followed by `size - 1` node additions.
fn node_events(size: usize) -> Vec<NewEvent> {
    let mut events = vec![GraphEvent::GraphCreated {
        graph_id: GraphId::new(),
        name: "bench".into(),
    }];
    events.extend((1..size).map(|i| GraphEvent::NodeAdded {
        node_id: NodeId::new(),
        label: format!("n{i}"),
        properties: BTreeMap::new(),
    }));
    events
        .iter()
        .map(|e| NewEvent::from_typed(e.event_type(), e).expect("encode"))
        .collect()
}

/// Deterministic pseudo-random coordinates.
fn lattice_point(i: usize, dimensions: usize) -> Vec<f32> {
    (0..dimensions)
        .map(|d| ((i * 31 + d * 17) % 97) as f32 / 9.7)
        .collect()
}

// =============================================================================
// BENCHMARKS
// =============================================================================

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_single");

    for size in [100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let events = node_events(size);
            b.iter(|| {
                let store = InMemoryEventStore::new();
                let id = AggregateId::new();
                for (version, event) in events.iter().enumerate() {
                    store
                        .append(id, "graph", version as u64, vec![event.clone()])
                        .expect("append");
                }
                black_box(store)
            });
        });
    }

    group.finish();
}

fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay");

    for size in [100, 1000, 10000].iter() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        store
            .append(id, "graph", 0, node_events(*size))
            .expect("append");
        let events = store.load(id, 0).expect("load");

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                black_box(
                    AggregateRoot::<GraphAggregate>::rehydrate(id, None, &events).expect("replay"),
                )
            });
        });
    }

    group.finish();
}

fn bench_k_nearest(c: &mut Criterion) {
    let mut group = c.benchmark_group("k_nearest");

    for size in [1000, 10000].iter() {
        let space = ConceptualSpace::new(8, Metric::Euclidean).expect("space");
        let mut index = ConceptualIndex::new(space);
        for i in 0..*size {
            index
                .upsert(ConceptualPoint::new(NodeId::new(), lattice_point(i, 8), 1.0))
                .expect("upsert");
        }
        let query = lattice_point(7, 8);

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(index.k_nearest(&query, 10).expect("knn")));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_append, bench_replay, bench_k_nearest);

criterion_main!(benches);
