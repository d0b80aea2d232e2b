//! # Property-Based Tests
//!
//! Determinism and algebraic invariants of the engine, checked with
//! proptest over generated inputs.

#![allow(clippy::float_arithmetic)]

use chrono::{TimeZone, Utc};
use evograph_core::{
    AggregateId, AggregateRoot, CollaborationEvent, CollaborationLog, ConceptualIndex,
    ConceptualPoint, ConceptualSpace, EventMetadata, EventStore, GraphAggregate, GraphCommand,
    GraphSummaryProjection, InMemoryEventStore, Metric, NodeId, ProjectionRunner, Repository,
    SnapshotPolicy,
};
use proptest::collection::vec;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// GENERATORS
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    AddNode,
    AddEdge(usize, usize),
    RemoveNode(usize),
    RequireAcyclic,
    Freeze,
    Unfreeze,
    Rename(String),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::AddNode),
        4 => (0usize..16, 0usize..16).prop_map(|(a, b)| Op::AddEdge(a, b)),
        1 => (0usize..16).prop_map(Op::RemoveNode),
        1 => Just(Op::RequireAcyclic),
        1 => Just(Op::Freeze),
        1 => Just(Op::Unfreeze),
        1 => "[a-z]{1,8}".prop_map(Op::Rename),
    ]
}

fn to_command(op: &Op, nodes: &[NodeId]) -> Option<GraphCommand> {
    let pick = |i: usize| nodes.get(i % nodes.len().max(1)).copied();
    Some(match op {
        Op::AddNode => GraphCommand::AddNode {
            label: "n".into(),
            node_id: None,
            properties: BTreeMap::new(),
        },
        Op::AddEdge(a, b) => GraphCommand::AddEdge {
            source: pick(*a)?,
            target: pick(*b)?,
            label: "e".into(),
            edge_id: None,
        },
        Op::RemoveNode(i) => GraphCommand::RemoveNode { node_id: pick(*i)? },
        Op::RequireAcyclic => GraphCommand::RequireAcyclic {},
        Op::Freeze => GraphCommand::Freeze {},
        Op::Unfreeze => GraphCommand::Unfreeze {},
        Op::Rename(name) => GraphCommand::Rename { name: name.clone() },
    })
}

/// Run generated operations; rejected commands are part of the test.
fn drive(
    repo: &Repository<GraphAggregate, Arc<InMemoryEventStore>>,
    id: AggregateId,
    ops: &[Op],
) -> AggregateRoot<GraphAggregate> {
    repo.execute(
        id,
        &GraphCommand::CreateGraph { name: "g".into(), graph_id: None },
        EventMetadata::default(),
    )
    .expect("create");
    for op in ops {
        let root = repo.load(id).expect("load");
        let nodes: Vec<NodeId> = root.state.graph().nodes().map(|n| n.id).collect();
        if let Some(command) = to_command(op, &nodes) {
            let _ = repo.execute(id, &command, EventMetadata::default());
        }
    }
    repo.load(id).expect("load")
}

fn state_json(root: &AggregateRoot<GraphAggregate>) -> serde_json::Value {
    serde_json::to_value(&root.state).expect("json")
}

fn point_in(dimensions: usize) -> impl Strategy<Value = Vec<f32>> {
    vec(-100.0f32..100.0, dimensions)
}

// =============================================================================
// PROPERTY TESTS
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Replaying the log from scratch reproduces the committed state, and
    /// version always equals the number of stored events.
    #[test]
    fn replay_is_deterministic(ops in vec(op(), 0..40)) {
        let repo = Repository::new(Arc::new(InMemoryEventStore::new()))
            .with_snapshot_policy(SnapshotPolicy::never());
        let id = AggregateId::new();
        let committed = drive(&repo, id, &ops);

        let events = repo.store().load(id, 0).expect("events");
        prop_assert_eq!(committed.version, events.len() as u64);

        let first = AggregateRoot::<GraphAggregate>::rehydrate(id, None, &events).expect("replay");
        let second = AggregateRoot::<GraphAggregate>::rehydrate(id, None, &events).expect("replay");
        prop_assert_eq!(state_json(&first), state_json(&committed));
        prop_assert_eq!(state_json(&first), state_json(&second));
    }

    /// Snapshot at any version plus the tail equals a full replay.
    #[test]
    fn snapshot_plus_tail_equals_full_replay(ops in vec(op(), 1..40), cut in 0usize..40) {
        let repo = Repository::new(Arc::new(InMemoryEventStore::new()))
            .with_snapshot_policy(SnapshotPolicy::never());
        let id = AggregateId::new();
        let full = drive(&repo, id, &ops);
        let events = repo.store().load(id, 0).expect("events");

        let at = cut % events.len() + 1;
        let head = AggregateRoot::<GraphAggregate>::rehydrate(id, None, &events[..at]).expect("head");
        let snapshot = head.to_snapshot().expect("snapshot");
        let resumed = AggregateRoot::<GraphAggregate>::rehydrate(id, Some(&snapshot), &events[at..])
            .expect("resume");

        prop_assert_eq!(resumed.version, full.version);
        prop_assert_eq!(state_json(&resumed), state_json(&full));
    }

    /// Applying the feed twice leaves the projection as applying it once.
    #[test]
    fn projection_application_is_idempotent(ops in vec(op(), 0..30)) {
        let repo = Repository::new(Arc::new(InMemoryEventStore::new()));
        let id = AggregateId::new();
        drive(&repo, id, &ops);
        let feed = repo.store().read_all(0, 10_000).expect("feed");

        let mut once = ProjectionRunner::new(GraphSummaryProjection::new());
        once.apply_batch(feed.clone()).expect("once");
        let mut twice = ProjectionRunner::new(GraphSummaryProjection::new());
        twice.apply_batch(feed.clone()).expect("first");
        prop_assert_eq!(twice.apply_batch(feed).expect("second"), 0);

        prop_assert_eq!(once.projection().get(id), twice.projection().get(id));
        prop_assert_eq!(once.checkpoint(), twice.checkpoint());
    }

    /// The built-in metrics satisfy the metric-space axioms.
    #[test]
    fn builtin_metrics_are_metrics(
        (a, b, c, weights) in (1usize..8).prop_flat_map(|d| {
            (point_in(d), point_in(d), point_in(d), vec(0.1f32..10.0, d))
        })
    ) {
        let metrics = [
            Metric::Euclidean,
            Metric::Manhattan,
            Metric::Chebyshev,
            Metric::WeightedEuclidean(weights),
        ];
        for metric in &metrics {
            let ab = metric.distance(&a, &b);
            let ba = metric.distance(&b, &a);
            let bc = metric.distance(&b, &c);
            let ac = metric.distance(&a, &c);
            let slack = 1e-3 * (1.0 + ab + bc);

            prop_assert!(ab >= 0.0, "{} non-negative", metric.name());
            prop_assert!(metric.distance(&a, &a).abs() <= 1e-6, "{} identity", metric.name());
            prop_assert!((ab - ba).abs() <= 1e-6 * (1.0 + ab), "{} symmetry", metric.name());
            prop_assert!(ac <= ab + bc + slack, "{} triangle", metric.name());
        }
    }

    /// k-nearest results are sorted by distance, then node id.
    #[test]
    fn k_nearest_is_ordered(points in vec(point_in(2), 1..30), query in point_in(2), k in 1usize..10) {
        let space = ConceptualSpace::new(2, Metric::Euclidean).expect("space");
        let mut index = ConceptualIndex::new(space);
        for p in points {
            index.upsert(ConceptualPoint::new(NodeId::new(), p, 1.0)).expect("upsert");
        }
        let hits = index.k_nearest(&query, k).expect("knn");
        prop_assert_eq!(hits.len(), k.min(index.len()));
        for pair in hits.windows(2) {
            let ((ia, da), (ib, db)) = (pair[0], pair[1]);
            prop_assert!(da < db || (da == db && ia < ib));
        }
    }

    /// Merging collaboration logs in any order gives the same result.
    #[test]
    fn lww_merge_is_order_independent(
        (writes, order) in vec((0usize..3, 0usize..4, 0i64..50, 0i32..100), 1..20)
            .prop_flat_map(|w| {
                let n = w.len();
                (Just(w), Just((0..n).collect::<Vec<usize>>()).prop_shuffle())
            })
    ) {
        let sources = ["alice", "bob", "carol"];
        let keys = ["a", "b", "c", "d"];
        let events: Vec<CollaborationEvent> = writes
            .iter()
            .map(|(s, k, t, v)| {
                let at = Utc.timestamp_millis_opt(*t).single().expect("timestamp");
                CollaborationEvent::new("ctx", "topic", sources[*s], keys[*k], serde_json::json!(v))
                    .expect("event")
                    .at(at)
            })
            .collect();

        // One replica merges single-event logs in generation order...
        let mut left = CollaborationLog::new();
        for e in &events {
            let mut single = CollaborationLog::new();
            single.insert(e.clone()).expect("insert");
            left.merge(&single);
        }

        // ...the other inserts in a shuffled order.
        let mut right = CollaborationLog::new();
        for i in &order {
            right.insert(events[*i].clone()).expect("insert");
        }

        prop_assert_eq!(left.state("ctx", "topic"), right.state("ctx", "topic"));
        prop_assert_eq!(&left, &right);
        prop_assert_eq!(left.merge(&right), 0);
    }
}
