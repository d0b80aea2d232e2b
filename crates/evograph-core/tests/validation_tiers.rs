//! # Validation Tier Tests (T0-T4)
//!
//! If ANY tier fails, the engine is INVALID.
//!
//! ## Tiers
//! - T0: Graph Substrate Integrity
//! - T1: State Machine Totality
//! - T2: Event Log Guarantees
//! - T3: Projection Convergence
//! - T4: Routing and Collaboration

use evograph_core::{
    Aggregate, AggregateId, AggregateRoot, EventMetadata, EventStore, EvographError, Graph,
    GraphAggregate, GraphCommand, GraphEvent, GraphState, InMemoryEventStore, Invariant, NewEvent,
    NodeId, ProjectionRunner, RedbEventStore, Repository, SnapshotPolicy, Subgraph, transition,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Barrier};

fn meta() -> EventMetadata {
    EventMetadata::default()
}

fn add_node(node_id: NodeId) -> GraphCommand {
    GraphCommand::AddNode {
        label: "n".into(),
        node_id: Some(node_id),
        properties: BTreeMap::new(),
    }
}

// =============================================================================
// TIER T0: GRAPH SUBSTRATE INTEGRITY
// =============================================================================

mod t0_graph_substrate {
    use super::*;

    /// T0.1: A cycle-creating edge fails and leaves the graph unchanged.
    #[test]
    fn cycle_edge_rejected_without_change() {
        let mut g: Graph<&str, ()> = Graph::new();
        g.add_invariant(Invariant::Acyclic).expect("invariant");
        let a = g.add_node("a").expect("add");
        let b = g.add_node("b").expect("add");
        let c = g.add_node("c").expect("add");
        g.add_edge(a, b, ()).expect("a->b");
        g.add_edge(b, c, ()).expect("b->c");
        let before = serde_json::to_value(&g).expect("json");

        let err = g.add_edge(c, a, ()).expect_err("cycle");
        assert_eq!(err, EvographError::ViolatedInvariant(vec!["acyclic".into()]));
        assert_eq!(serde_json::to_value(&g).expect("json"), before);
        assert_eq!(g.edge_count(), 2);
    }

    /// T0.2: Graph G contains node A with Subgraph(H); attaching G under a
    /// node of H fails and leaves both unchanged.
    #[test]
    fn recursive_graph_rejected() {
        let h: Graph<(), ()> = Graph::new();
        let mut g: Graph<(), ()> = Graph::new();
        let a = g.add_node(()).expect("add");
        g.attach_component(a, Subgraph::new(h)).expect("nest");

        let mut h_edit: Graph<(), ()> = g
            .component::<Subgraph>(a)
            .and_then(|s| s.to_graph())
            .expect("typed");
        let inner = h_edit.add_node(()).expect("add");
        let err = h_edit
            .attach_component(inner, Subgraph::new(g.clone()))
            .expect_err("recursive");
        assert_eq!(err, EvographError::RecursiveSelfReference(g.id()));
        assert!(h_edit.component::<Subgraph>(inner).is_none());
        assert_eq!(g.total_node_count(), 1);
    }

    /// T0.3: Removing a node cascades to every incident edge.
    #[test]
    fn remove_node_cascades() {
        let mut g: Graph<(), ()> = Graph::new();
        let a = g.add_node(()).expect("add");
        let b = g.add_node(()).expect("add");
        let e1 = g.add_edge(a, b, ()).expect("edge");
        let e2 = g.add_edge(b, a, ()).expect("edge");

        let mut removed = g.remove_node(a).expect("remove");
        removed.sort();
        let mut expected = vec![e1, e2];
        expected.sort();
        assert_eq!(removed, expected);
        assert_eq!(g.edge_count(), 0);
    }

    /// T0.4: A failing batch rolls back every mutation in it.
    #[test]
    fn batch_rolls_back_as_a_unit() {
        let mut g: Graph<(), ()> = Graph::new();
        g.add_invariant(Invariant::MaxNodes(2)).expect("invariant");
        let result = g.batch(|g| {
            g.add_node(())?;
            g.add_node(())?;
            g.add_node(())?;
            Ok(())
        });
        assert!(matches!(result, Err(EvographError::ViolatedInvariant(_))));
        assert_eq!(g.node_count(), 0);
    }

    /// T0.5: Path enumeration is finite and restartable.
    #[test]
    fn paths_restart() {
        let mut g: Graph<(), ()> = Graph::new();
        let a = g.add_node(()).expect("add");
        let b = g.add_node(()).expect("add");
        let c = g.add_node(()).expect("add");
        g.add_edge(a, b, ()).expect("edge");
        g.add_edge(b, c, ()).expect("edge");
        g.add_edge(a, c, ()).expect("edge");
        g.add_edge(c, a, ()).expect("edge");

        let mut paths = g.find_paths(a, c);
        let first: Vec<Vec<NodeId>> = paths.by_ref().collect();
        assert_eq!(first.len(), 2);
        paths.restart();
        assert_eq!(paths.count(), 2);
    }
}

// =============================================================================
// TIER T1: STATE MACHINE TOTALITY
// =============================================================================

mod t1_state_machine {
    use super::*;

    struct Fixture {
        aggregate: GraphAggregate,
        a: NodeId,
        b: NodeId,
        edge: evograph_core::EdgeId,
    }

    fn run(g: &GraphAggregate, command: GraphCommand) -> GraphAggregate {
        transition(g, &command).expect("setup command").0
    }

    /// An aggregate in `state`, holding nodes a, b and an edge b -> a.
    fn in_state(state: GraphState) -> Fixture {
        let (a, b, edge) = (NodeId::new(), NodeId::new(), evograph_core::EdgeId::new());
        let mut g = GraphAggregate::default();
        if state == GraphState::Empty {
            return Fixture { aggregate: g, a, b, edge };
        }
        g = run(&g, GraphCommand::CreateGraph { name: "g".into(), graph_id: None });
        g = run(&g, add_node(a));
        g = run(&g, add_node(b));
        g = run(
            &g,
            GraphCommand::AddEdge { source: b, target: a, label: String::new(), edge_id: Some(edge) },
        );
        match state {
            GraphState::Frozen => g = run(&g, GraphCommand::Freeze {}),
            GraphState::Archived => g = run(&g, GraphCommand::Archive {}),
            _ => {}
        }
        assert_eq!(g.state(), state);
        Fixture { aggregate: g, a, b, edge }
    }

    fn command(name: &str, f: &Fixture) -> GraphCommand {
        let payload = match name {
            "CreateGraph" | "Rename" => serde_json::json!({ "name": "x" }),
            "AddNode" => serde_json::json!({ "label": "c" }),
            "AddEdge" => serde_json::json!({ "source": f.a, "target": f.b }),
            "RemoveNode" => serde_json::json!({ "node_id": f.b }),
            "RemoveEdge" => serde_json::json!({ "edge_id": f.edge }),
            "MapConcept" => serde_json::json!({ "node_id": f.a, "coordinates": [0.5, 0.5] }),
            _ => serde_json::json!({}),
        };
        GraphCommand::from_parts(name, payload).expect("command")
    }

    /// T1.1: Every (state, command) pair is accepted exactly when the
    /// table declares it, and lands in the declared state.
    #[test]
    fn every_pair_enumerated() {
        let table = GraphAggregate::transitions();
        let mut checked = 0;
        for state in GraphState::ALL {
            let fixture = in_state(state);
            for name in GraphCommand::NAMES {
                let result = transition(&fixture.aggregate, &command(name, &fixture));
                match (table.is_terminal(state), table.target(state, name)) {
                    (true, _) => assert!(
                        matches!(result, Err(EvographError::AggregateTerminal { .. })),
                        "{state} {name}"
                    ),
                    (false, Some(target)) => {
                        let (next, events) = result.expect("declared transition");
                        assert_eq!(next.state(), target, "{state} {name}");
                        assert_eq!(events.len(), 1);
                    }
                    (false, None) => assert!(
                        matches!(result, Err(EvographError::InvalidStateTransition { .. })),
                        "{state} {name}"
                    ),
                }
                checked += 1;
            }
        }
        assert_eq!(checked, GraphState::ALL.len() * GraphCommand::NAMES.len());
    }

    /// T1.2: Every command the table names is a real command.
    #[test]
    fn table_names_are_commands() {
        for name in GraphAggregate::transitions().commands() {
            assert!(GraphCommand::NAMES.contains(&name), "{name}");
        }
    }

    /// T1.3: A rejected command produces no events and changes nothing.
    #[test]
    fn rejection_is_side_effect_free() {
        let repo: Repository<GraphAggregate, _> = Repository::new(Arc::new(InMemoryEventStore::new()));
        let id = AggregateId::new();
        repo.execute(id, &GraphCommand::CreateGraph { name: "g".into(), graph_id: None }, meta())
            .expect("create");
        repo.execute(id, &GraphCommand::Freeze {}, meta()).expect("freeze");

        let err = repo.execute(id, &add_node(NodeId::new()), meta()).expect_err("frozen");
        assert!(matches!(err, EvographError::InvalidStateTransition { .. }));
        assert_eq!(repo.version(id).expect("version"), 2);
    }
}

// =============================================================================
// TIER T2: EVENT LOG GUARANTEES
// =============================================================================

mod t2_event_log {
    use super::*;

    fn at_version_three(store: Arc<dyn EventStore>) -> (Repository<GraphAggregate, Arc<dyn EventStore>>, AggregateId) {
        let repo = Repository::new(store);
        let id = AggregateId::new();
        repo.execute(id, &GraphCommand::CreateGraph { name: "g".into(), graph_id: None }, meta())
            .expect("create");
        repo.execute(id, &add_node(NodeId::new()), meta()).expect("v2");
        repo.execute(id, &add_node(NodeId::new()), meta()).expect("v3");
        (repo, id)
    }

    fn race(store: Arc<dyn EventStore>) {
        let (repo, id) = at_version_three(store);
        let repo = Arc::new(repo);
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let repo = Arc::clone(&repo);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let root = repo.load(id).expect("load");
                    barrier.wait();
                    repo.store().append(
                        id,
                        GraphAggregate::AGGREGATE_TYPE,
                        root.version,
                        vec![NewEvent::from_typed("GraphRenamed", &GraphEvent::GraphRenamed { name: "x".into() })
                            .expect("encode")],
                    )
                })
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();
        let wins = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    Err(EvographError::ConcurrencyConflict { expected: 3, actual: 4, .. })
                )
            })
            .count();
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 1);
        assert_eq!(repo.version(id).expect("version"), 4);
    }

    /// T2.1: Two concurrent appends expecting v3; exactly one wins.
    #[test]
    fn optimistic_concurrency_in_memory() {
        race(Arc::new(InMemoryEventStore::new()));
    }

    /// T2.2: Same race against the durable store.
    #[test]
    fn optimistic_concurrency_redb() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        race(Arc::new(
            RedbEventStore::open(dir.path().join("race.redb")).expect("open"),
        ));
    }

    /// T2.3: 10,000 events with a snapshot at 9,000 load to the same state
    /// as a full replay.
    #[test]
    fn snapshot_equivalence_at_ten_thousand() {
        let store = Arc::new(InMemoryEventStore::new());
        let id = AggregateId::new();
        let mut events = vec![GraphEvent::GraphCreated {
            graph_id: evograph_core::GraphId::new(),
            name: "big".into(),
        }];
        events.extend((1..10_000).map(|i| GraphEvent::NodeAdded {
            node_id: NodeId::new(),
            label: format!("n{i}"),
            properties: BTreeMap::new(),
        }));

        let mut version = 0u64;
        for chunk in events.chunks(1_000) {
            let batch = chunk
                .iter()
                .map(|e| NewEvent::from_typed(evograph_core::aggregate::DomainEvent::event_type(e), e))
                .collect::<Result<Vec<_>, _>>()
                .expect("encode");
            version += store
                .append(id, GraphAggregate::AGGREGATE_TYPE, version, batch)
                .expect("append")
                .len() as u64;
        }
        assert_eq!(version, 10_000);

        let all = store.load(id, 0).expect("load");
        let head = AggregateRoot::<GraphAggregate>::rehydrate(id, None, &all[..9_000]).expect("head");
        store.save_snapshot(head.to_snapshot().expect("snapshot")).expect("save");

        let repo: Repository<GraphAggregate, _> =
            Repository::new(Arc::clone(&store)).with_snapshot_policy(SnapshotPolicy::never());
        let loaded = repo.load(id).expect("load");
        let full = AggregateRoot::<GraphAggregate>::rehydrate(id, None, &all).expect("replay");

        assert_eq!(loaded.version, 10_000);
        assert_eq!(loaded.state.graph().node_count(), 9_999);
        assert_eq!(
            serde_json::to_value(&loaded.state).expect("json"),
            serde_json::to_value(&full.state).expect("json")
        );
    }

    /// T2.4: Any change to a stored event breaks its chain.
    #[test]
    fn tampering_detected() {
        let (repo, id) = at_version_three(Arc::new(InMemoryEventStore::new()));
        let mut events = repo.store().load(id, 0).expect("load");
        assert!(evograph_core::verify_chain(&events).is_valid);

        events[1].payload["label"] = serde_json::json!("forged");
        let report = evograph_core::verify_chain(&events);
        assert!(!report.is_valid);
        assert_eq!(report.first_invalid, Some(2));
    }

    /// T2.5: Load returns strictly increasing versions after the cursor.
    #[test]
    fn load_is_ordered_from_cursor() {
        let (repo, id) = at_version_three(Arc::new(InMemoryEventStore::new()));
        let tail = repo.store().load(id, 1).expect("load");
        let versions: Vec<u64> = tail.iter().map(|e| e.aggregate_version).collect();
        assert_eq!(versions, vec![2, 3]);
    }
}

// =============================================================================
// TIER T3: PROJECTION CONVERGENCE
// =============================================================================

mod t3_projections {
    use super::*;
    use evograph_core::GraphSummaryProjection;

    fn interleaved() -> (Arc<InMemoryEventStore>, Vec<AggregateId>) {
        let store = Arc::new(InMemoryEventStore::new());
        let repo: Repository<GraphAggregate, _> = Repository::new(Arc::clone(&store));
        let ids: Vec<AggregateId> = (0..3).map(|_| AggregateId::new()).collect();
        for id in &ids {
            repo.execute(*id, &GraphCommand::CreateGraph { name: "g".into(), graph_id: None }, meta())
                .expect("create");
        }
        for round in 0..5 {
            for id in &ids {
                repo.execute(*id, &add_node(NodeId::new()), meta()).expect("add");
                if round == 3 {
                    repo.execute(*id, &GraphCommand::Rename { name: format!("r{round}") }, meta())
                        .expect("rename");
                }
            }
        }
        (store, ids)
    }

    /// T3.1: Rebuild from the log equals incremental application.
    #[test]
    fn rebuild_equals_incremental() {
        let (store, ids) = interleaved();
        let mut incremental = ProjectionRunner::new(GraphSummaryProjection::new());
        for batch in [3usize, 7, 100] {
            incremental.catch_up(store.as_ref(), batch).expect("catch up");
        }
        let mut rebuilt = ProjectionRunner::new(GraphSummaryProjection::new());
        rebuilt.rebuild(store.as_ref()).expect("rebuild");

        for id in &ids {
            assert_eq!(incremental.projection().get(*id), rebuilt.projection().get(*id));
            assert_eq!(rebuilt.projection().get(*id).expect("summary").node_count, 5);
        }
    }

    /// T3.2: Shuffled delivery with duplicates converges to the same state.
    #[test]
    fn shuffled_delivery_converges() {
        let (store, ids) = interleaved();
        let feed = store.read_all(0, 1_000).expect("feed");

        let mut ordered = ProjectionRunner::new(GraphSummaryProjection::new());
        ordered.apply_batch(feed.clone()).expect("ordered");

        let mut scrambled: Vec<_> = feed.iter().rev().cloned().collect();
        scrambled.extend(feed.iter().step_by(2).cloned());
        let mut shuffled = ProjectionRunner::new(GraphSummaryProjection::new());
        shuffled.apply_batch(scrambled).expect("shuffled");

        assert_eq!(shuffled.pending(), 0);
        for id in &ids {
            assert_eq!(ordered.projection().get(*id), shuffled.projection().get(*id));
        }
    }

    /// T3.3: A gap wider than the sequencer bound is reported.
    #[test]
    fn oversized_gap_reported() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        let batch = (0..200)
            .map(|_| NewEvent::new("Tick", serde_json::json!({})))
            .collect();
        let events = store.append(id, "clock", 0, batch).expect("append");

        let mut runner = ProjectionRunner::new(GraphSummaryProjection::new());
        let last = events.last().cloned().expect("event");
        assert!(matches!(
            runner.handle(last),
            Err(EvographError::SequenceGap { expected: 1, received: 200, .. })
        ));
    }
}

// =============================================================================
// TIER T4: ROUTING AND COLLABORATION
// =============================================================================

mod t4_routing {
    use super::*;
    use evograph_core::{CollaborationEvent, CollaborationLog, Subject, SubjectPattern, SubjectRouter};

    /// T4.1: Stored events route by aggregate type with wildcards.
    #[test]
    fn events_route_by_subject() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        let events = store
            .append(id, "graph", 0, vec![NewEvent::new("GraphCreated", serde_json::json!({}))])
            .expect("append");

        let mut router = SubjectRouter::new();
        router.register("events.aggregate.graph.*", "graphs").expect("route");
        router.register("events.aggregate.ledger.>", "ledgers").expect("route");
        router.register("events.>", "audit").expect("route");

        let subject = Subject::for_event(&events[0]).expect("subject").to_string();
        let hits: Vec<&str> = router.route(&subject).copied().collect();
        assert_eq!(hits, vec!["graphs", "audit"]);

        let pattern = SubjectPattern::parse("events.*.graph.>").expect("pattern");
        assert!(pattern.matches(&subject));
    }

    /// T4.2: Two replicas exchanging logs converge on the same values.
    #[test]
    fn replicas_converge() {
        let mut left = CollaborationLog::new();
        let mut right = CollaborationLog::new();
        left.insert(
            CollaborationEvent::new("design", "layout", "alice", "color", serde_json::json!("red"))
                .expect("event"),
        )
        .expect("insert");
        right
            .insert(
                CollaborationEvent::new("design", "layout", "bob", "color", serde_json::json!("blue"))
                    .expect("event"),
            )
            .expect("insert");

        let snapshot_left = left.clone();
        left.merge(&right);
        right.merge(&snapshot_left);
        assert_eq!(left, right);
        assert_eq!(left.state("design", "layout"), right.state("design", "layout"));
        assert_eq!(left.conflicts().len(), 1);
    }
}
