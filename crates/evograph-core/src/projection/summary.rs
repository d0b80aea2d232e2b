//! Per-graph summary read model.

use super::Projection;
use crate::aggregate::{Aggregate, GraphAggregate, GraphEvent, GraphState};
use crate::event::EventEnvelope;
use crate::{AggregateId, EvographError, GraphId, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Counts and lifecycle of one graph aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSummary {
    pub aggregate_id: AggregateId,
    pub graph_id: Option<GraphId>,
    pub name: String,
    pub status: GraphState,
    pub node_count: usize,
    pub edge_count: usize,
    pub concept_count: usize,
    pub acyclic: bool,
    pub last_version: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    mapped: BTreeSet<NodeId>,
}

impl GraphSummary {
    fn new(aggregate_id: AggregateId, updated_at: DateTime<Utc>) -> Self {
        Self {
            aggregate_id,
            graph_id: None,
            name: String::new(),
            status: GraphState::Empty,
            node_count: 0,
            edge_count: 0,
            concept_count: 0,
            acyclic: false,
            last_version: 0,
            updated_at,
            mapped: BTreeSet::new(),
        }
    }

    fn fold(&mut self, event: &GraphEvent) {
        match event {
            GraphEvent::GraphCreated { graph_id, name } => {
                self.graph_id = Some(*graph_id);
                self.name.clone_from(name);
                self.status = GraphState::Active;
            }
            GraphEvent::NodeAdded { .. } => self.node_count += 1,
            GraphEvent::EdgeAdded { .. } => self.edge_count += 1,
            GraphEvent::NodeRemoved {
                node_id,
                removed_edges,
            } => {
                self.node_count = self.node_count.saturating_sub(1);
                self.edge_count = self.edge_count.saturating_sub(removed_edges.len());
                self.mapped.remove(node_id);
            }
            GraphEvent::EdgeRemoved { .. } => {
                self.edge_count = self.edge_count.saturating_sub(1);
            }
            GraphEvent::AcyclicRequired => self.acyclic = true,
            GraphEvent::ConceptMapped { node_id, .. } => {
                self.mapped.insert(*node_id);
            }
            GraphEvent::GraphRenamed { name } => self.name.clone_from(name),
            GraphEvent::GraphFrozen => self.status = GraphState::Frozen,
            GraphEvent::GraphUnfrozen => self.status = GraphState::Active,
            GraphEvent::GraphArchived => self.status = GraphState::Archived,
        }
        self.concept_count = self.mapped.len();
    }
}

/// Summaries of every graph aggregate in the log.
#[derive(Debug, Default)]
pub struct GraphSummaryProjection {
    graphs: BTreeMap<AggregateId, GraphSummary>,
}

impl GraphSummaryProjection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, aggregate_id: AggregateId) -> Option<&GraphSummary> {
        self.graphs.get(&aggregate_id)
    }

    /// All summaries in aggregate id order.
    pub fn all(&self) -> impl Iterator<Item = &GraphSummary> {
        self.graphs.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }
}

impl Projection for GraphSummaryProjection {
    fn name(&self) -> &str {
        "graph_summary"
    }

    fn apply(&mut self, event: &EventEnvelope) -> Result<(), EvographError> {
        if event.aggregate_type != GraphAggregate::AGGREGATE_TYPE {
            return Ok(());
        }
        let decoded: GraphEvent = event.decode()?;
        let summary = self
            .graphs
            .entry(event.aggregate_id)
            .or_insert_with(|| GraphSummary::new(event.aggregate_id, event.timestamp));
        summary.fold(&decoded);
        summary.last_version = event.aggregate_version;
        summary.updated_at = event.timestamp;
        Ok(())
    }

    fn reset(&mut self) {
        self.graphs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{GraphCommand, Repository};
    use crate::event::EventMetadata;
    use crate::projection::ProjectionRunner;
    use crate::storage::InMemoryEventStore;
    use crate::storage::EventStore;
    use std::sync::Arc;

    #[test]
    fn summary_follows_graph_lifecycle() {
        let store = Arc::new(InMemoryEventStore::new());
        let repo: Repository<GraphAggregate, _> = Repository::new(Arc::clone(&store));
        let id = AggregateId::new();
        let meta = EventMetadata::default;

        repo.execute(id, &GraphCommand::CreateGraph { name: "g".into(), graph_id: None }, meta())
            .expect("create");
        let mut nodes = Vec::new();
        for label in ["a", "b", "c"] {
            let committed = repo
                .execute(
                    id,
                    &GraphCommand::AddNode {
                        label: label.into(),
                        node_id: None,
                        properties: BTreeMap::new(),
                    },
                    meta(),
                )
                .expect("add node");
            nodes.extend(committed.root.state.graph().nodes().map(|n| n.id));
        }
        nodes.sort();
        nodes.dedup();
        repo.execute(
            id,
            &GraphCommand::AddEdge { source: nodes[0], target: nodes[1], label: String::new(), edge_id: None },
            meta(),
        )
        .expect("edge");
        repo.execute(
            id,
            &GraphCommand::MapConcept { node_id: nodes[0], coordinates: vec![1.0, 2.0], confidence: 1.0 },
            meta(),
        )
        .expect("map");
        repo.execute(id, &GraphCommand::RemoveNode { node_id: nodes[0] }, meta())
            .expect("remove");
        repo.execute(id, &GraphCommand::Freeze {}, meta()).expect("freeze");

        let mut runner = ProjectionRunner::new(GraphSummaryProjection::new());
        runner.catch_up(&store, 100).expect("catch up");
        let summary = runner.projection().get(id).expect("summary");

        assert_eq!(summary.name, "g");
        assert_eq!(summary.status, GraphState::Frozen);
        assert_eq!(summary.node_count, 2);
        assert_eq!(summary.edge_count, 0);
        assert_eq!(summary.concept_count, 0);
        assert_eq!(summary.last_version, 8);
    }

    #[test]
    fn other_aggregate_types_ignored() {
        let store = InMemoryEventStore::new();
        store
            .append(
                AggregateId::new(),
                "ledger",
                0,
                vec![crate::event::NewEvent::new("Opened", serde_json::json!({}))],
            )
            .expect("append");
        let mut runner = ProjectionRunner::new(GraphSummaryProjection::new());
        runner.catch_up(&store, 10).expect("catch up");
        assert!(runner.projection().is_empty());
    }
}
