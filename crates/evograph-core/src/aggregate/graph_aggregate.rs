//! The built-in graph aggregate.
//!
//! Wraps a `Graph<NodeData, EdgeData>` in a lifecycle:
//!
//! ```text
//! Empty --CreateGraph--> Active <--Freeze/Unfreeze--> Frozen
//!                          |                            |
//!                          +----------Archive-----------+--> Archived (terminal)
//! ```
//!
//! Structure can only change while `Active`. Conceptual coordinates may
//! still be mapped while `Frozen`, since they do not alter the graph.

use super::{Aggregate, Command, DomainEvent, TransitionTable};
use crate::graph::{Graph, Invariant, InvariantKind};
use crate::primitives::{MAX_DIMENSIONS, MAX_LABEL_LENGTH};
use crate::{EdgeId, EvographError, GraphId, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

// =============================================================================
// PAYLOADS
// =============================================================================

/// Node payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    pub label: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
}

/// Edge payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeData {
    pub label: String,
}

/// Position of a node in the conceptual space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptCoordinates {
    pub coordinates: Vec<f32>,
    pub confidence: f32,
}

// =============================================================================
// STATE
// =============================================================================

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum GraphState {
    #[default]
    Empty,
    Active,
    Frozen,
    Archived,
}

impl GraphState {
    pub const ALL: [Self; 4] = [Self::Empty, Self::Active, Self::Frozen, Self::Archived];
}

impl fmt::Display for GraphState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

/// Commands accepted by a graph aggregate.
///
/// Wire form: `{"type": "<Name>", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum GraphCommand {
    CreateGraph {
        name: String,
        #[serde(default)]
        graph_id: Option<GraphId>,
    },
    AddNode {
        label: String,
        #[serde(default)]
        node_id: Option<NodeId>,
        #[serde(default)]
        properties: BTreeMap<String, serde_json::Value>,
    },
    AddEdge {
        source: NodeId,
        target: NodeId,
        #[serde(default)]
        label: String,
        #[serde(default)]
        edge_id: Option<EdgeId>,
    },
    RemoveNode {
        node_id: NodeId,
    },
    RemoveEdge {
        edge_id: EdgeId,
    },
    RequireAcyclic {},
    MapConcept {
        node_id: NodeId,
        coordinates: Vec<f32>,
        #[serde(default = "full_confidence")]
        confidence: f32,
    },
    Rename {
        name: String,
    },
    Freeze {},
    Unfreeze {},
    Archive {},
}

fn full_confidence() -> f32 {
    1.0
}

impl GraphCommand {
    /// Every command name, in declaration order.
    pub const NAMES: [&'static str; 11] = [
        "CreateGraph",
        "AddNode",
        "AddEdge",
        "RemoveNode",
        "RemoveEdge",
        "RequireAcyclic",
        "MapConcept",
        "Rename",
        "Freeze",
        "Unfreeze",
        "Archive",
    ];

    /// Parse the `type` and `payload` of a command envelope.
    pub fn from_parts(command_type: &str, payload: serde_json::Value) -> Result<Self, EvographError> {
        let payload = if payload.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            payload
        };
        serde_json::from_value(serde_json::json!({ "type": command_type, "payload": payload }))
            .map_err(|e| EvographError::Validation(format!("invalid command '{}': {}", command_type, e)))
    }
}

impl Command for GraphCommand {
    fn name(&self) -> &'static str {
        match self {
            Self::CreateGraph { .. } => "CreateGraph",
            Self::AddNode { .. } => "AddNode",
            Self::AddEdge { .. } => "AddEdge",
            Self::RemoveNode { .. } => "RemoveNode",
            Self::RemoveEdge { .. } => "RemoveEdge",
            Self::RequireAcyclic {} => "RequireAcyclic",
            Self::MapConcept { .. } => "MapConcept",
            Self::Rename { .. } => "Rename",
            Self::Freeze {} => "Freeze",
            Self::Unfreeze {} => "Unfreeze",
            Self::Archive {} => "Archive",
        }
    }
}

// =============================================================================
// EVENTS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GraphEvent {
    GraphCreated {
        graph_id: GraphId,
        name: String,
    },
    NodeAdded {
        node_id: NodeId,
        label: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        properties: BTreeMap<String, serde_json::Value>,
    },
    EdgeAdded {
        edge_id: EdgeId,
        source: NodeId,
        target: NodeId,
        label: String,
    },
    NodeRemoved {
        node_id: NodeId,
        removed_edges: Vec<EdgeId>,
    },
    EdgeRemoved {
        edge_id: EdgeId,
    },
    AcyclicRequired,
    ConceptMapped {
        node_id: NodeId,
        coordinates: Vec<f32>,
        confidence: f32,
    },
    GraphRenamed {
        name: String,
    },
    GraphFrozen,
    GraphUnfrozen,
    GraphArchived,
}

impl DomainEvent for GraphEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::GraphCreated { .. } => "GraphCreated",
            Self::NodeAdded { .. } => "NodeAdded",
            Self::EdgeAdded { .. } => "EdgeAdded",
            Self::NodeRemoved { .. } => "NodeRemoved",
            Self::EdgeRemoved { .. } => "EdgeRemoved",
            Self::AcyclicRequired => "AcyclicRequired",
            Self::ConceptMapped { .. } => "ConceptMapped",
            Self::GraphRenamed { .. } => "GraphRenamed",
            Self::GraphFrozen => "GraphFrozen",
            Self::GraphUnfrozen => "GraphUnfrozen",
            Self::GraphArchived => "GraphArchived",
        }
    }
}

// =============================================================================
// TRANSITION TABLE
// =============================================================================

static TRANSITIONS: LazyLock<TransitionTable<GraphState>> = LazyLock::new(|| {
    use GraphState::{Active, Archived, Empty, Frozen};
    TransitionTable::new()
        .allow(Empty, "CreateGraph", Active)
        .allow(Active, "AddNode", Active)
        .allow(Active, "AddEdge", Active)
        .allow(Active, "RemoveNode", Active)
        .allow(Active, "RemoveEdge", Active)
        .allow(Active, "RequireAcyclic", Active)
        .allow(Active, "MapConcept", Active)
        .allow(Frozen, "MapConcept", Frozen)
        .allow(Active, "Rename", Active)
        .allow(Active, "Freeze", Frozen)
        .allow(Frozen, "Unfreeze", Active)
        .allow(Active, "Archive", Archived)
        .allow(Frozen, "Archive", Archived)
        .terminal(Archived)
});

// =============================================================================
// AGGREGATE
// =============================================================================

/// A named, lifecycle-governed graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphAggregate {
    status: GraphState,
    name: String,
    graph: Graph<NodeData, EdgeData>,
    #[serde(default)]
    concepts: BTreeMap<NodeId, ConceptCoordinates>,
}

impl GraphAggregate {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn graph(&self) -> &Graph<NodeData, EdgeData> {
        &self.graph
    }

    #[must_use]
    pub fn concept(&self, node: NodeId) -> Option<&ConceptCoordinates> {
        self.concepts.get(&node)
    }

    /// All mapped nodes with their coordinates, in node id order.
    pub fn concepts(&self) -> impl Iterator<Item = (NodeId, &ConceptCoordinates)> {
        self.concepts.iter().map(|(id, c)| (*id, c))
    }

    /// Run a structural change on a scratch copy when the graph carries
    /// invariants, so that violations are reported before any event exists.
    fn trial(
        &self,
        f: impl FnOnce(&mut Graph<NodeData, EdgeData>) -> Result<(), EvographError>,
    ) -> Result<(), EvographError> {
        if self.graph.invariant_names().is_empty() {
            return Ok(());
        }
        let mut scratch = self.graph.clone();
        f(&mut scratch)
    }

    fn require_node(&self, id: NodeId) -> Result<(), EvographError> {
        if self.graph.contains_node(id) {
            Ok(())
        } else {
            Err(EvographError::NodeNotFound(id))
        }
    }
}

fn validate_label(what: &str, value: &str, allow_empty: bool) -> Result<(), EvographError> {
    if (!allow_empty && value.trim().is_empty()) || value.len() > MAX_LABEL_LENGTH {
        return Err(EvographError::Validation(format!(
            "{} must be non-empty and at most {} bytes",
            what, MAX_LABEL_LENGTH
        )));
    }
    Ok(())
}

fn validate_coordinates(coordinates: &[f32], confidence: f32) -> Result<(), EvographError> {
    if coordinates.is_empty() || coordinates.len() > MAX_DIMENSIONS {
        return Err(EvographError::Validation(format!(
            "coordinates must have 1..={} dimensions",
            MAX_DIMENSIONS
        )));
    }
    if coordinates.iter().any(|c| !c.is_finite()) {
        return Err(EvographError::Validation(
            "coordinates must be finite".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&confidence) {
        return Err(EvographError::Validation(format!(
            "confidence {} outside [0, 1]",
            confidence
        )));
    }
    Ok(())
}

impl Aggregate for GraphAggregate {
    const AGGREGATE_TYPE: &'static str = "graph";

    type State = GraphState;
    type Command = GraphCommand;
    type Event = GraphEvent;

    fn state(&self) -> GraphState {
        self.status
    }

    fn decide(&self, command: &GraphCommand) -> Result<GraphEvent, EvographError> {
        match command {
            GraphCommand::CreateGraph { name, graph_id } => {
                validate_label("graph name", name, false)?;
                Ok(GraphEvent::GraphCreated {
                    graph_id: graph_id.unwrap_or_default(),
                    name: name.clone(),
                })
            }
            GraphCommand::AddNode {
                label,
                node_id,
                properties,
            } => {
                validate_label("node label", label, false)?;
                let node_id = node_id.unwrap_or_default();
                if self.graph.contains_node(node_id) {
                    return Err(EvographError::Validation(format!(
                        "node {} already exists",
                        node_id
                    )));
                }
                let value = NodeData {
                    label: label.clone(),
                    properties: properties.clone(),
                };
                self.trial(|g| g.insert_node(node_id, value).map(|_| ()))?;
                Ok(GraphEvent::NodeAdded {
                    node_id,
                    label: label.clone(),
                    properties: properties.clone(),
                })
            }
            GraphCommand::AddEdge {
                source,
                target,
                label,
                edge_id,
            } => {
                validate_label("edge label", label, true)?;
                self.require_node(*source)?;
                self.require_node(*target)?;
                let edge_id = edge_id.unwrap_or_default();
                if self.graph.contains_edge(edge_id) {
                    return Err(EvographError::Validation(format!(
                        "edge {} already exists",
                        edge_id
                    )));
                }
                let value = EdgeData {
                    label: label.clone(),
                };
                self.trial(|g| g.insert_edge(edge_id, *source, *target, value).map(|_| ()))?;
                Ok(GraphEvent::EdgeAdded {
                    edge_id,
                    source: *source,
                    target: *target,
                    label: label.clone(),
                })
            }
            GraphCommand::RemoveNode { node_id } => {
                self.require_node(*node_id)?;
                let incident: BTreeSet<EdgeId> = self
                    .graph
                    .outgoing_edges(*node_id)
                    .chain(self.graph.incoming_edges(*node_id))
                    .collect();
                self.trial(|g| g.remove_node(*node_id).map(|_| ()))?;
                Ok(GraphEvent::NodeRemoved {
                    node_id: *node_id,
                    removed_edges: incident.into_iter().collect(),
                })
            }
            GraphCommand::RemoveEdge { edge_id } => {
                if !self.graph.contains_edge(*edge_id) {
                    return Err(EvographError::EdgeNotFound(*edge_id));
                }
                self.trial(|g| g.remove_edge(*edge_id).map(|_| ()))?;
                Ok(GraphEvent::EdgeRemoved { edge_id: *edge_id })
            }
            GraphCommand::RequireAcyclic {} => {
                if self.graph.has_invariant(InvariantKind::Acyclic) {
                    return Err(EvographError::Validation(
                        "graph is already required to be acyclic".to_string(),
                    ));
                }
                let acyclic = Invariant::<NodeData, EdgeData>::Acyclic;
                if !acyclic.holds(&self.graph) {
                    return Err(EvographError::ViolatedInvariant(vec![acyclic.name()]));
                }
                Ok(GraphEvent::AcyclicRequired)
            }
            GraphCommand::MapConcept {
                node_id,
                coordinates,
                confidence,
            } => {
                self.require_node(*node_id)?;
                validate_coordinates(coordinates, *confidence)?;
                Ok(GraphEvent::ConceptMapped {
                    node_id: *node_id,
                    coordinates: coordinates.clone(),
                    confidence: *confidence,
                })
            }
            GraphCommand::Rename { name } => {
                validate_label("graph name", name, false)?;
                if *name == self.name {
                    return Err(EvographError::Validation(format!(
                        "graph is already named '{}'",
                        name
                    )));
                }
                Ok(GraphEvent::GraphRenamed { name: name.clone() })
            }
            GraphCommand::Freeze {} => Ok(GraphEvent::GraphFrozen),
            GraphCommand::Unfreeze {} => Ok(GraphEvent::GraphUnfrozen),
            GraphCommand::Archive {} => Ok(GraphEvent::GraphArchived),
        }
    }

    fn apply(&mut self, event: &GraphEvent) {
        let result = match event {
            GraphEvent::GraphCreated { graph_id, name } => {
                self.status = GraphState::Active;
                self.name = name.clone();
                self.graph = Graph::with_id(*graph_id);
                Ok(())
            }
            GraphEvent::NodeAdded {
                node_id,
                label,
                properties,
            } => self
                .graph
                .insert_node(
                    *node_id,
                    NodeData {
                        label: label.clone(),
                        properties: properties.clone(),
                    },
                )
                .map(|_| ()),
            GraphEvent::EdgeAdded {
                edge_id,
                source,
                target,
                label,
            } => self
                .graph
                .insert_edge(
                    *edge_id,
                    *source,
                    *target,
                    EdgeData {
                        label: label.clone(),
                    },
                )
                .map(|_| ()),
            GraphEvent::NodeRemoved { node_id, .. } => {
                self.concepts.remove(node_id);
                self.graph.remove_node(*node_id).map(|_| ())
            }
            GraphEvent::EdgeRemoved { edge_id } => self.graph.remove_edge(*edge_id).map(|_| ()),
            GraphEvent::AcyclicRequired => self.graph.add_invariant(Invariant::Acyclic),
            GraphEvent::ConceptMapped {
                node_id,
                coordinates,
                confidence,
            } => {
                self.concepts.insert(
                    *node_id,
                    ConceptCoordinates {
                        coordinates: coordinates.clone(),
                        confidence: *confidence,
                    },
                );
                Ok(())
            }
            GraphEvent::GraphRenamed { name } => {
                self.name = name.clone();
                Ok(())
            }
            GraphEvent::GraphFrozen => {
                self.status = GraphState::Frozen;
                Ok(())
            }
            GraphEvent::GraphUnfrozen => {
                self.status = GraphState::Active;
                Ok(())
            }
            GraphEvent::GraphArchived => {
                self.status = GraphState::Archived;
                Ok(())
            }
        };

        // Stored events were validated by `decide`; a failure here means the
        // log was written by something else.
        if let Err(e) = result {
            tracing::warn!(
                event_type = event.event_type(),
                error = %e,
                "graph event could not be applied"
            );
        }
    }

    fn transitions() -> &'static TransitionTable<GraphState> {
        &TRANSITIONS
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::super::transition;
    use super::*;
    use serde_json::json;

    fn run(agg: &GraphAggregate, cmd: GraphCommand) -> Result<GraphAggregate, EvographError> {
        transition(agg, &cmd).map(|(next, _)| next)
    }

    fn active() -> GraphAggregate {
        run(
            &GraphAggregate::default(),
            GraphCommand::CreateGraph {
                name: "g".into(),
                graph_id: None,
            },
        )
        .expect("create")
    }

    fn add_node(agg: &GraphAggregate, id: NodeId) -> GraphAggregate {
        run(
            agg,
            GraphCommand::AddNode {
                label: "n".into(),
                node_id: Some(id),
                properties: BTreeMap::new(),
            },
        )
        .expect("add node")
    }

    fn edge(source: NodeId, target: NodeId) -> GraphCommand {
        GraphCommand::AddEdge {
            source,
            target,
            label: String::new(),
            edge_id: None,
        }
    }

    #[test]
    fn lifecycle_through_archive() {
        let g = active();
        assert_eq!(g.state(), GraphState::Active);
        let g = run(&g, GraphCommand::Freeze {}).expect("freeze");
        assert_eq!(g.state(), GraphState::Frozen);
        let g = run(&g, GraphCommand::Archive {}).expect("archive");
        assert_eq!(g.state(), GraphState::Archived);

        let err = run(&g, GraphCommand::Unfreeze {}).expect_err("archived is terminal");
        assert!(matches!(err, EvographError::AggregateTerminal { .. }));
    }

    #[test]
    fn frozen_graph_rejects_structure_but_accepts_concepts() {
        let a = NodeId::new();
        let g = add_node(&active(), a);
        let g = run(&g, GraphCommand::Freeze {}).expect("freeze");

        let err = run(
            &g,
            GraphCommand::AddNode {
                label: "late".into(),
                node_id: None,
                properties: BTreeMap::new(),
            },
        )
        .expect_err("frozen");
        assert!(matches!(err, EvographError::InvalidStateTransition { .. }));

        let g = run(
            &g,
            GraphCommand::MapConcept {
                node_id: a,
                coordinates: vec![0.5, 0.5],
                confidence: 0.9,
            },
        )
        .expect("map concept");
        assert_eq!(g.state(), GraphState::Frozen);
        assert!(g.concept(a).is_some());
    }

    #[test]
    fn cycle_rejected_when_acyclic_required() {
        let (a, b) = (NodeId::new(), NodeId::new());
        let g = add_node(&add_node(&active(), a), b);
        let g = run(&g, GraphCommand::RequireAcyclic {}).expect("require");
        let g = run(&g, edge(a, b)).expect("a -> b");

        let err = run(&g, edge(b, a)).expect_err("cycle");
        assert_eq!(err, EvographError::ViolatedInvariant(vec!["acyclic".into()]));
        assert_eq!(g.graph().edge_count(), 1);
    }

    #[test]
    fn parallel_edges_satisfy_acyclic() {
        let (a, b) = (NodeId::new(), NodeId::new());
        let g = add_node(&add_node(&active(), a), b);
        let g = run(&g, edge(a, b)).expect("edge");
        let g = run(&g, edge(a, b)).expect("parallel edge");
        let g = run(&g, GraphCommand::RequireAcyclic {}).expect("still a DAG");
        let g = run(&g, edge(a, b)).expect("third parallel edge");
        assert_eq!(g.graph().edge_count(), 3);
    }

    #[test]
    fn require_acyclic_on_cyclic_graph_fails() {
        let (a, b) = (NodeId::new(), NodeId::new());
        let g = add_node(&add_node(&active(), a), b);
        let g = run(&g, edge(a, b)).expect("edge");
        let g = run(&g, edge(b, a)).expect("edge");
        let err = run(&g, GraphCommand::RequireAcyclic {}).expect_err("already cyclic");
        assert!(matches!(err, EvographError::ViolatedInvariant(_)));
    }

    #[test]
    fn remove_node_reports_cascaded_edges() {
        let (a, b, c) = (NodeId::new(), NodeId::new(), NodeId::new());
        let g = add_node(&add_node(&add_node(&active(), a), b), c);
        let g = run(&g, edge(a, b)).expect("edge");
        let g = run(&g, edge(c, a)).expect("edge");

        let (next, events) =
            transition(&g, &GraphCommand::RemoveNode { node_id: a }).expect("remove");
        assert!(matches!(
            &events[0],
            GraphEvent::NodeRemoved { removed_edges, .. } if removed_edges.len() == 2
        ));
        assert_eq!(next.graph().edge_count(), 0);
        assert_eq!(next.graph().node_count(), 2);
    }

    #[test]
    fn removing_node_drops_its_concept() {
        let a = NodeId::new();
        let g = add_node(&active(), a);
        let g = run(
            &g,
            GraphCommand::MapConcept {
                node_id: a,
                coordinates: vec![1.0],
                confidence: 1.0,
            },
        )
        .expect("map");
        let g = run(&g, GraphCommand::RemoveNode { node_id: a }).expect("remove");
        assert!(g.concept(a).is_none());
    }

    #[test]
    fn invalid_inputs_rejected() {
        let g = active();
        let missing = NodeId::new();
        assert_eq!(
            run(&g, edge(missing, missing)).expect_err("missing"),
            EvographError::NodeNotFound(missing)
        );

        let a = NodeId::new();
        let g = add_node(&g, a);
        for (coordinates, confidence) in [(vec![], 1.0), (vec![f32::NAN], 1.0), (vec![1.0], 1.5)] {
            let err = run(
                &g,
                GraphCommand::MapConcept {
                    node_id: a,
                    coordinates,
                    confidence,
                },
            )
            .expect_err("invalid concept");
            assert!(matches!(err, EvographError::Validation(_)));
        }

        let err = run(&g, GraphCommand::Rename { name: "g".into() }).expect_err("same name");
        assert!(matches!(err, EvographError::Validation(_)));
    }

    #[test]
    fn command_wire_format() {
        let cmd = GraphCommand::from_parts("AddNode", json!({ "label": "x" })).expect("parse");
        assert!(matches!(cmd, GraphCommand::AddNode { ref label, .. } if label == "x"));

        let cmd = GraphCommand::from_parts("Freeze", json!(null)).expect("unit payload");
        assert_eq!(cmd, GraphCommand::Freeze {});

        let err = GraphCommand::from_parts("Explode", json!({})).expect_err("unknown");
        assert!(matches!(err, EvographError::Validation(_)));
    }

    #[test]
    fn names_cover_every_variant() {
        let table_commands = GraphAggregate::transitions().commands();
        for name in GraphCommand::NAMES {
            assert!(table_commands.contains(name), "{} missing from table", name);
        }
        assert_eq!(table_commands.len(), GraphCommand::NAMES.len());
    }

    #[test]
    fn snapshot_roundtrip_keeps_invariants() {
        let (a, b) = (NodeId::new(), NodeId::new());
        let g = add_node(&add_node(&active(), a), b);
        let g = run(&g, GraphCommand::RequireAcyclic {}).expect("require");
        let g = run(&g, edge(a, b)).expect("edge");

        let json = serde_json::to_value(&g).expect("serialize");
        let restored: GraphAggregate = serde_json::from_value(json).expect("deserialize");
        assert_eq!(restored.graph().node_count(), 2);
        let err = run(&restored, edge(b, a)).expect_err("cycle");
        assert!(matches!(err, EvographError::ViolatedInvariant(_)));
    }
}
