//! # Graph Substrate
//!
//! A generic, recursively composable graph.
//!
//! Nodes and edges live in flat arenas keyed by opaque ids. Payload types
//! `N` and `E` are fixed per instantiation; everything else about an
//! element is carried in its `ComponentBag`. Nesting happens only through
//! the [`Subgraph`] component, which owns its inner graph, so the
//! structure never contains reference cycles.
//!
//! Structural mutations are checked against the graph's invariants. A
//! violating mutation is rolled back before the error is returned, so no
//! partial state is ever observable.

mod component;
mod invariant;
mod paths;

pub use component::{ComponentBag, NestedGraph, Subgraph};
pub use invariant::{Invariant, InvariantFn, InvariantKind};
pub use paths::Paths;

use crate::primitives::MAX_SUBGRAPH_DEPTH;
use crate::{EdgeId, ElementId, EvographError, GraphId, NodeId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// =============================================================================
// ENTRIES
// =============================================================================

/// A node: identity, payload and attached components.
#[derive(Debug, Clone)]
pub struct NodeEntry<N> {
    pub id: NodeId,
    pub value: N,
    pub components: ComponentBag,
}

/// A directed edge. Identity is the id; position and layout never are.
#[derive(Debug, Clone)]
pub struct EdgeEntry<E> {
    pub id: EdgeId,
    pub source: NodeId,
    pub target: NodeId,
    pub value: E,
    pub components: ComponentBag,
}

// =============================================================================
// GRAPH
// =============================================================================

/// The graph container.
///
/// Uses `BTreeMap` throughout so that iteration order depends only on ids.
#[derive(Clone)]
pub struct Graph<N, E> {
    id: GraphId,
    /// Ancestors of this graph when it is (or was) nested, outermost first.
    lineage: Vec<GraphId>,
    nodes: BTreeMap<NodeId, NodeEntry<N>>,
    edges: BTreeMap<EdgeId, EdgeEntry<E>>,
    outgoing: BTreeMap<NodeId, BTreeSet<EdgeId>>,
    incoming: BTreeMap<NodeId, BTreeSet<EdgeId>>,
    invariants: Vec<Invariant<N, E>>,
    /// Set while a batch is running; invariant checks wait for the end.
    deferred: bool,
}

impl<N, E> Default for Graph<N, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N, E> fmt::Debug for Graph<N, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("node_count", &self.nodes.len())
            .field("edge_count", &self.edges.len())
            .field("invariants", &self.invariants)
            .finish_non_exhaustive()
    }
}

impl<N, E> Graph<N, E> {
    /// Create a new empty graph with a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(GraphId::new())
    }

    /// Create a new empty graph with the given id.
    #[must_use]
    pub fn with_id(id: GraphId) -> Self {
        Self {
            id,
            lineage: Vec::new(),
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
            outgoing: BTreeMap::new(),
            incoming: BTreeMap::new(),
            invariants: Vec::new(),
            deferred: false,
        }
    }

    /// Identity of this graph.
    #[must_use]
    pub fn id(&self) -> GraphId {
        self.id
    }

    /// Ancestors of this graph, outermost first. Empty for a root graph.
    #[must_use]
    pub fn lineage(&self) -> &[GraphId] {
        &self.lineage
    }

    pub(crate) fn set_lineage(&mut self, lineage: Vec<GraphId>) {
        self.lineage = lineage;
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Number of nodes directly in this graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of edges directly in this graph.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Whether the node exists.
    #[must_use]
    pub fn contains_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Whether the edge exists.
    #[must_use]
    pub fn contains_edge(&self, id: EdgeId) -> bool {
        self.edges.contains_key(&id)
    }

    /// Look up a node.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&NodeEntry<N>> {
        self.nodes.get(&id)
    }

    /// Look up an edge.
    #[must_use]
    pub fn edge(&self, id: EdgeId) -> Option<&EdgeEntry<E>> {
        self.edges.get(&id)
    }

    /// All nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeEntry<N>> {
        self.nodes.values()
    }

    /// All edges in id order.
    pub fn edges(&self) -> impl Iterator<Item = &EdgeEntry<E>> {
        self.edges.values()
    }

    /// Ids of edges leaving `node`.
    pub fn outgoing_edges(&self, node: NodeId) -> impl Iterator<Item = EdgeId> + '_ {
        self.outgoing.get(&node).into_iter().flatten().copied()
    }

    /// Ids of edges entering `node`.
    pub fn incoming_edges(&self, node: NodeId) -> impl Iterator<Item = EdgeId> + '_ {
        self.incoming.get(&node).into_iter().flatten().copied()
    }

    /// Distinct successors of `node`, in id order.
    #[must_use]
    pub fn outgoing_targets(&self, node: NodeId) -> Vec<NodeId> {
        let targets: BTreeSet<NodeId> = self
            .outgoing_edges(node)
            .filter_map(|e| self.edges.get(&e).map(|entry| entry.target))
            .collect();
        targets.into_iter().collect()
    }

    /// Distinct predecessors of `node`, in id order.
    #[must_use]
    pub fn incoming_sources(&self, node: NodeId) -> Vec<NodeId> {
        let sources: BTreeSet<NodeId> = self
            .incoming_edges(node)
            .filter_map(|e| self.edges.get(&e).map(|entry| entry.source))
            .collect();
        sources.into_iter().collect()
    }

    /// Ids of nodes carrying a component of type `C`, in id order.
    #[must_use]
    pub fn nodes_with_component<C: Any + Send + Sync>(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.components.contains::<C>())
            .map(|n| n.id)
            .collect()
    }

    /// Borrow a component of an element.
    #[must_use]
    pub fn component<C: Any + Send + Sync>(&self, element: impl Into<ElementId>) -> Option<&C> {
        self.components(element.into())?.get::<C>()
    }

    /// Lazy enumeration of simple paths from `source` to `target`.
    pub fn find_paths(&self, source: NodeId, target: NodeId) -> Paths<'_, N, E> {
        Paths::new(self, source, target)
    }

    /// Shortest path by edge count, if any.
    #[must_use]
    pub fn shortest_path(&self, source: NodeId, target: NodeId) -> Option<Vec<NodeId>> {
        paths::shortest_path(self, source, target)
    }

    /// Nested graphs attached directly to this graph's nodes.
    pub fn subgraphs(&self) -> impl Iterator<Item = &Subgraph> {
        self.nodes.values().filter_map(|n| n.components.get::<Subgraph>())
    }

    /// Node count including every nested graph, recursively.
    #[must_use]
    pub fn total_node_count(&self) -> usize {
        self.nodes.len()
            + self
                .subgraphs()
                .map(Subgraph::total_node_count)
                .sum::<usize>()
    }

    /// Names of the attached invariants.
    #[must_use]
    pub fn invariant_names(&self) -> Vec<String> {
        self.invariants.iter().map(Invariant::name).collect()
    }

    /// Evaluate all invariants.
    pub fn check_invariants(&self) -> Result<(), EvographError> {
        let violated: Vec<String> = self
            .invariants
            .iter()
            .filter(|inv| !inv.holds(self))
            .map(Invariant::name)
            .collect();
        if violated.is_empty() {
            Ok(())
        } else {
            Err(EvographError::ViolatedInvariant(violated))
        }
    }

    fn components(&self, element: ElementId) -> Option<&ComponentBag> {
        match element {
            ElementId::Node(id) => self.nodes.get(&id).map(|n| &n.components),
            ElementId::Edge(id) => self.edges.get(&id).map(|e| &e.components),
        }
    }

    fn components_mut(&mut self, element: ElementId) -> Result<&mut ComponentBag, EvographError> {
        match element {
            ElementId::Node(id) => self
                .nodes
                .get_mut(&id)
                .map(|n| &mut n.components)
                .ok_or(EvographError::NodeNotFound(id)),
            ElementId::Edge(id) => self
                .edges
                .get_mut(&id)
                .map(|e| &mut e.components)
                .ok_or(EvographError::EdgeNotFound(id)),
        }
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Add a node with a fresh id.
    pub fn add_node(&mut self, value: N) -> Result<NodeId, EvographError> {
        self.insert_node(NodeId::new(), value)
    }

    /// Add a node with a caller-chosen id (used when replaying events).
    pub fn insert_node(&mut self, id: NodeId, value: N) -> Result<NodeId, EvographError> {
        if self.nodes.contains_key(&id) {
            return Err(EvographError::Validation(format!(
                "node {} already exists",
                id
            )));
        }
        self.nodes.insert(
            id,
            NodeEntry {
                id,
                value,
                components: ComponentBag::new(),
            },
        );

        if let Err(e) = self.enforce() {
            self.nodes.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Add a directed edge with a fresh id.
    pub fn add_edge(
        &mut self,
        source: NodeId,
        target: NodeId,
        value: E,
    ) -> Result<EdgeId, EvographError> {
        self.insert_edge(EdgeId::new(), source, target, value)
    }

    /// Add a directed edge with a caller-chosen id (used when replaying events).
    pub fn insert_edge(
        &mut self,
        id: EdgeId,
        source: NodeId,
        target: NodeId,
        value: E,
    ) -> Result<EdgeId, EvographError> {
        for endpoint in [source, target] {
            if !self.nodes.contains_key(&endpoint) {
                return Err(EvographError::NodeNotFound(endpoint));
            }
        }
        if self.edges.contains_key(&id) {
            return Err(EvographError::Validation(format!(
                "edge {} already exists",
                id
            )));
        }

        self.link(EdgeEntry {
            id,
            source,
            target,
            value,
            components: ComponentBag::new(),
        });

        if let Err(e) = self.enforce() {
            self.unlink(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Remove an edge and return its payload.
    pub fn remove_edge(&mut self, id: EdgeId) -> Result<E, EvographError> {
        let entry = self.unlink(id).ok_or(EvographError::EdgeNotFound(id))?;
        if let Err(e) = self.enforce() {
            self.link(entry);
            return Err(e);
        }
        Ok(entry.value)
    }

    /// Remove a node together with every incident edge.
    ///
    /// Returns the ids of the removed edges.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Vec<EdgeId>, EvographError> {
        if !self.nodes.contains_key(&id) {
            return Err(EvographError::NodeNotFound(id));
        }

        let incident: BTreeSet<EdgeId> = self
            .outgoing_edges(id)
            .chain(self.incoming_edges(id))
            .collect();
        let removed_edges: Vec<EdgeEntry<E>> =
            incident.iter().filter_map(|e| self.unlink(*e)).collect();
        self.outgoing.remove(&id);
        self.incoming.remove(&id);
        let Some(node) = self.nodes.remove(&id) else {
            return Err(EvographError::NodeNotFound(id));
        };

        if let Err(e) = self.enforce() {
            self.nodes.insert(id, node);
            for edge in removed_edges {
                self.link(edge);
            }
            return Err(e);
        }
        Ok(incident.into_iter().collect())
    }

    /// Attach an immutable component to a node or edge.
    ///
    /// Fails with `DuplicateComponent` if a component of the same type is
    /// already attached. Attaching a [`Subgraph`] additionally checks that
    /// the nested graph does not contain this graph or any of its
    /// ancestors.
    pub fn attach_component<C: Any + Send + Sync>(
        &mut self,
        element: impl Into<ElementId>,
        mut component: C,
    ) -> Result<(), EvographError> {
        let element = element.into();

        if let Some(sub) = (&mut component as &mut dyn Any).downcast_mut::<Subgraph>() {
            if let ElementId::Edge(_) = element {
                return Err(EvographError::Validation(
                    "subgraphs can only be attached to nodes".to_string(),
                ));
            }
            self.check_nesting(sub)?;
            sub.lineage = self.lineage_with_self();
        }

        let bag = self.components_mut(element)?;
        if bag.insert(component).is_err() {
            return Err(EvographError::DuplicateComponent {
                element,
                component: std::any::type_name::<C>(),
            });
        }
        Ok(())
    }

    /// Detach a component, returning it if it was attached.
    pub fn remove_component<C: Any + Send + Sync + Clone>(
        &mut self,
        element: impl Into<ElementId>,
    ) -> Option<C> {
        self.components_mut(element.into()).ok()?.remove::<C>()
    }

    /// Attach an invariant. Fails (and does not attach it) if the graph
    /// already violates it.
    pub fn add_invariant(&mut self, invariant: Invariant<N, E>) -> Result<(), EvographError> {
        if !invariant.holds(self) {
            return Err(EvographError::ViolatedInvariant(vec![invariant.name()]));
        }
        self.invariants.push(invariant);
        Ok(())
    }

    /// Whether an invariant of this kind is attached.
    #[must_use]
    pub fn has_invariant(&self, kind: InvariantKind) -> bool {
        self.invariants.iter().any(|inv| inv.kind() == Some(kind))
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn enforce(&self) -> Result<(), EvographError> {
        if self.deferred {
            return Ok(());
        }
        self.check_invariants()
    }

    fn link(&mut self, entry: EdgeEntry<E>) {
        self.outgoing.entry(entry.source).or_default().insert(entry.id);
        self.incoming.entry(entry.target).or_default().insert(entry.id);
        self.edges.insert(entry.id, entry);
    }

    fn unlink(&mut self, id: EdgeId) -> Option<EdgeEntry<E>> {
        let entry = self.edges.remove(&id)?;
        if let Some(out) = self.outgoing.get_mut(&entry.source) {
            out.remove(&id);
        }
        if let Some(inc) = self.incoming.get_mut(&entry.target) {
            inc.remove(&id);
        }
        Some(entry)
    }

    fn lineage_with_self(&self) -> Vec<GraphId> {
        let mut lineage = self.lineage.clone();
        lineage.push(self.id);
        lineage
    }

    fn check_nesting(&self, sub: &Subgraph) -> Result<(), EvographError> {
        let mut contained = BTreeSet::new();
        sub.graph.collect_graph_ids(&mut contained);

        if let Some(id) = self
            .lineage_with_self()
            .into_iter()
            .find(|id| contained.contains(id))
        {
            return Err(EvographError::RecursiveSelfReference(id));
        }

        let depth = self.lineage.len() + 1 + sub.graph.nesting_depth();
        if depth > MAX_SUBGRAPH_DEPTH {
            return Err(EvographError::Validation(format!(
                "subgraph nesting depth {} exceeds maximum {}",
                depth, MAX_SUBGRAPH_DEPTH
            )));
        }
        Ok(())
    }
}

impl<N: Clone, E: Clone> Graph<N, E> {
    /// Run several mutations as one unit.
    ///
    /// Invariants are checked once at the end. If the closure fails or the
    /// final state violates an invariant, the graph is restored to its
    /// state before the batch.
    pub fn batch<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, EvographError>,
    ) -> Result<T, EvographError> {
        if self.deferred {
            return f(self);
        }

        let backup = self.clone();
        self.deferred = true;
        let result = f(self);
        self.deferred = false;

        match result.and_then(|value| self.check_invariants().map(|()| value)) {
            Ok(value) => Ok(value),
            Err(e) => {
                *self = backup;
                Err(e)
            }
        }
    }
}

// =============================================================================
// SERIALIZATION
// =============================================================================
//
// Nodes, edges and built-in invariants are serialized. Components and custom
// invariants are runtime-only.

#[derive(Serialize)]
struct GraphRecordRef<'a, N, E> {
    id: GraphId,
    nodes: Vec<NodeRecord<&'a N>>,
    edges: Vec<EdgeRecord<&'a E>>,
    invariants: Vec<InvariantKind>,
}

#[derive(Deserialize)]
struct GraphRecord<N, E> {
    id: GraphId,
    nodes: Vec<NodeRecord<N>>,
    edges: Vec<EdgeRecord<E>>,
    #[serde(default)]
    invariants: Vec<InvariantKind>,
}

#[derive(Serialize, Deserialize)]
struct NodeRecord<N> {
    id: NodeId,
    value: N,
}

#[derive(Serialize, Deserialize)]
struct EdgeRecord<E> {
    id: EdgeId,
    source: NodeId,
    target: NodeId,
    value: E,
}

impl<N: Serialize, E: Serialize> Serialize for Graph<N, E> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        GraphRecordRef {
            id: self.id,
            nodes: self
                .nodes
                .values()
                .map(|n| NodeRecord {
                    id: n.id,
                    value: &n.value,
                })
                .collect(),
            edges: self
                .edges
                .values()
                .map(|e| EdgeRecord {
                    id: e.id,
                    source: e.source,
                    target: e.target,
                    value: &e.value,
                })
                .collect(),
            invariants: self.invariants.iter().filter_map(Invariant::kind).collect(),
        }
        .serialize(serializer)
    }
}

impl<'de, N: Deserialize<'de>, E: Deserialize<'de>> Deserialize<'de> for Graph<N, E> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let record = GraphRecord::<N, E>::deserialize(deserializer)?;
        let mut graph = Self::with_id(record.id);
        graph.deferred = true;
        for node in record.nodes {
            graph
                .insert_node(node.id, node.value)
                .map_err(serde::de::Error::custom)?;
        }
        for edge in record.edges {
            graph
                .insert_edge(edge.id, edge.source, edge.target, edge.value)
                .map_err(serde::de::Error::custom)?;
        }
        graph.deferred = false;
        for kind in record.invariants {
            graph
                .add_invariant(kind.into())
                .map_err(serde::de::Error::custom)?;
        }
        Ok(graph)
    }
}

// =============================================================================
// TESTS
// =============================================================================
