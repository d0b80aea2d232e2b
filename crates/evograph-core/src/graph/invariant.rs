//! # Graph Invariants
//!
//! Predicates over `(nodes, edges)` that a graph must satisfy after every
//! mutation (or at the end of every batch). The set of invariant kinds is
//! closed; ad-hoc predicates use the named `Custom` variant.

use super::Graph;
use crate::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Predicate type for custom invariants.
pub type InvariantFn<N, E> = Arc<dyn Fn(&Graph<N, E>) -> bool + Send + Sync>;

/// The serializable, built-in invariant kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvariantKind {
    /// No directed cycles (self-loops included).
    Acyclic,
    /// The graph is empty or weakly connected.
    Connected,
    /// No edge has the same source and target.
    NoSelfLoops,
    /// At most this many nodes.
    MaxNodes(usize),
}

/// An invariant attached to a graph instance.
pub enum Invariant<N, E> {
    Acyclic,
    Connected,
    NoSelfLoops,
    MaxNodes(usize),
    Custom {
        name: String,
        predicate: InvariantFn<N, E>,
    },
}

impl<N, E> Invariant<N, E> {
    /// Build a named custom invariant.
    pub fn custom(
        name: impl Into<String>,
        predicate: impl Fn(&Graph<N, E>) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::Custom {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Human-readable name, reported in `ViolatedInvariant`.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Acyclic => "acyclic".to_string(),
            Self::Connected => "connected".to_string(),
            Self::NoSelfLoops => "no_self_loops".to_string(),
            Self::MaxNodes(max) => format!("max_nodes({})", max),
            Self::Custom { name, .. } => name.clone(),
        }
    }

    /// The serializable kind, `None` for custom predicates.
    #[must_use]
    pub fn kind(&self) -> Option<InvariantKind> {
        match self {
            Self::Acyclic => Some(InvariantKind::Acyclic),
            Self::Connected => Some(InvariantKind::Connected),
            Self::NoSelfLoops => Some(InvariantKind::NoSelfLoops),
            Self::MaxNodes(max) => Some(InvariantKind::MaxNodes(*max)),
            Self::Custom { .. } => None,
        }
    }

    /// Evaluate the predicate.
    #[must_use]
    pub fn holds(&self, graph: &Graph<N, E>) -> bool {
        match self {
            Self::Acyclic => is_acyclic(graph),
            Self::Connected => is_weakly_connected(graph),
            Self::NoSelfLoops => graph.edges().all(|e| e.source != e.target),
            Self::MaxNodes(max) => graph.node_count() <= *max,
            Self::Custom { predicate, .. } => predicate(graph),
        }
    }
}

impl<N, E> From<InvariantKind> for Invariant<N, E> {
    fn from(kind: InvariantKind) -> Self {
        match kind {
            InvariantKind::Acyclic => Self::Acyclic,
            InvariantKind::Connected => Self::Connected,
            InvariantKind::NoSelfLoops => Self::NoSelfLoops,
            InvariantKind::MaxNodes(max) => Self::MaxNodes(max),
        }
    }
}

impl<N, E> Clone for Invariant<N, E> {
    fn clone(&self) -> Self {
        match self {
            Self::Acyclic => Self::Acyclic,
            Self::Connected => Self::Connected,
            Self::NoSelfLoops => Self::NoSelfLoops,
            Self::MaxNodes(max) => Self::MaxNodes(*max),
            Self::Custom { name, predicate } => Self::Custom {
                name: name.clone(),
                predicate: Arc::clone(predicate),
            },
        }
    }
}

impl<N, E> fmt::Debug for Invariant<N, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invariant({})", self.name())
    }
}

// =============================================================================
// CHECKS
// =============================================================================

/// Kahn's algorithm: the graph is acyclic iff every node can be removed
/// in topological order.
fn is_acyclic<N, E>(graph: &Graph<N, E>) -> bool {
    let mut in_degree: BTreeMap<NodeId, usize> = graph.nodes().map(|n| (n.id, 0)).collect();
    for edge in graph.edges() {
        if let Some(d) = in_degree.get_mut(&edge.target) {
            *d = d.saturating_add(1);
        }
    }

    let mut queue: VecDeque<NodeId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut removed = 0usize;

    while let Some(node) = queue.pop_front() {
        removed = removed.saturating_add(1);
        // One decrement per edge, so parallel edges drain fully.
        for edge in graph.outgoing_edges(node) {
            let Some(target) = graph.edge(edge).map(|e| e.target) else {
                continue;
            };
            if let Some(d) = in_degree.get_mut(&target) {
                *d = d.saturating_sub(1);
                if *d == 0 {
                    queue.push_back(target);
                }
            }
        }
    }

    removed == graph.node_count()
}

/// BFS ignoring edge direction from the first node.
fn is_weakly_connected<N, E>(graph: &Graph<N, E>) -> bool {
    let Some(start) = graph.nodes().next().map(|n| n.id) else {
        return true;
    };

    let mut seen = BTreeSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(node) = queue.pop_front() {
        for next in graph
            .outgoing_targets(node)
            .into_iter()
            .chain(graph.incoming_sources(node))
        {
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }

    seen.len() == graph.node_count()
}

// =============================================================================
// TESTS
// =============================================================================
