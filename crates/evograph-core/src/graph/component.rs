//! # Components
//!
//! Immutable, type-tagged metadata attached to nodes and edges.
//!
//! A `ComponentBag` holds at most one value per Rust type. Values are
//! stored behind `Arc` so that cloning a graph (for batch rollback or for
//! nesting) never deep-copies component data.
//!
//! `Subgraph` is the one component the graph itself understands: it owns
//! an entire nested graph whose node and edge types are independent of the
//! outer graph.

use super::Graph;
use crate::GraphId;
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// COMPONENT BAG
// =============================================================================

#[derive(Clone)]
struct StoredComponent {
    name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

/// Type-indexed set of immutable components.
#[derive(Clone, Default)]
pub struct ComponentBag {
    entries: BTreeMap<TypeId, StoredComponent>,
}

impl ComponentBag {
    /// Create an empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a component. Returns the value back if one of the same type
    /// is already present; components are never overwritten.
    pub(crate) fn insert<C: Any + Send + Sync>(&mut self, component: C) -> Result<(), C> {
        let key = TypeId::of::<C>();
        if self.entries.contains_key(&key) {
            return Err(component);
        }
        self.entries.insert(
            key,
            StoredComponent {
                name: std::any::type_name::<C>(),
                value: Arc::new(component),
            },
        );
        Ok(())
    }

    /// Borrow the component of type `C`, if attached.
    #[must_use]
    pub fn get<C: Any + Send + Sync>(&self) -> Option<&C> {
        self.entries
            .get(&TypeId::of::<C>())
            .and_then(|stored| stored.value.downcast_ref::<C>())
    }

    /// Whether a component of type `C` is attached.
    #[must_use]
    pub fn contains<C: Any + Send + Sync>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<C>())
    }

    /// Detach and return the component of type `C`.
    ///
    /// If the value is still shared with a clone of the graph, it is cloned
    /// out of the shared allocation.
    pub(crate) fn remove<C: Any + Send + Sync + Clone>(&mut self) -> Option<C> {
        let stored = self.entries.remove(&TypeId::of::<C>())?;
        stored.value.downcast::<C>().ok().map(Arc::unwrap_or_clone)
    }

    /// Type names of all attached components, in a stable order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.values().map(|stored| stored.name)
    }

    /// Number of attached components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no components are attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ComponentBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

// =============================================================================
// NESTED GRAPHS
// =============================================================================

/// Type-erased view of a graph embedded inside a `Subgraph` component.
///
/// Lets the outer graph count and inspect nested graphs without knowing
/// their node and edge types.
pub trait NestedGraph: Any + Send + Sync {
    /// Identity of the nested graph.
    fn graph_id(&self) -> GraphId;

    /// Nodes of this graph plus all nodes of graphs nested inside it.
    fn total_node_count(&self) -> usize;

    /// Collect this graph's id and every id nested below it.
    fn collect_graph_ids(&self, out: &mut BTreeSet<GraphId>);

    /// Levels of nesting, counting this graph as 1.
    fn nesting_depth(&self) -> usize;

    /// Upcast for typed access.
    fn as_any(&self) -> &dyn Any;
}

impl<N, E> NestedGraph for Graph<N, E>
where
    N: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn graph_id(&self) -> GraphId {
        self.id()
    }

    fn total_node_count(&self) -> usize {
        Graph::total_node_count(self)
    }

    fn collect_graph_ids(&self, out: &mut BTreeSet<GraphId>) {
        out.insert(self.id());
        for sub in self.subgraphs() {
            sub.graph.collect_graph_ids(out);
        }
    }

    fn nesting_depth(&self) -> usize {
        1 + self
            .subgraphs()
            .map(|sub| sub.graph.nesting_depth())
            .max()
            .unwrap_or(0)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A component owning an entire nested graph.
///
/// This is the sole recursion mechanism of the substrate. The nested graph
/// is immutable while attached; to change it, clone it out with
/// [`Subgraph::to_graph`], mutate, and attach the result again. The
/// clone remembers its ancestry, so it can never be made to embed one of
/// the graphs it lives in.
#[derive(Clone)]
pub struct Subgraph {
    pub(crate) graph: Arc<dyn NestedGraph>,
    pub(crate) lineage: Vec<GraphId>,
}

impl Subgraph {
    /// Wrap a graph so it can be attached to a node.
    #[must_use]
    pub fn new<N, E>(graph: Graph<N, E>) -> Self
    where
        N: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        Self {
            lineage: graph.lineage().to_vec(),
            graph: Arc::new(graph),
        }
    }

    /// Identity of the nested graph.
    #[must_use]
    pub fn graph_id(&self) -> GraphId {
        self.graph.graph_id()
    }

    /// Nodes contained in the nested graph, recursively.
    #[must_use]
    pub fn total_node_count(&self) -> usize {
        self.graph.total_node_count()
    }

    /// Ancestors of the nested graph, outermost first.
    #[must_use]
    pub fn lineage(&self) -> &[GraphId] {
        &self.lineage
    }

    /// Typed borrow of the nested graph.
    #[must_use]
    pub fn graph<N, E>(&self) -> Option<&Graph<N, E>>
    where
        N: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        self.graph.as_any().downcast_ref::<Graph<N, E>>()
    }

    /// Clone the nested graph out for editing. The clone keeps the
    /// ancestry it had while attached.
    #[must_use]
    pub fn to_graph<N, E>(&self) -> Option<Graph<N, E>>
    where
        N: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        self.graph::<N, E>().map(|g| {
            let mut copy = g.clone();
            copy.set_lineage(self.lineage.clone());
            copy
        })
    }
}

impl fmt::Debug for Subgraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subgraph")
            .field("graph_id", &self.graph_id())
            .field("total_node_count", &self.total_node_count())
            .field("lineage", &self.lineage)
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
