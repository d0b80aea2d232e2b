//! # Path Enumeration
//!
//! Lazy, restartable enumeration of simple directed paths.

use super::Graph;
use crate::NodeId;
use crate::primitives::MAX_PATH_LENGTH;
use std::collections::{BTreeSet, VecDeque};

/// Iterator over the simple paths from `source` to `target`.
///
/// Paths are produced depth-first with successors visited in id order, so
/// the sequence is deterministic for a given graph. Every path visits a
/// node at most once and has at most `MAX_PATH_LENGTH` nodes, which makes
/// the sequence finite. `restart` rewinds to the first path.
pub struct Paths<'g, N, E> {
    graph: &'g Graph<N, E>,
    source: NodeId,
    target: NodeId,
    path: Vec<NodeId>,
    on_path: BTreeSet<NodeId>,
    frontier: Vec<std::vec::IntoIter<NodeId>>,
    trivial_pending: bool,
}

impl<'g, N, E> Paths<'g, N, E> {
    pub(crate) fn new(graph: &'g Graph<N, E>, source: NodeId, target: NodeId) -> Self {
        let mut paths = Self {
            graph,
            source,
            target,
            path: Vec::new(),
            on_path: BTreeSet::new(),
            frontier: Vec::new(),
            trivial_pending: false,
        };
        paths.restart();
        paths
    }

    /// Rewind the enumeration to its first path.
    pub fn restart(&mut self) {
        self.path.clear();
        self.on_path.clear();
        self.frontier.clear();
        self.trivial_pending = false;

        if !self.graph.contains_node(self.source) || !self.graph.contains_node(self.target) {
            return;
        }
        if self.source == self.target {
            self.trivial_pending = true;
            return;
        }

        self.path.push(self.source);
        self.on_path.insert(self.source);
        self.frontier
            .push(self.graph.outgoing_targets(self.source).into_iter());
    }
}

impl<N, E> Iterator for Paths<'_, N, E> {
    type Item = Vec<NodeId>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.trivial_pending {
            self.trivial_pending = false;
            return Some(vec![self.source]);
        }

        while let Some(children) = self.frontier.last_mut() {
            match children.next() {
                Some(child) if child == self.target => {
                    let mut found = self.path.clone();
                    found.push(child);
                    return Some(found);
                }
                Some(child) => {
                    // Leave room for the target itself.
                    if self.on_path.contains(&child) || self.path.len() + 1 >= MAX_PATH_LENGTH {
                        continue;
                    }
                    self.path.push(child);
                    self.on_path.insert(child);
                    self.frontier
                        .push(self.graph.outgoing_targets(child).into_iter());
                }
                None => {
                    self.frontier.pop();
                    if let Some(node) = self.path.pop() {
                        self.on_path.remove(&node);
                    }
                }
            }
        }
        None
    }
}

/// Breadth-first shortest path by edge count.
pub(crate) fn shortest_path<N, E>(
    graph: &Graph<N, E>,
    source: NodeId,
    target: NodeId,
) -> Option<Vec<NodeId>> {
    if !graph.contains_node(source) || !graph.contains_node(target) {
        return None;
    }
    if source == target {
        return Some(vec![source]);
    }

    let mut prev = std::collections::BTreeMap::new();
    let mut seen = BTreeSet::from([source]);
    let mut queue = VecDeque::from([source]);

    while let Some(current) = queue.pop_front() {
        for next in graph.outgoing_targets(current) {
            if !seen.insert(next) {
                continue;
            }
            prev.insert(next, current);
            if next == target {
                let mut path = vec![target];
                let mut cursor = target;
                while let Some(&p) = prev.get(&cursor) {
                    path.push(p);
                    cursor = p;
                }
                path.reverse();
                return Some(path);
            }
            queue.push_back(next);
        }
    }
    None
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// a -> b -> d, a -> c -> d, b -> c
    fn diamond() -> (Graph<&'static str, ()>, [NodeId; 4]) {
        let mut g = Graph::new();
        let a = g.add_node("a").expect("add");
        let b = g.add_node("b").expect("add");
        let c = g.add_node("c").expect("add");
        let d = g.add_node("d").expect("add");
        g.add_edge(a, b, ()).expect("edge");
        g.add_edge(a, c, ()).expect("edge");
        g.add_edge(b, d, ()).expect("edge");
        g.add_edge(c, d, ()).expect("edge");
        g.add_edge(b, c, ()).expect("edge");
        (g, [a, b, c, d])
    }

    #[test]
    fn enumerates_all_simple_paths() {
        let (g, [a, b, c, d]) = diamond();
        let mut paths: Vec<_> = g.find_paths(a, d).collect();
        paths.sort();
        let mut expected = vec![vec![a, b, d], vec![a, c, d], vec![a, b, c, d]];
        expected.sort();
        assert_eq!(paths, expected);
    }

    #[test]
    fn paths_are_lazy_and_restartable() {
        let (g, [a, _, _, d]) = diamond();
        let mut paths = g.find_paths(a, d);
        let first = paths.next().expect("first path");
        let rest = paths.by_ref().count();
        assert_eq!(rest, 2);
        assert!(paths.next().is_none());

        paths.restart();
        assert_eq!(paths.next(), Some(first));
    }

    #[test]
    fn cycles_do_not_loop_forever() {
        let mut g: Graph<(), ()> = Graph::new();
        let a = g.add_node(()).expect("add");
        let b = g.add_node(()).expect("add");
        let c = g.add_node(()).expect("add");
        g.add_edge(a, b, ()).expect("edge");
        g.add_edge(b, a, ()).expect("edge");
        g.add_edge(b, c, ()).expect("edge");
        assert_eq!(g.find_paths(a, c).collect::<Vec<_>>(), vec![vec![a, b, c]]);
    }

    #[test]
    fn missing_endpoint_yields_nothing() {
        let (g, [a, ..]) = diamond();
        assert_eq!(g.find_paths(a, NodeId::new()).count(), 0);
    }

    #[test]
    fn trivial_path_to_self() {
        let (g, [a, ..]) = diamond();
        assert_eq!(g.find_paths(a, a).collect::<Vec<_>>(), vec![vec![a]]);
    }

    #[test]
    fn shortest_path_prefers_fewest_hops() {
        let (g, [a, _, _, d]) = diamond();
        let path = g.shortest_path(a, d).expect("path");
        assert_eq!(path.len(), 3);
        assert_eq!(path.first(), Some(&a));
        assert_eq!(path.last(), Some(&d));
        assert!(g.shortest_path(d, a).is_none());
    }
}
