//! # Conceptual Index
//!
//! Maps node ids to points in a quality space of fixed dimension and
//! answers similarity queries over them: k-nearest, radius, and
//! membership in convex regions found by clustering.
//!
//! The index is derived data. It is rebuilt from `ConceptMapped` and
//! `NodeRemoved` events by [`crate::projection::ConceptualProjection`].

#![allow(clippy::float_arithmetic)]

mod cluster;
mod metric;

pub use cluster::{ClusterConfig, ConvexRegion};
pub use metric::{DistanceFn, Metric, MetricRegistry};

use crate::primitives::MAX_DIMENSIONS;
use crate::{EvographError, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// A validated quality space: dimension count plus a distance metric.
#[derive(Debug, Clone)]
pub struct ConceptualSpace {
    dimensions: usize,
    metric: Metric,
}

impl ConceptualSpace {
    /// Build a space, rejecting metrics that fail the metric axioms.
    pub fn new(dimensions: usize, metric: Metric) -> Result<Self, EvographError> {
        if dimensions == 0 || dimensions > MAX_DIMENSIONS {
            return Err(EvographError::Validation(format!(
                "dimensions must be in 1..={}, got {}",
                MAX_DIMENSIONS, dimensions
            )));
        }
        metric.validate(dimensions)?;
        Ok(Self { dimensions, metric })
    }

    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    #[must_use]
    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    /// Check that `coordinates` belong in this space.
    pub fn check(&self, coordinates: &[f32]) -> Result<(), EvographError> {
        if coordinates.len() != self.dimensions {
            return Err(EvographError::DimensionMismatch {
                expected: self.dimensions,
                actual: coordinates.len(),
            });
        }
        if coordinates.iter().any(|c| !c.is_finite()) {
            return Err(EvographError::Validation(
                "coordinates must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// A node's position in the space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptualPoint {
    pub node_id: NodeId,
    pub coordinates: Vec<f32>,
    /// In `[0, 1]`.
    pub confidence: f32,
}

impl ConceptualPoint {
    #[must_use]
    pub fn new(node_id: NodeId, coordinates: Vec<f32>, confidence: f32) -> Self {
        Self {
            node_id,
            coordinates,
            confidence,
        }
    }
}

/// Node ids with their distance from a query point.
pub type Neighbours = Vec<(NodeId, f32)>;

/// Brute-force index over one space.
///
/// Points are kept in a `BTreeMap` so every scan visits them in node id
/// order, which makes tie-breaking and clustering deterministic.
#[derive(Debug)]
pub struct ConceptualIndex {
    space: ConceptualSpace,
    clustering: ClusterConfig,
    points: BTreeMap<NodeId, ConceptualPoint>,
    regions: OnceLock<Vec<ConvexRegion>>,
}

impl ConceptualIndex {
    #[must_use]
    pub fn new(space: ConceptualSpace) -> Self {
        Self::with_clustering(space, ClusterConfig::default())
    }

    #[must_use]
    pub fn with_clustering(space: ConceptualSpace, clustering: ClusterConfig) -> Self {
        Self {
            space,
            clustering,
            points: BTreeMap::new(),
            regions: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn space(&self) -> &ConceptualSpace {
        &self.space
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[must_use]
    pub fn get(&self, node_id: NodeId) -> Option<&ConceptualPoint> {
        self.points.get(&node_id)
    }

    pub fn points(&self) -> impl Iterator<Item = &ConceptualPoint> {
        self.points.values()
    }

    /// Insert or replace a node's point.
    pub fn upsert(&mut self, point: ConceptualPoint) -> Result<(), EvographError> {
        self.space.check(&point.coordinates)?;
        if !(0.0..=1.0).contains(&point.confidence) {
            return Err(EvographError::Validation(format!(
                "confidence must be in [0, 1], got {}",
                point.confidence
            )));
        }
        self.points.insert(point.node_id, point);
        self.regions = OnceLock::new();
        Ok(())
    }

    pub fn remove(&mut self, node_id: NodeId) -> Option<ConceptualPoint> {
        let removed = self.points.remove(&node_id);
        if removed.is_some() {
            self.regions = OnceLock::new();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.regions = OnceLock::new();
    }

    /// The `k` nearest points, ascending by distance, ties by node id.
    pub fn k_nearest(&self, query: &[f32], k: usize) -> Result<Neighbours, EvographError> {
        self.space.check(query)?;
        let mut scored = self.score(query);
        scored.truncate(k);
        Ok(scored)
    }

    /// Every node within distance `radius` of `query`.
    pub fn within_radius(&self, query: &[f32], radius: f32) -> Result<BTreeSet<NodeId>, EvographError> {
        self.space.check(query)?;
        let metric = self.space.metric();
        Ok(self
            .points
            .values()
            .filter(|p| metric.distance(query, &p.coordinates) <= radius)
            .map(|p| p.node_id)
            .collect())
    }

    /// Nodes within `threshold` of `node_id`, nearest first, excluding
    /// the node itself.
    pub fn similar_to(
        &self,
        node_id: NodeId,
        threshold: f32,
        limit: usize,
    ) -> Result<Neighbours, EvographError> {
        let origin = self
            .points
            .get(&node_id)
            .ok_or(EvographError::NodeNotFound(node_id))?;
        Ok(self
            .score(&origin.coordinates)
            .into_iter()
            .filter(|(id, distance)| *id != node_id && *distance <= threshold)
            .take(limit)
            .collect())
    }

    /// Convex regions found by clustering. Cached until the next mutation.
    pub fn clusters(&self) -> &[ConvexRegion] {
        self.regions.get_or_init(|| {
            let points: Vec<&ConceptualPoint> = self.points.values().collect();
            let regions = cluster::dbscan(&points, self.space.metric(), self.clustering);
            tracing::debug!(
                points = points.len(),
                regions = regions.len(),
                "conceptual clusters computed"
            );
            regions
        })
    }

    /// Nodes that belong to no cluster.
    pub fn noise(&self) -> BTreeSet<NodeId> {
        let points: Vec<&ConceptualPoint> = self.points.values().collect();
        cluster::noise(&points, self.clusters())
    }

    /// The region whose prototype is nearest to `point`, if any.
    pub fn region_of(&self, point: &[f32]) -> Result<Option<&ConvexRegion>, EvographError> {
        self.space.check(point)?;
        let metric = self.space.metric();
        Ok(self
            .clusters()
            .iter()
            .map(|r| (metric.distance(point, &r.prototype), r))
            .min_by(|(a, ra), (b, rb)| a.total_cmp(b).then(ra.id.cmp(&rb.id)))
            .map(|(_, r)| r))
    }

    fn score(&self, query: &[f32]) -> Neighbours {
        let metric = self.space.metric();
        let mut scored: Neighbours = self
            .points
            .values()
            .map(|p| (p.node_id, metric.distance(query, &p.coordinates)))
            .collect();
        scored.sort_by(|(ia, da), (ib, db)| da.total_cmp(db).then(ia.cmp(ib)));
        scored
    }
}
