//! Density-based clustering into convex regions.

use super::{ConceptualPoint, Metric};
use crate::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

/// DBSCAN parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Neighbourhood radius.
    pub epsilon: f32,
    /// Minimum neighbourhood size (including the point) for a core point.
    pub min_points: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            epsilon: 1.0,
            min_points: 3,
        }
    }
}

/// A cluster summarised as the intersection of a ball around its
/// prototype and its axis-aligned bounding box. Both are convex, so the
/// region is too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvexRegion {
    pub id: usize,
    pub members: Vec<NodeId>,
    /// Centroid of the members.
    pub prototype: Vec<f32>,
    /// Largest member distance from the prototype.
    pub radius: f32,
    pub lower: Vec<f32>,
    pub upper: Vec<f32>,
}

impl ConvexRegion {
    fn from_members(id: usize, metric: &Metric, members: &[&ConceptualPoint]) -> Self {
        let dimensions = members.first().map_or(0, |p| p.coordinates.len());
        let mut sums = vec![0.0f64; dimensions];
        let mut lower = vec![f32::INFINITY; dimensions];
        let mut upper = vec![f32::NEG_INFINITY; dimensions];

        for point in members {
            for (d, value) in point.coordinates.iter().enumerate() {
                sums[d] += f64::from(*value);
                lower[d] = lower[d].min(*value);
                upper[d] = upper[d].max(*value);
            }
        }
        let count = members.len().max(1) as f64;
        let prototype: Vec<f32> = sums.iter().map(|s| (s / count) as f32).collect();
        let radius = members
            .iter()
            .map(|p| metric.distance(&prototype, &p.coordinates))
            .fold(0.0f32, f32::max);

        Self {
            id,
            members: members.iter().map(|p| p.node_id).collect(),
            prototype,
            radius,
            lower,
            upper,
        }
    }

    /// Whether `point` lies in both the ball and the box.
    pub fn contains(&self, metric: &Metric, point: &[f32]) -> bool {
        point.len() == self.prototype.len()
            && point
                .iter()
                .zip(self.lower.iter().zip(&self.upper))
                .all(|(v, (lo, hi))| lo <= v && v <= hi)
            && metric.distance(&self.prototype, point) <= self.radius
    }
}

/// Cluster `points` (which must be sorted by node id) deterministically.
///
/// Points are visited in node id order and neighbourhoods are expanded
/// breadth-first, so the same input always yields the same regions with
/// the same ids. Noise points belong to no region.
pub(crate) fn dbscan(
    points: &[&ConceptualPoint],
    metric: &Metric,
    config: ClusterConfig,
) -> Vec<ConvexRegion> {
    const UNVISITED: usize = usize::MAX;
    const NOISE: usize = usize::MAX - 1;

    let neighbours = |i: usize| -> Vec<usize> {
        points
            .iter()
            .enumerate()
            .filter(|(_, q)| {
                metric.distance(&points[i].coordinates, &q.coordinates) <= config.epsilon
            })
            .map(|(j, _)| j)
            .collect()
    };

    let mut labels = vec![UNVISITED; points.len()];
    let mut cluster = 0usize;

    for i in 0..points.len() {
        if labels[i] != UNVISITED {
            continue;
        }
        let seeds = neighbours(i);
        if seeds.len() < config.min_points {
            labels[i] = NOISE;
            continue;
        }

        labels[i] = cluster;
        let mut queue: VecDeque<usize> = seeds.into_iter().filter(|j| *j != i).collect();
        while let Some(j) = queue.pop_front() {
            if labels[j] == NOISE {
                // Border point.
                labels[j] = cluster;
                continue;
            }
            if labels[j] != UNVISITED {
                continue;
            }
            labels[j] = cluster;
            let reach = neighbours(j);
            if reach.len() >= config.min_points {
                queue.extend(reach.into_iter().filter(|k| labels[*k] == UNVISITED || labels[*k] == NOISE));
            }
        }
        cluster += 1;
    }

    (0..cluster)
        .map(|c| {
            let members: Vec<&ConceptualPoint> = points
                .iter()
                .zip(&labels)
                .filter(|(_, label)| **label == c)
                .map(|(p, _)| *p)
                .collect();
            ConvexRegion::from_members(c, metric, &members)
        })
        .collect()
}

/// Node ids not assigned to any region.
pub(crate) fn noise(points: &[&ConceptualPoint], regions: &[ConvexRegion]) -> BTreeSet<NodeId> {
    let clustered: BTreeSet<NodeId> = regions.iter().flat_map(|r| r.members.iter().copied()).collect();
    points
        .iter()
        .map(|p| p.node_id)
        .filter(|id| !clustered.contains(id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(x: f32, y: f32) -> ConceptualPoint {
        ConceptualPoint::new(NodeId::new(), vec![x, y], 1.0)
    }

    fn sorted(points: &[ConceptualPoint]) -> Vec<&ConceptualPoint> {
        let mut refs: Vec<&ConceptualPoint> = points.iter().collect();
        refs.sort_by_key(|p| p.node_id);
        refs
    }

    fn two_blobs() -> Vec<ConceptualPoint> {
        vec![
            point(0.0, 0.0),
            point(0.5, 0.0),
            point(0.0, 0.5),
            point(0.5, 0.5),
            point(10.0, 10.0),
            point(10.5, 10.0),
            point(10.0, 10.5),
            point(50.0, 50.0),
        ]
    }

    #[test]
    fn finds_two_clusters_and_noise() {
        let points = two_blobs();
        let refs = sorted(&points);
        let regions = dbscan(&refs, &Metric::Euclidean, ClusterConfig::default());
        assert_eq!(regions.len(), 2);

        let mut sizes: Vec<usize> = regions.iter().map(|r| r.members.len()).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![3, 4]);

        let outliers = noise(&refs, &regions);
        assert_eq!(outliers.len(), 1);
        assert!(outliers.contains(&points[7].node_id));
    }

    #[test]
    fn clustering_is_deterministic() {
        let points = two_blobs();
        let refs = sorted(&points);
        let first = dbscan(&refs, &Metric::Euclidean, ClusterConfig::default());
        let second = dbscan(&refs, &Metric::Euclidean, ClusterConfig::default());
        assert_eq!(first, second);
    }

    #[test]
    fn region_contains_its_members_and_prototype() {
        let points = two_blobs();
        let refs = sorted(&points);
        let regions = dbscan(&refs, &Metric::Euclidean, ClusterConfig::default());
        for region in &regions {
            assert!(region.contains(&Metric::Euclidean, &region.prototype));
            for member in &region.members {
                let p = points
                    .iter()
                    .find(|p| p.node_id == *member)
                    .expect("member exists");
                assert!(region.contains(&Metric::Euclidean, &p.coordinates));
            }
            assert!(!region.contains(&Metric::Euclidean, &[50.0, 50.0]));
        }
    }

    #[test]
    fn sparse_points_are_all_noise() {
        let points = vec![point(0.0, 0.0), point(5.0, 5.0), point(10.0, 10.0)];
        let refs = sorted(&points);
        let regions = dbscan(&refs, &Metric::Euclidean, ClusterConfig::default());
        assert!(regions.is_empty());
        assert_eq!(noise(&refs, &regions).len(), 3);
    }
}
