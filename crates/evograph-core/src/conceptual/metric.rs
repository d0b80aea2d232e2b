//! Distance metrics over conceptual coordinates.
//!
//! A `Metric` must satisfy the metric-space axioms, because region queries
//! and clustering rely on the triangle inequality. Built-in metrics are
//! checked analytically; custom functions are probed on a fixed lattice.

use crate::EvographError;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A user-supplied distance function.
pub type DistanceFn = Arc<dyn Fn(&[f32], &[f32]) -> f32 + Send + Sync>;

/// Absolute slack allowed when probing axioms, to absorb f32 rounding.
const PROBE_TOLERANCE: f32 = 1e-4;

/// The closed set of distance strategies.
#[derive(Default)]
pub enum Metric {
    /// L2 distance. The default.
    #[default]
    Euclidean,
    /// L1 distance.
    Manhattan,
    /// L-infinity distance.
    Chebyshev,
    /// L2 distance with a positive weight per dimension.
    WeightedEuclidean(Vec<f32>),
    /// Cosine distance. Nameable so configuration can refer to it, and
    /// always rejected: it violates the triangle inequality.
    Cosine,
    /// A named function, validated empirically.
    Custom { name: String, function: DistanceFn },
}

impl Metric {
    /// Build a custom metric.
    pub fn custom(
        name: impl Into<String>,
        function: impl Fn(&[f32], &[f32]) -> f32 + Send + Sync + 'static,
    ) -> Self {
        Self::Custom {
            name: name.into(),
            function: Arc::new(function),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Euclidean => "euclidean",
            Self::Manhattan => "manhattan",
            Self::Chebyshev => "chebyshev",
            Self::WeightedEuclidean(_) => "weighted_euclidean",
            Self::Cosine => "cosine",
            Self::Custom { name, .. } => name,
        }
    }

    /// Distance between two points of equal length.
    ///
    /// Accumulates in f64 so that high-dimensional sums stay symmetric.
    #[must_use]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        let pairs = a.iter().zip(b).map(|(x, y)| (f64::from(*x), f64::from(*y)));
        match self {
            Self::Euclidean => pairs.map(|(x, y)| (x - y) * (x - y)).sum::<f64>().sqrt() as f32,
            Self::Manhattan => pairs.map(|(x, y)| (x - y).abs()).sum::<f64>() as f32,
            Self::Chebyshev => pairs.map(|(x, y)| (x - y).abs()).fold(0.0, f64::max) as f32,
            Self::WeightedEuclidean(weights) => pairs
                .zip(weights)
                .map(|((x, y), w)| f64::from(*w) * (x - y) * (x - y))
                .sum::<f64>()
                .sqrt() as f32,
            Self::Cosine => {
                let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
                for (x, y) in pairs {
                    dot += x * y;
                    na += x * x;
                    nb += y * y;
                }
                if na == 0.0 || nb == 0.0 {
                    1.0
                } else {
                    (1.0 - dot / (na.sqrt() * nb.sqrt())) as f32
                }
            }
            Self::Custom { function, .. } => function(a, b),
        }
    }

    /// Check that this metric is usable in a space of `dimensions`.
    pub fn validate(&self, dimensions: usize) -> Result<(), EvographError> {
        match self {
            Self::Euclidean | Self::Manhattan | Self::Chebyshev => Ok(()),
            Self::Cosine => Err(self.invalid(
                "cosine distance violates the triangle inequality".to_string(),
            )),
            Self::WeightedEuclidean(weights) => {
                if weights.len() != dimensions {
                    return Err(self.invalid(format!(
                        "{} weights for {} dimensions",
                        weights.len(),
                        dimensions
                    )));
                }
                if let Some(w) = weights.iter().find(|w| !w.is_finite() || **w <= 0.0) {
                    return Err(self.invalid(format!(
                        "weights must be finite and positive, found {}",
                        w
                    )));
                }
                Ok(())
            }
            Self::Custom { .. } => self.probe(dimensions),
        }
    }

    fn invalid(&self, reason: String) -> EvographError {
        EvographError::InvalidMetric {
            metric: self.name().to_string(),
            reason,
        }
    }

    /// Empirical axiom check on the probe lattice.
    fn probe(&self, dimensions: usize) -> Result<(), EvographError> {
        let points = probe_lattice(dimensions);

        for (i, a) in points.iter().enumerate() {
            let self_distance = self.distance(a, a);
            if self_distance.abs() > PROBE_TOLERANCE {
                return Err(self.invalid(format!(
                    "d(p, p) = {} for probe {}",
                    self_distance, i
                )));
            }
            for (j, b) in points.iter().enumerate().skip(i + 1) {
                let ab = self.distance(a, b);
                let ba = self.distance(b, a);
                if !ab.is_finite() || ab <= 0.0 {
                    return Err(self.invalid(format!(
                        "d(p{}, p{}) = {} must be positive for distinct points",
                        i, j, ab
                    )));
                }
                if (ab - ba).abs() > PROBE_TOLERANCE * ab.max(1.0) {
                    return Err(self.invalid(format!(
                        "asymmetric: d(p{i}, p{j}) = {ab}, d(p{j}, p{i}) = {ba}"
                    )));
                }
            }
        }

        for (i, a) in points.iter().enumerate() {
            for (j, b) in points.iter().enumerate() {
                let ab = self.distance(a, b);
                for (k, c) in points.iter().enumerate() {
                    let ac = self.distance(a, c);
                    let bound = ab + self.distance(b, c);
                    if ac > bound + PROBE_TOLERANCE * bound.max(1.0) {
                        return Err(self.invalid(format!(
                            "triangle inequality fails: d(p{i}, p{k}) = {ac} > d(p{i}, p{j}) + d(p{j}, p{k}) = {bound}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Deterministic probe points: origin, signed unit vectors on the first
/// few axes, and a handful of mixed points spread over all axes.
fn probe_lattice(dimensions: usize) -> Vec<Vec<f32>> {
    let axes = dimensions.min(4);
    let mut points = vec![vec![0.0; dimensions]];

    for axis in 0..axes {
        for sign in [1.0f32, -1.0] {
            let p = (0..dimensions)
                .map(|d| if d == axis { sign } else { 0.0 })
                .collect();
            points.push(p);
        }
    }
    for seed in 1..=6usize {
        let p = (0..dimensions)
            .map(|d| {
                let v = (seed * 7 + d * 3) % 11;
                (v as f32 - 5.0) / 2.0
            })
            .collect::<Vec<f32>>();
        if !points.contains(&p) {
            points.push(p);
        }
    }
    points
}

impl Clone for Metric {
    fn clone(&self) -> Self {
        match self {
            Self::Euclidean => Self::Euclidean,
            Self::Manhattan => Self::Manhattan,
            Self::Chebyshev => Self::Chebyshev,
            Self::WeightedEuclidean(w) => Self::WeightedEuclidean(w.clone()),
            Self::Cosine => Self::Cosine,
            Self::Custom { name, function } => Self::Custom {
                name: name.clone(),
                function: Arc::clone(function),
            },
        }
    }
}

impl fmt::Debug for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WeightedEuclidean(w) => f.debug_tuple("WeightedEuclidean").field(w).finish(),
            other => write!(f, "Metric({})", other.name()),
        }
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Resolves metric names (as written in configuration) to strategies.
///
/// Built-in names are always present; custom functions are registered
/// under their own names and validated when a space is built.
#[derive(Clone, Default)]
pub struct MetricRegistry {
    custom: BTreeMap<String, DistanceFn>,
}

const BUILTIN_NAMES: [&str; 5] = [
    "euclidean",
    "manhattan",
    "chebyshev",
    "weighted_euclidean",
    "cosine",
];

impl MetricRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom distance function under `name`.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        function: impl Fn(&[f32], &[f32]) -> f32 + Send + Sync + 'static,
    ) -> Result<(), EvographError> {
        let name = name.into();
        if BUILTIN_NAMES.contains(&name.as_str()) || self.custom.contains_key(&name) {
            return Err(EvographError::Validation(format!(
                "metric '{}' is already registered",
                name
            )));
        }
        self.custom.insert(name, Arc::new(function));
        Ok(())
    }

    /// Every resolvable name, built-ins first.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        BUILTIN_NAMES
            .iter()
            .map(|n| (*n).to_string())
            .chain(self.custom.keys().cloned())
            .collect()
    }

    /// Look a metric up by name. `weights` is required for
    /// `weighted_euclidean` and ignored otherwise.
    pub fn resolve(&self, name: &str, weights: Option<&[f32]>) -> Result<Metric, EvographError> {
        match name {
            "euclidean" => Ok(Metric::Euclidean),
            "manhattan" => Ok(Metric::Manhattan),
            "chebyshev" => Ok(Metric::Chebyshev),
            "cosine" => Ok(Metric::Cosine),
            "weighted_euclidean" => weights
                .map(|w| Metric::WeightedEuclidean(w.to_vec()))
                .ok_or_else(|| EvographError::InvalidMetric {
                    metric: name.to_string(),
                    reason: "weights are required".to_string(),
                }),
            other => self
                .custom
                .get(other)
                .map(|function| Metric::Custom {
                    name: other.to_string(),
                    function: Arc::clone(function),
                })
                .ok_or_else(|| EvographError::InvalidMetric {
                    metric: other.to_string(),
                    reason: "unknown metric".to_string(),
                }),
        }
    }
}

impl fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
