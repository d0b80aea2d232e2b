//! # API Request/Response Types
//!
//! This module defines the JSON structures for the HTTP API, and the
//! mapping from engine errors to HTTP status codes.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use evograph_core::{
    AggregateId, AggregateRoot, ConvexRegion, ErrorCategory, EventEnvelope, EvographError,
    GraphAggregate, GraphState, NodeId, SessionStatus,
    primitives::MAX_NEIGHBORS,
    projection::GraphSummary,
};
use serde::{Deserialize, Serialize};

// =============================================================================
// HEALTH RESPONSE
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Error body returned by every failing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Stable machine-readable code, e.g. `VIOLATED_INVARIANT`.
    pub code: String,
    pub category: ErrorCategory,
}

/// HTTP status for an engine error.
///
/// | category       | status |
/// |----------------|--------|
/// | validation     | 400    |
/// | state machine  | 409    |
/// | concurrency    | 409    |
/// | not found      | 404    |
/// | invariant      | 422    |
/// | infrastructure | 503    |
pub fn status_for(error: &EvographError) -> StatusCode {
    match error.category() {
        ErrorCategory::Validation => StatusCode::BAD_REQUEST,
        ErrorCategory::StateMachine | ErrorCategory::Concurrency => StatusCode::CONFLICT,
        ErrorCategory::NotFound => StatusCode::NOT_FOUND,
        ErrorCategory::Invariant => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCategory::Infrastructure => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// An engine error on its way to the client.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    /// For queries, a missing node is a lookup miss rather than a broken
    /// invariant.
    pub fn query(error: EvographError) -> Self {
        let mut api = Self::from(error);
        if api.body.code == "NODE_NOT_FOUND" {
            api.status = StatusCode::NOT_FOUND;
        }
        api
    }
}

impl From<EvographError> for ApiError {
    fn from(error: EvographError) -> Self {
        Self {
            status: status_for(&error),
            body: ErrorResponse {
                error: error.to_string(),
                code: error.code().to_string(),
                category: error.category(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(code = %self.body.code, error = %self.body.error, "Request failed");
        }
        (self.status, Json(self.body)).into_response()
    }
}

// =============================================================================
// AGGREGATE RESPONSE
// =============================================================================

/// State snapshot of a graph aggregate at a version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateResponse {
    pub aggregate_id: AggregateId,
    pub version: u64,
    pub status: GraphState,
    pub name: String,
    pub node_count: usize,
    pub edge_count: usize,
    /// Full aggregate state as stored in snapshots.
    pub state: serde_json::Value,
}

impl AggregateResponse {
    pub fn from_root(root: &AggregateRoot<GraphAggregate>) -> Result<Self, EvographError> {
        let state = serde_json::to_value(&root.state)
            .map_err(|e| EvographError::SerializationError(e.to_string()))?;
        Ok(Self {
            aggregate_id: root.id,
            version: root.version,
            status: root.status(),
            name: root.state.name().to_string(),
            node_count: root.state.graph().node_count(),
            edge_count: root.state.graph().edge_count(),
            state,
        })
    }
}

// =============================================================================
// EVENTS
// =============================================================================

/// `?from=` on the events endpoint: only events after this version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub from: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsResponse {
    pub aggregate_id: AggregateId,
    pub from: u64,
    pub count: usize,
    pub events: Vec<EventEnvelope>,
}

// =============================================================================
// SIMILARITY QUERY
// =============================================================================

fn default_limit() -> usize {
    10
}

/// Find nodes near a mapped node in the conceptual space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarRequest {
    pub node_id: NodeId,
    /// Maximum distance, inclusive.
    pub threshold: f32,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

impl SimilarRequest {
    /// Reject non-finite or negative thresholds and unbounded limits.
    pub fn validate(&self) -> Result<(), EvographError> {
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(EvographError::Validation(format!(
                "threshold must be a non-negative number, got {}",
                self.threshold
            )));
        }
        if self.limit == 0 || self.limit > MAX_NEIGHBORS {
            return Err(EvographError::Validation(format!(
                "limit must be between 1 and {}, got {}",
                MAX_NEIGHBORS, self.limit
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighbourJson {
    pub node_id: NodeId,
    pub distance: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarResponse {
    pub node_id: NodeId,
    pub neighbours: Vec<NeighbourJson>,
}

// =============================================================================
// PATH QUERY
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRequest {
    pub aggregate_id: AggregateId,
    pub source: NodeId,
    pub target: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathResponse {
    pub aggregate_id: AggregateId,
    pub path: Vec<NodeId>,
    pub hops: usize,
}

impl PathResponse {
    pub fn new(aggregate_id: AggregateId, path: Vec<NodeId>) -> Self {
        Self {
            aggregate_id,
            hops: path.len().saturating_sub(1),
            path,
        }
    }
}

// =============================================================================
// PROJECTIONS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryResponse {
    pub count: usize,
    pub graphs: Vec<GraphSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClustersResponse {
    pub count: usize,
    pub clusters: Vec<ConvexRegion>,
}

/// Engine status response.
pub type StatusResponse = SessionStatus;

// =============================================================================
// EXPORT RESPONSE
// =============================================================================

/// Export response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResponse {
    pub success: bool,
    pub data: Option<String>, // Base64 encoded archive
    pub bytes: usize,
    /// BLAKE3 of the archive bytes, hex.
    pub checksum: Option<String>,
}

impl ExportResponse {
    pub fn success(data: &[u8]) -> Self {
        Self {
            success: true,
            data: Some(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                data,
            )),
            bytes: data.len(),
            checksum: Some(blake3::hash(data).to_hex().to_string()),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
