//! # API Endpoint Handlers
//!
//! This module implements the actual HTTP endpoint handlers.
//!
//! Every engine call goes through the dispatcher: writes are serialized per
//! aggregate, reads run on the blocking pool under the projection timeout.
//! Projection-backed reads catch up first, so a client sees its own commits.

use super::{
    AppState,
    types::{
        AggregateResponse, ApiError, ClustersResponse, EventsQuery, EventsResponse,
        ExportResponse, HealthResponse, NeighbourJson, PathRequest, PathResponse, SimilarRequest,
        SimilarResponse, StatusResponse, SummaryResponse,
    },
};
use crate::dispatch::{CommandEnvelope, CommandOutcome};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use evograph_core::{AggregateId, EvographError, session::AggregateVerification};

fn parse_aggregate_id(raw: &str) -> Result<AggregateId, ApiError> {
    raw.parse().map_err(ApiError::from)
}

/// 200 for a committed outcome, 202 when durability is not yet known.
fn outcome_response(outcome: CommandOutcome) -> (StatusCode, Json<CommandOutcome>) {
    let status = if outcome.is_committed() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    (status, Json(outcome))
}

// =============================================================================
// HEALTH HANDLER
// =============================================================================

/// Health check endpoint.
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

// =============================================================================
// COMMAND HANDLERS
// =============================================================================

/// Submit a command envelope.
pub async fn submit_handler(
    State(state): State<AppState>,
    Json(envelope): Json<CommandEnvelope>,
) -> Result<(StatusCode, Json<CommandOutcome>), ApiError> {
    let command_type = envelope.command_type.clone();
    let aggregate_id = envelope.aggregate_id;
    let outcome = state.dispatcher.dispatch(envelope).await.map_err(|e| {
        tracing::debug!(
            aggregate_id = %aggregate_id,
            command = %command_type,
            code = e.code(),
            "Command rejected"
        );
        ApiError::from(e)
    })?;
    Ok(outcome_response(outcome))
}

/// Re-check an `unknown` outcome against the log.
pub async fn confirm_handler(
    State(state): State<AppState>,
    Json(outcome): Json<CommandOutcome>,
) -> Result<(StatusCode, Json<CommandOutcome>), ApiError> {
    let confirmed = state.dispatcher.confirm(&outcome).await?;
    Ok(outcome_response(confirmed))
}

// =============================================================================
// AGGREGATE HANDLERS
// =============================================================================

/// GetAggregate: state snapshot with its version.
pub async fn aggregate_handler(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<AggregateResponse>, ApiError> {
    let id = parse_aggregate_id(&raw_id)?;
    let response = state
        .dispatcher
        .read(move |s| AggregateResponse::from_root(&s.get_aggregate(id)?))
        .await?;
    Ok(Json(response))
}

/// Stored events after `?from=` (default 0, i.e. all).
pub async fn events_handler(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, ApiError> {
    let id = parse_aggregate_id(&raw_id)?;
    let from = query.from;
    let events = state
        .dispatcher
        .read(move |s| {
            let events = s.events(id, from)?;
            if events.is_empty() && s.graphs().version(id)? == 0 {
                return Err(EvographError::AggregateNotFound(id));
            }
            Ok(events)
        })
        .await?;
    Ok(Json(EventsResponse {
        aggregate_id: id,
        from,
        count: events.len(),
        events,
    }))
}

/// Verify one aggregate's hash chain. A broken chain is still a 200; the
/// body says where it breaks.
pub async fn verify_handler(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<AggregateVerification>, ApiError> {
    let id = parse_aggregate_id(&raw_id)?;
    let chain = state.dispatcher.read(move |s| s.verify(id)).await?;
    if !chain.is_valid {
        tracing::warn!(
            aggregate_id = %id,
            first_invalid = ?chain.first_invalid,
            "Hash chain verification failed"
        );
    }
    Ok(Json(AggregateVerification {
        aggregate_id: id,
        chain,
    }))
}

// =============================================================================
// QUERY HANDLERS
// =============================================================================

/// FindSimilar: mapped nodes within `threshold`, nearest first.
pub async fn similar_handler(
    State(state): State<AppState>,
    Json(request): Json<SimilarRequest>,
) -> Result<Json<SimilarResponse>, ApiError> {
    request.validate()?;
    state.dispatcher.refresh().await;

    let SimilarRequest {
        node_id,
        threshold,
        limit,
    } = request;
    let neighbours = state
        .dispatcher
        .read(move |s| s.find_similar(node_id, threshold, limit))
        .await
        .map_err(ApiError::query)?;

    Ok(Json(SimilarResponse {
        node_id,
        neighbours: neighbours
            .into_iter()
            .map(|(node_id, distance)| NeighbourJson { node_id, distance })
            .collect(),
    }))
}

/// FindPath: fewest-hop path inside one graph.
pub async fn path_handler(
    State(state): State<AppState>,
    Json(request): Json<PathRequest>,
) -> Result<Json<PathResponse>, ApiError> {
    let PathRequest {
        aggregate_id,
        source,
        target,
    } = request;
    let path = state
        .dispatcher
        .read(move |s| s.find_path(aggregate_id, source, target))
        .await
        .map_err(ApiError::query)?;
    Ok(Json(PathResponse::new(aggregate_id, path)))
}

// =============================================================================
// PROJECTION HANDLERS
// =============================================================================

pub async fn summary_handler(
    State(state): State<AppState>,
) -> Result<Json<SummaryResponse>, ApiError> {
    state.dispatcher.refresh().await;
    let graphs = state.dispatcher.read(|s| Ok(s.summaries())).await?;
    Ok(Json(SummaryResponse {
        count: graphs.len(),
        graphs,
    }))
}

pub async fn clusters_handler(
    State(state): State<AppState>,
) -> Result<Json<ClustersResponse>, ApiError> {
    state.dispatcher.refresh().await;
    let clusters = state.dispatcher.read(|s| Ok(s.clusters())).await?;
    Ok(Json(ClustersResponse {
        count: clusters.len(),
        clusters,
    }))
}

// =============================================================================
// STATUS & EXPORT HANDLERS
// =============================================================================

/// Engine counters. Projection positions are reported as they are, so a
/// gap to `last_position` is the current projection lag.
pub async fn status_handler(
    State(state): State<AppState>,
) -> Result<Json<StatusResponse>, ApiError> {
    let status = state.dispatcher.read(|s| s.status()).await?;
    Ok(Json(status))
}

/// Export the whole log as a base64 archive.
pub async fn export_handler(
    State(state): State<AppState>,
) -> Result<Json<ExportResponse>, ApiError> {
    let archive = state.dispatcher.read(|s| s.export_archive()).await?;
    Ok(Json(ExportResponse::success(&archive)))
}
