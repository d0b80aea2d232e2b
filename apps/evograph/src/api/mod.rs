//! # Evograph HTTP API Module
//!
//! This module implements the HTTP REST API server using axum.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `POST /commands` - Submit a command envelope
//! - `POST /commands/confirm` - Resolve an `unknown` outcome
//! - `GET /aggregates/{id}` - Aggregate state and version
//! - `GET /aggregates/{id}/events?from=` - Stored events
//! - `GET /aggregates/{id}/verify` - Hash chain verification
//! - `POST /query/similar` - Conceptual neighbours of a node
//! - `POST /query/path` - Path between two nodes
//! - `GET /projections/summary` - Graph summary read model
//! - `GET /clusters` - Conceptual clusters
//! - `GET /status` - Engine status
//! - `POST /export` - Log archive, base64
//!
//! ## Security Configuration
//!
//! See `config::ServerConfig`. `EVOGRAPH_API_KEY`, `EVOGRAPH_CORS_ORIGINS`
//! and `EVOGRAPH_RATE_LIMIT` override the file.

mod auth;
mod handlers;
mod middleware;
mod types;

pub use auth::{ApiKey, keys_match};
pub use middleware::{GlobalRateLimiter, create_rate_limiter};
pub use handlers::{
    aggregate_handler, clusters_handler, confirm_handler, events_handler, export_handler,
    health_handler, path_handler, similar_handler, status_handler, submit_handler,
    summary_handler, verify_handler,
};
pub use types::{
    AggregateResponse, ApiError, ClustersResponse, ErrorResponse, EventsQuery, EventsResponse,
    ExportResponse, HealthResponse, NeighbourJson, PathRequest, PathResponse, SimilarRequest,
    SimilarResponse, StatusResponse, SummaryResponse, status_for,
};

use crate::config::{EvographConfig, RuntimeConfig, ServerConfig};
use crate::dispatch::CommandDispatcher;
use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware as axum_middleware,
    routing::{get, post},
};
use evograph_core::{EvographError, Session};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

// =============================================================================
// SERVER STATE
// =============================================================================

/// Shared server state: the dispatcher owns the session.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<CommandDispatcher>,
}

impl AppState {
    #[must_use]
    pub fn new(session: Session, runtime: &RuntimeConfig) -> Self {
        Self::from_dispatcher(Arc::new(CommandDispatcher::new(Arc::new(session), runtime)))
    }

    #[must_use]
    pub fn from_dispatcher(dispatcher: Arc<CommandDispatcher>) -> Self {
        Self { dispatcher }
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

/// Build the CORS layer.
///
/// - `"*"`: allows all origins (development only)
/// - unset: localhost only
/// - otherwise: comma-separated list of allowed origins
fn build_cors_layer(origins: Option<&str>) -> CorsLayer {
    match origins {
        Some("*") => {
            tracing::warn!("CORS: Allowing ALL origins. This is insecure for production!");
            CorsLayer::permissive()
        }
        Some(origins) => {
            let allowed_origins: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|s| {
                    let trimmed = s.trim();
                    match trimmed.parse::<HeaderValue>() {
                        Ok(hv) => {
                            tracing::info!("CORS: Allowing origin: {}", trimmed);
                            Some(hv)
                        }
                        Err(e) => {
                            tracing::warn!("CORS: Invalid origin '{}': {}", trimmed, e);
                            None
                        }
                    }
                })
                .collect();

            if allowed_origins.is_empty() {
                tracing::warn!("CORS: No valid origins configured, defaulting to localhost only");
                build_localhost_cors()
            } else {
                CorsLayer::new()
                    .allow_origin(allowed_origins)
                    .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                    .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            }
        }
        None => {
            tracing::info!("CORS: No origins configured, defaulting to localhost only");
            build_localhost_cors()
        }
    }
}

/// Build a restrictive CORS layer that only allows localhost origins.
fn build_localhost_cors() -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        "http://localhost:3000",
        "http://localhost:8080",
        "http://127.0.0.1:3000",
        "http://127.0.0.1:8080",
    ]
    .into_iter()
    .filter_map(|o| o.parse::<HeaderValue>().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Router with default server settings plus `EVOGRAPH_*` overrides.
pub fn create_router(state: AppState) -> Router {
    create_router_with(state, &ServerConfig::default().with_env_overrides())
}

/// Create the axum router with all endpoints and middleware.
///
/// Middleware stack (outer to inner):
/// 1. Tracing - logs all requests
/// 2. CORS - handles preflight requests
/// 3. Body limit
/// 4. Rate Limiting (if enabled)
/// 5. Authentication (if a key is configured)
pub fn create_router_with(state: AppState, server: &ServerConfig) -> Router {
    let cors = build_cors_layer(server.cors_origins.as_deref());

    let rate_limiter = create_rate_limiter(server.rate_limit);
    match rate_limiter {
        Some(_) => tracing::info!("Rate limiting enabled: {} requests/second", server.rate_limit),
        None => tracing::info!("Rate limiting disabled"),
    }

    let api_key: Option<ApiKey> = server.api_key.as_deref().map(Arc::from);
    if api_key.is_some() {
        tracing::info!("API key authentication enabled");
    } else {
        tracing::warn!(
            "API key authentication DISABLED - all endpoints are publicly accessible! \
             Set EVOGRAPH_API_KEY to enable authentication."
        );
    }

    let mut router = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/status", get(handlers::status_handler))
        .route("/commands", post(handlers::submit_handler))
        .route("/commands/confirm", post(handlers::confirm_handler))
        .route("/aggregates/{id}", get(handlers::aggregate_handler))
        .route("/aggregates/{id}/events", get(handlers::events_handler))
        .route("/aggregates/{id}/verify", get(handlers::verify_handler))
        .route("/query/similar", post(handlers::similar_handler))
        .route("/query/path", post(handlers::path_handler))
        .route("/projections/summary", get(handlers::summary_handler))
        .route("/clusters", get(handlers::clusters_handler))
        .route("/export", post(handlers::export_handler));

    if let Some(key) = api_key {
        router = router.layer(axum_middleware::from_fn_with_state(
            key,
            auth::api_key_auth_middleware,
        ));
    }

    if let Some(limiter) = rate_limiter {
        router = router.layer(axum_middleware::from_fn_with_state(
            limiter,
            middleware::rate_limit_middleware,
        ));
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(axum::extract::DefaultBodyLimit::max(server.body_limit)),
        )
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Start the HTTP server and its projector; stop both on Ctrl+C.
pub async fn run_server(config: &EvographConfig, session: Session) -> Result<(), EvographError> {
    let server = config.server.clone().with_env_overrides();
    let dispatcher = Arc::new(CommandDispatcher::new(Arc::new(session), &config.runtime));
    let (stop, shutdown) = tokio::sync::watch::channel(false);
    let projector = dispatcher.spawn_projector(shutdown);

    let router = create_router_with(AppState::from_dispatcher(dispatcher), &server);
    let addr = server.address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| EvographError::IoError(format!("Bind failed: {}", e)))?;

    tracing::info!("Evograph HTTP server listening on {}", addr);

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down");
        })
        .await
        .map_err(|e| EvographError::IoError(format!("Server error: {}", e)));

    let _ = stop.send(true);
    if let Err(e) = projector.await {
        tracing::warn!("Projector task failed: {}", e);
    }
    served
}
