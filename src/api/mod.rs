//! HTTP ingestion and read API.
//!
//! ## Endpoints
//!
//! - `POST /api/v1/metrics/push` - full metrics ingest (scope `metrics:write`)
//! - `POST /api/v1/heartbeat` - liveness ping (scope `heartbeat:write`)
//! - `GET /api/v1/health` - liveness plus fleet counters, unauthenticated
//! - `GET /api/v1/agents` - list agent snapshots
//! - `GET /api/v1/agents/{name}` - one agent, 404 when unknown
//! - `GET /api/v1/agents/{name}/alerts` - alert history for one agent
//! - `GET /api/v1/alerts` - active alerts across the fleet
//! - `GET /api/v1/events` - SSE snapshot stream for dashboards

pub mod auth;
pub mod error;
pub mod routes;

pub use error::{ApiError, ApiResult};

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{middleware, Router};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::state::StateStore;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<StateStore>,
}

/// Assembles the full router. Write endpoints carry their scope middleware;
/// the read surface is open for dashboards.
pub fn router(store: Arc<StateStore>, config: &ServerConfig) -> Router {
    let keys = Arc::new(config.api_keys.clone());
    let state = ApiState { store };

    let metrics_ingest = Router::new()
        .route("/api/v1/metrics/push", post(routes::push_metrics))
        .route_layer(middleware::from_fn_with_state(
            auth::RequireScope::new(keys.clone(), "metrics:write"),
            auth::require_scope,
        ))
        .layer(DefaultBodyLimit::max(routes::MAX_BODY_BYTES));

    let heartbeat_ingest = Router::new()
        .route("/api/v1/heartbeat", post(routes::heartbeat))
        .route_layer(middleware::from_fn_with_state(
            auth::RequireScope::new(keys, "heartbeat:write"),
            auth::require_scope,
        ));

    let read_surface = Router::new()
        .route("/api/v1/health", get(routes::health))
        .route("/api/v1/agents", get(routes::list_agents))
        .route("/api/v1/agents/:name", get(routes::get_agent))
        .route("/api/v1/agents/:name/alerts", get(routes::agent_alerts))
        .route("/api/v1/alerts", get(routes::list_alerts))
        .route("/api/v1/events", get(routes::events));

    let mut app = metrics_ingest
        .merge(heartbeat_ingest)
        .merge(read_surface)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if config.cors_enabled {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }

    app
}

/// Binds and spawns the API server in a background task; resolves shutdown
/// through the cancellation token. Returns the bound address (useful with
/// port 0 in tests).
pub async fn spawn_api_server(
    config: &ServerConfig,
    store: Arc<StateStore>,
    cancel: CancellationToken,
) -> Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;
    let addr = listener.local_addr()?;
    let app = router(store, config);

    info!("API server listening on {addr}");

    tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("API server error: {err}");
        }
    });

    Ok(addr)
}
