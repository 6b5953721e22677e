use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::search::SearchIndex;

/// Shared state for the health endpoint.
#[derive(Clone)]
pub struct HealthState {
    /// Role of this process: "session", "crawler" or "indexer"
    pub node_type: &'static str,

    pub started_at: Instant,

    /// Probed on /health when present; a node without an index dependency
    /// reports healthy on its own
    pub index: Option<Arc<dyn SearchIndex>>,

    /// Remote shutdown trigger, shared with the worker loops
    pub shutdown: Arc<watch::Sender<bool>>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/shutdown", post(shutdown))
        .with_state(state)
}

/// Bind the health endpoint and serve until the process exits.
pub async fn serve(port: u16, state: HealthState) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind health endpoint on port {}", port))?;
    info!("Health endpoint listening on port {}", port);
    serve_on(listener, state).await
}

/// Serve on an already-bound listener. Split out so tests can bind an
/// ephemeral port.
pub async fn serve_on(listener: TcpListener, state: HealthState) -> Result<()> {
    axum::serve(listener, router(state))
        .await
        .context("Health endpoint server failed")
}

async fn health(State(state): State<HealthState>) -> impl IntoResponse {
    let index_ok = match &state.index {
        Some(index) => index.is_reachable().await,
        None => true,
    };

    if index_ok {
        (
            StatusCode::OK,
            Json(json!({ "status": "ok", "node_type": state.node_type })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "error",
                "node_type": state.node_type,
                "message": "search index not reachable",
            })),
        )
    }
}

async fn status(State(state): State<HealthState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "node_type": state.node_type,
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "search_index": state.index.is_some(),
    }))
}

async fn shutdown(State(state): State<HealthState>) -> impl IntoResponse {
    info!("Shutdown requested via health endpoint");
    let _ = state.shutdown.send(true);
    (StatusCode::OK, Json(json!({ "status": "shutting down" })))
}
