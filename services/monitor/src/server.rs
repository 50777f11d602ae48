//! HTTP endpoint serving the metric registry to Prometheus

use crate::config::ServiceConfig;
use crate::metrics::MetricsRegistry;
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Shared state of the metrics server
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<MetricsRegistry>,
    pub service: String,
}

/// Create the metrics router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Prometheus text exposition of every registered metric
async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, TEXT_FORMAT)],
        state.registry.render(),
    )
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.service,
    }))
}

/// Serve the metrics router until `shutdown` is cancelled
pub async fn start_metrics_server(
    state: AppState,
    config: &ServiceConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", config.metrics_host, config.metrics_port);

    info!(address = %addr, "Starting metrics server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Metrics server error")?;

    info!("Metrics server stopped");

    Ok(())
}
