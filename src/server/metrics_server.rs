// src/server/metrics_server.rs

use crate::core::metrics;
use crate::core::metrics::gather_metrics;
use crate::core::state::ServerState;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Handles HTTP requests to the /metrics endpoint.
///
/// The connected-clients gauge is re-sampled from the client registry
/// before gathering so it stays authoritative even if a handler died
/// without its guard running.
async fn metrics_handler(state: Arc<ServerState>) -> impl IntoResponse {
    metrics::CONNECTED_CLIENTS.set(state.clients.len() as f64);
    let body = gather_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

/// Runs a simple HTTP server to expose Prometheus metrics on /metrics.
pub async fn run_metrics_server(state: Arc<ServerState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let port = state.config.metrics.port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let app_state = state.clone();
    let app = Router::new().route(
        "/metrics",
        get(move || metrics_handler(app_state.clone())),
    );

    info!("Metrics server listening on http://{}/metrics", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };

    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown_rx.recv().await;
        info!("Metrics server received shutdown signal.");
    });

    if let Err(e) = server.await {
        error!("Metrics server error: {}", e);
    }
}
