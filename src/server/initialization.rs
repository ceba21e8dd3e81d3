// src/server/initialization.rs

//! Handles the complete server initialization process: state setup,
//! listener binding, and the optional metrics endpoint.

use super::context::ServerContext;
use super::metrics_server::run_metrics_server;
use crate::config::Config;
use crate::core::handler::GraphEngine;
use crate::core::state::ServerState;
use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tracing::info;

/// Initializes all server components before starting the main loop.
pub async fn setup(config: Config, engine: Arc<dyn GraphEngine>) -> Result<ServerContext> {
    config.validate()?;
    let (shutdown_tx, _) = broadcast::channel(1);

    let state = ServerState::new(config, engine);
    info!("Server state initialized.");

    let mut background_tasks: JoinSet<Result<(), anyhow::Error>> = JoinSet::new();
    if state.config.metrics.enabled {
        let metrics_state = state.clone();
        let metrics_shutdown_rx = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            run_metrics_server(metrics_state, metrics_shutdown_rx).await;
            Ok(())
        });
    }

    let listener =
        TcpListener::bind((state.config.host.as_str(), state.config.port)).await?;
    info!(
        "boltgate listening on {}:{} (websocket {})",
        state.config.host,
        state.config.port,
        if state.config.websocket.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    let connection_permits = Arc::new(Semaphore::new(state.config.max_clients));

    Ok(ServerContext {
        state,
        listener,
        shutdown_tx,
        background_tasks,
        connection_permits,
    })
}
