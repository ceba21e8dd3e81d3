// src/server/mod.rs

use crate::config::Config;
use crate::core::handler::GraphEngine;
use anyhow::Result;
use std::sync::Arc;

mod connection_loop;
mod context;
mod initialization;
mod metrics_server;

pub use context::ServerContext;

/// The main server startup function, orchestrating all setup phases.
pub async fn run(config: Config, engine: Arc<dyn GraphEngine>) -> Result<()> {
    // 1. Initialize server state, listener, and the optional metrics endpoint.
    let server_context = initialization::setup(config, engine).await?;

    // 2. Start the main connection acceptance loop. This function will run until shutdown.
    connection_loop::run(server_context).await;

    Ok(())
}
