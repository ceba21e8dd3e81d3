// src/core/state/core.rs

//! Defines the central `ServerState` struct, holding all shared server-wide state.

use super::client::ClientMap;
use super::stats::StatsState;
use crate::config::Config;
use crate::core::handler::GraphEngine;
use dashmap::DashMap;
use std::sync::Arc;

/// The central struct holding all shared, server-wide state.
/// It is wrapped in an `Arc` and handed to every connection handler,
/// providing a single source of truth for configuration, the client
/// registry, and the query engine.
pub struct ServerState {
    /// A map of all active client connections, keyed by a unique session ID.
    /// Stores client metadata and a shutdown sender for targeted connection termination.
    pub clients: ClientMap,
    /// The server's resolved, immutable runtime configuration.
    pub config: Arc<Config>,
    /// The query layer every data request is delegated to.
    pub engine: Arc<dyn GraphEngine>,
    /// Server-wide counters.
    pub stats: StatsState,
}

impl ServerState {
    /// Builds the shared state from a validated configuration and an engine.
    pub fn new(config: Config, engine: Arc<dyn GraphEngine>) -> Arc<Self> {
        Arc::new(Self {
            clients: Arc::new(DashMap::new()),
            config: Arc::new(config),
            engine,
            stats: StatsState::new(),
        })
    }
}
