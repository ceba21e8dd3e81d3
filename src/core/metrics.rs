// src/core/metrics.rs

//! Defines and registers Prometheus metrics for server monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{Counter, Gauge, TextEncoder, register_counter, register_gauge};

lazy_static! {
    /// The number of clients currently connected to the server.
    pub static ref CONNECTED_CLIENTS: Gauge =
        register_gauge!("boltgate_connected_clients", "Number of currently connected clients.").unwrap();

    /// The total number of connections accepted by the server since startup.
    pub static ref CONNECTIONS_RECEIVED_TOTAL: Counter =
        register_counter!("boltgate_connections_received_total", "Total number of connections received.").unwrap();

    /// The total number of Bolt messages processed since startup.
    pub static ref MESSAGES_PROCESSED_TOTAL: Counter =
        register_counter!("boltgate_messages_processed_total", "Total number of Bolt messages processed.").unwrap();

    /// The total number of connections that upgraded to WebSocket transport.
    pub static ref WEBSOCKET_UPGRADES_TOTAL: Counter =
        register_counter!("boltgate_websocket_upgrades_total", "Total number of WebSocket upgrades.").unwrap();

    /// The total number of connections torn down because of protocol errors.
    pub static ref PROTOCOL_ERRORS_TOTAL: Counter =
        register_counter!("boltgate_protocol_errors_total", "Total number of connections closed on protocol errors.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
