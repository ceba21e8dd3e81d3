// src/config.rs

//! Manages server configuration: loading, resolving dynamic values, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;

/// Configuration for the WebSocket transport wrapper.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WebSocketConfig {
    /// If false, HTTP upgrade requests are rejected and only raw-TCP
    /// Bolt clients are accepted.
    #[serde(default = "default_ws_enabled")]
    pub enabled: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: default_ws_enabled(),
        }
    }
}

fn default_ws_enabled() -> bool {
    true
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8687
}

#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum MaxMessageSizeConfig {
    Bytes(usize),
    String(String),
}

/// A raw representation of the config file before validation and resolution.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_max_clients")]
    max_clients: usize,
    #[serde(default = "default_max_message_size_config")]
    max_message_size: MaxMessageSizeConfig,
    #[serde(default)]
    websocket: WebSocketConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7687
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_clients() -> usize {
    10000
}
fn default_max_message_size_config() -> MaxMessageSizeConfig {
    MaxMessageSizeConfig::Bytes(default_max_message_size())
}
fn default_max_message_size() -> usize {
    512 * 1024 * 1024
}

/// Represents the final, validated, and resolved server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub max_clients: usize,
    /// The largest reassembled Bolt message the server accepts, in bytes.
    pub max_message_size: usize,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            max_clients: default_max_clients(),
            max_message_size: default_max_message_size(),
            websocket: WebSocketConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw_config: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        let config = Config {
            host: raw_config.host,
            port: raw_config.port,
            log_level: raw_config.log_level,
            max_clients: raw_config.max_clients,
            max_message_size: resolve_max_message_size(raw_config.max_message_size)?,
            websocket: raw_config.websocket,
            metrics: raw_config.metrics,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.max_clients == 0 {
            return Err(anyhow!("max_clients cannot be 0"));
        }
        if self.max_message_size == 0 {
            return Err(anyhow!("max_message_size cannot be 0"));
        }

        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if self.metrics.port == self.port {
                return Err(anyhow!(
                    "metrics.port cannot be the same as the main server port"
                ));
            }
        }
        Ok(())
    }
}

/// Resolves the `max_message_size` setting into bytes. Accepts a plain
/// number or a string with a unit suffix (e.g. "512mb", "1g").
fn resolve_max_message_size(cfg: MaxMessageSizeConfig) -> Result<usize> {
    match cfg {
        MaxMessageSizeConfig::Bytes(b) => Ok(b),
        MaxMessageSizeConfig::String(s) => {
            let s_lower = s.to_lowercase();
            if let Some(val_str) = s_lower.strip_suffix("gb") {
                parse_size_string(&s, val_str, 1024 * 1024 * 1024)
            } else if let Some(val_str) = s_lower.strip_suffix('g') {
                parse_size_string(&s, val_str, 1024 * 1024 * 1024)
            } else if let Some(val_str) = s_lower.strip_suffix("mb") {
                parse_size_string(&s, val_str, 1024 * 1024)
            } else if let Some(val_str) = s_lower.strip_suffix('m') {
                parse_size_string(&s, val_str, 1024 * 1024)
            } else if let Some(val_str) = s_lower.strip_suffix("kb") {
                parse_size_string(&s, val_str, 1024)
            } else if let Some(val_str) = s_lower.strip_suffix('k') {
                parse_size_string(&s, val_str, 1024)
            } else {
                s.parse().with_context(|| {
                    format!(
                        "Invalid max_message_size value '{s}'. Must be a number (bytes) or have a unit (e.g., '512mb')."
                    )
                })
            }
        }
    }
}

/// Parses a string number with a unit (kb, mb, gb) and applies a multiplier.
fn parse_size_string(original_str: &str, value_str: &str, multiplier: u64) -> Result<usize> {
    let value: u64 = value_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid number in max_message_size config: '{original_str}'"))?;
    let result_u64 = value.saturating_mul(multiplier);
    if result_u64 > (usize::MAX as u64) {
        return Err(anyhow!(
            "max_message_size value '{}' is too large for this system's architecture",
            original_str
        ));
    }
    Ok(result_u64 as usize)
}
