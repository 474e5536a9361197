use crate::infrastructure::health_monitor::HealthMonitorConfig;
use crate::replication::ReplicationConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Config {
    // Node identity and storage
    pub node_id: String,
    pub db_path: String,
    pub seed_path: Option<String>,
    /// Accepted local operations between snapshots (0 disables)
    pub snapshot_every: u64,
    pub debug: bool,

    // HTTP API
    pub api_listen_addr: String,

    // Replication with the peer site
    pub transport_addr: String,
    pub peer_id: Option<String>,
    pub peer_addr: Option<String>,

    // Health monitor
    pub heartbeat_ms: u64,
    pub peer_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "A".to_string(),
            db_path: "lending.db".to_string(),
            seed_path: None,
            snapshot_every: 500,
            debug: false,
            api_listen_addr: "0.0.0.0:8090".to_string(),
            transport_addr: "0.0.0.0:4002".to_string(),
            peer_id: None,
            peer_addr: None,
            heartbeat_ms: 2000,
            peer_timeout_ms: 6000,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("LENDING_NODE_ID must not be empty")]
    EmptyNodeId,

    #[error("invalid address in {var}: {value}")]
    InvalidAddr { var: &'static str, value: String },

    #[error("LENDING_PEER_ID and LENDING_PEER_ADDR must be set together")]
    IncompletePeer,

    #[error("peer id must differ from the node id")]
    PeerIsSelf,

    #[error("LENDING_PEER_TIMEOUT_MS must be larger than LENDING_HEARTBEAT_MS")]
    PeerTimeoutTooShort,

    #[error(transparent)]
    Replication(#[from] crate::replication::ConfigError),
}

impl Config {
    /// Build from a variable lookup; unparsable numbers fall back to defaults.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |name: &str, default: u64| {
            var(name)
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };

        Self {
            node_id: var("LENDING_NODE_ID").unwrap_or(defaults.node_id),
            db_path: var("LENDING_DB_PATH").unwrap_or(defaults.db_path),
            seed_path: var("LENDING_SEED_PATH"),
            snapshot_every: number("LENDING_SNAPSHOT_EVERY", defaults.snapshot_every),
            debug: var("DEBUG").is_some(),
            api_listen_addr: var("LENDING_API_ADDR").unwrap_or(defaults.api_listen_addr),
            transport_addr: var("LENDING_TRANSPORT_ADDR").unwrap_or(defaults.transport_addr),
            peer_id: var("LENDING_PEER_ID").filter(|v| !v.trim().is_empty()),
            peer_addr: var("LENDING_PEER_ADDR").filter(|v| !v.trim().is_empty()),
            heartbeat_ms: number("LENDING_HEARTBEAT_MS", defaults.heartbeat_ms),
            peer_timeout_ms: number("LENDING_PEER_TIMEOUT_MS", defaults.peer_timeout_ms),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::EmptyNodeId);
        }
        parse_addr("LENDING_TRANSPORT_ADDR", &self.transport_addr)?;
        parse_addr("LENDING_API_ADDR", &self.api_listen_addr)?;
        match (&self.peer_id, &self.peer_addr) {
            (Some(id), Some(addr)) => {
                if id == &self.node_id {
                    return Err(ConfigError::PeerIsSelf);
                }
                parse_addr("LENDING_PEER_ADDR", addr)?;
            }
            (None, None) => {}
            _ => return Err(ConfigError::IncompletePeer),
        }
        if self.peer_timeout_ms <= self.heartbeat_ms {
            return Err(ConfigError::PeerTimeoutTooShort);
        }
        Ok(())
    }

    pub fn has_peer(&self) -> bool {
        self.peer_id.is_some() && self.peer_addr.is_some()
    }

    /// Replication settings; the peer is set only when configured.
    pub fn replication(&self) -> Result<ReplicationConfig, ConfigError> {
        let mut config = ReplicationConfig::new(self.node_id.as_str())
            .transport_addr(parse_addr("LENDING_TRANSPORT_ADDR", &self.transport_addr)?);
        if let (Some(id), Some(addr)) = (&self.peer_id, &self.peer_addr) {
            config = config.peer(id.as_str(), parse_addr("LENDING_PEER_ADDR", addr)?);
            config.validate()?;
        }
        Ok(config)
    }

    pub fn health(&self) -> HealthMonitorConfig {
        HealthMonitorConfig::default()
            .interval(Duration::from_millis(self.heartbeat_ms))
            .peer_timeout(Duration::from_millis(self.peer_timeout_ms))
    }
}

fn parse_addr(var: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidAddr {
        var,
        value: value.to_string(),
    })
}

/// Load and validate the configuration from the environment.
pub fn load_config() -> anyhow::Result<Config> {
    let config = Config::from_lookup(|name| std::env::var(name).ok());
    config.validate()?;
    Ok(config)
}
