//! Replication Configuration
//!
//! Configuration for the replication channel between the two sites.

use crate::domain::value_objects::NodeId;
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the replication channel and its transport.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Identity of this node (e.g., "A")
    pub node_id: NodeId,

    /// Address to bind for QUIC transport (default: 0.0.0.0:4002)
    pub transport_addr: SocketAddr,

    /// Identity of the peer site; `None` runs the node standalone
    pub peer_id: Option<NodeId>,

    /// Transport address of the peer
    pub peer_addr: Option<SocketAddr>,

    /// Maximum entries per shipped batch (default: 128)
    pub batch_size: usize,

    /// First retry delay after a failed send (default: 200ms)
    pub retry_initial: Duration,

    /// Upper bound of the retry backoff (default: 10s)
    pub retry_max: Duration,

    /// Resend unacknowledged entries after this long without an ack (default: 3s)
    pub ack_timeout: Duration,

    /// Timeout for (re)establishing the connection to the peer (default: 5s)
    pub handshake_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(""),
            transport_addr: SocketAddr::from(([0, 0, 0, 0], 4002)),
            peer_id: None,
            peer_addr: None,
            batch_size: 128,
            retry_initial: Duration::from_millis(200),
            retry_max: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl ReplicationConfig {
    /// Create a new configuration with node ID.
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Set the transport address.
    pub fn transport_addr(mut self, addr: SocketAddr) -> Self {
        self.transport_addr = addr;
        self
    }

    /// Set the peer identity and address.
    pub fn peer(mut self, peer_id: impl Into<NodeId>, addr: SocketAddr) -> Self {
        self.peer_id = Some(peer_id.into());
        self.peer_addr = Some(addr);
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the retry backoff bounds.
    pub fn retry(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_initial = initial;
        self.retry_max = max;
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::MissingNodeId);
        }
        match (&self.peer_id, &self.peer_addr) {
            (Some(peer), Some(_)) if *peer == self.node_id => return Err(ConfigError::PeerIsSelf),
            (Some(peer), _) if peer.is_empty() => return Err(ConfigError::MissingPeerId),
            (None, Some(_)) => return Err(ConfigError::MissingPeerId),
            (Some(_), None) => return Err(ConfigError::MissingPeerAddr),
            _ => {}
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        if self.retry_initial.is_zero() || self.retry_initial > self.retry_max {
            return Err(ConfigError::InvalidRetry);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("node_id is required")]
    MissingNodeId,
    #[error("peer_id is required when a peer address is set")]
    MissingPeerId,
    #[error("peer_addr is required when a peer id is set")]
    MissingPeerAddr,
    #[error("peer_id must differ from node_id")]
    PeerIsSelf,
    #[error("batch_size must be positive")]
    InvalidBatchSize,
    #[error("retry backoff must be positive and initial <= max")]
    InvalidRetry,
}
