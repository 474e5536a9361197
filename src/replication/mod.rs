//! Replication between the two sites
//!
//! Each site ships its own log entries to the peer over a QUIC link and
//! ingests the peer's entries through the idempotent apply path.
//!
//! ## Architecture
//!
//! - **Transport (QUIC)**: one uni stream per message, length-prefixed bincode
//! - **Link**: `PeerLink` port with QUIC and in-memory implementations
//! - **Channel**: per-origin sequence numbers, acks and resend from the log
//!
//! ## Delivery
//!
//! 1. A local apply appends an entry with the next `origin_seq` and wakes the channel
//! 2. The channel reads unsent local entries from the log and ships them in batches
//! 3. The peer applies them in `origin_seq` order and acknowledges the highest one
//! 4. On reconnect each side asks for everything after its applied-index
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lending_core::replication::{ReplicationChannel, ReplicationConfig, TransportService};
//!
//! let config = ReplicationConfig::new("site-a").peer("site-b", "10.0.0.2:4002".parse()?);
//! let mut transport = TransportService::new(config.clone());
//! transport.start().await?;
//! let events = transport.take_event_rx().unwrap();
//! let link = Arc::new(transport.link("site-b".into(), "10.0.0.2:4002".parse()?)?);
//! let channel = Arc::new(ReplicationChannel::new(node, link, config)?);
//! tokio::spawn(channel.run(events, shutdown.subscribe()));
//! ```

pub mod channel;
pub mod config;
pub mod link;
pub mod transport;
pub mod types;

pub use channel::{ChannelStats, ReplicationChannel};
pub use config::{ConfigError, ReplicationConfig};
pub use link::{LinkEvent, MemoryEndpoint, MemoryLink, MemoryNetwork, PeerLink};
pub use transport::{QuicPeerLink, TransportService};
pub use types::{EntryBatch, Message};
