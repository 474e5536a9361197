//! Peer Link Port
//!
//! The replication channel talks to the peer through a `PeerLink` for
//! outbound messages and a stream of `LinkEvent`s for everything inbound.
//! `QuicPeerLink` is the production implementation; `MemoryNetwork` wires two
//! channels together in-process and can simulate a partition.

use crate::replication::transport::{decode_message, encode_message};
use crate::replication::types::Message;
use crate::domain::value_objects::NodeId;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events delivered to the replication channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A message arrived from the peer
    Message(Message),
    /// The peer became reachable (again)
    Connected,
    /// The peer went away
    Disconnected,
}

/// Outbound half of the connection to the peer.
#[async_trait]
pub trait PeerLink: Send + Sync {
    fn peer_id(&self) -> &NodeId;

    /// Deliver one message. Errors mean the peer is currently unreachable.
    async fn send(&self, message: &Message) -> anyhow::Result<()>;
}

const EVENT_BUFFER: usize = 1024;

/// In-process link to the other end of a `MemoryNetwork`.
pub struct MemoryLink {
    peer_id: NodeId,
    to_peer: mpsc::Sender<LinkEvent>,
    partitioned: Arc<AtomicBool>,
}

#[async_trait]
impl PeerLink for MemoryLink {
    fn peer_id(&self) -> &NodeId {
        &self.peer_id
    }

    async fn send(&self, message: &Message) -> anyhow::Result<()> {
        if self.partitioned.load(Ordering::SeqCst) {
            anyhow::bail!("peer {} unreachable", self.peer_id);
        }
        // Go through the wire codec so both links see what QUIC would carry.
        let frame = encode_message(message)?;
        let decoded = decode_message(&frame[4..])?;
        self.to_peer
            .send(LinkEvent::Message(decoded))
            .await
            .map_err(|_| anyhow::anyhow!("peer {} is gone", self.peer_id))
    }
}

/// One end of a memory network: the link to the peer plus this side's inbox.
pub struct MemoryEndpoint {
    pub link: Arc<MemoryLink>,
    pub events: mpsc::Receiver<LinkEvent>,
}

/// Two nodes connected in-process.
pub struct MemoryNetwork {
    partitioned: Arc<AtomicBool>,
    inbox_a: mpsc::Sender<LinkEvent>,
    inbox_b: mpsc::Sender<LinkEvent>,
}

impl MemoryNetwork {
    /// Connect `a` and `b`. Both inboxes start with a `Connected` event.
    pub fn pair(a: NodeId, b: NodeId) -> (Self, MemoryEndpoint, MemoryEndpoint) {
        let (tx_a, rx_a) = mpsc::channel(EVENT_BUFFER);
        let (tx_b, rx_b) = mpsc::channel(EVENT_BUFFER);
        let partitioned = Arc::new(AtomicBool::new(false));

        let _ = tx_a.try_send(LinkEvent::Connected);
        let _ = tx_b.try_send(LinkEvent::Connected);

        let end_a = MemoryEndpoint {
            link: Arc::new(MemoryLink {
                peer_id: b,
                to_peer: tx_b.clone(),
                partitioned: partitioned.clone(),
            }),
            events: rx_a,
        };
        let end_b = MemoryEndpoint {
            link: Arc::new(MemoryLink {
                peer_id: a,
                to_peer: tx_a.clone(),
                partitioned: partitioned.clone(),
            }),
            events: rx_b,
        };
        let network = Self {
            partitioned,
            inbox_a: tx_a,
            inbox_b: tx_b,
        };
        (network, end_a, end_b)
    }

    /// Cut the link; sends fail until `heal`.
    pub async fn partition(&self) {
        if !self.partitioned.swap(true, Ordering::SeqCst) {
            let _ = self.inbox_a.send(LinkEvent::Disconnected).await;
            let _ = self.inbox_b.send(LinkEvent::Disconnected).await;
        }
    }

    pub async fn heal(&self) {
        if self.partitioned.swap(false, Ordering::SeqCst) {
            let _ = self.inbox_a.send(LinkEvent::Connected).await;
            let _ = self.inbox_b.send(LinkEvent::Connected).await;
        }
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitioned.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_messages() {
        let (_net, a, mut b) = MemoryNetwork::pair(NodeId::new("A"), NodeId::new("B"));
        assert_eq!(b.events.recv().await, Some(LinkEvent::Connected));

        a.link.send(&Message::SyncRequest { from_seq: 4 }).await.unwrap();
        assert_eq!(
            b.events.recv().await,
            Some(LinkEvent::Message(Message::SyncRequest { from_seq: 4 }))
        );
        assert_eq!(a.link.peer_id(), &NodeId::new("B"));
    }

    #[tokio::test]
    async fn test_partition_and_heal() {
        let (net, mut a, b) = MemoryNetwork::pair(NodeId::new("A"), NodeId::new("B"));
        assert_eq!(a.events.recv().await, Some(LinkEvent::Connected));

        net.partition().await;
        assert!(net.is_partitioned());
        assert_eq!(a.events.recv().await, Some(LinkEvent::Disconnected));
        assert!(b.link.send(&Message::SyncRequest { from_seq: 1 }).await.is_err());

        net.heal().await;
        assert_eq!(a.events.recv().await, Some(LinkEvent::Connected));
        b.link.send(&Message::SyncRequest { from_seq: 1 }).await.unwrap();
        assert!(matches!(a.events.recv().await, Some(LinkEvent::Message(_))));
    }
}
