//! Health Monitor
//!
//! Emits a liveness beacon on a fixed interval, tracks the peer's beacons and
//! answers on-demand liveness queries. It is purely advisory: nothing here
//! changes node state or blocks the apply path.

use crate::domain::value_objects::{now_millis, NodeId};
use crate::replication::link::PeerLink;
use crate::replication::types::Message;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Liveness beacon payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Beacon {
    pub node_id: NodeId,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Degraded,
}

/// What this node knows about its peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerHealth {
    pub node_id: NodeId,
    pub reachable: bool,
    /// Local time the last beacon was received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_ms: Option<u64>,
}

/// Answer to the on-demand liveness query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub node_id: NodeId,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<PeerHealth>,
}

/// Health monitor configuration.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Interval between beacons
    pub interval: Duration,
    /// Peer is considered unreachable after this long without a beacon
    pub peer_timeout: Duration,
    /// Timeout for the on-demand probe of a remote node
    pub probe_timeout: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            peer_timeout: Duration::from_secs(6),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

impl HealthMonitorConfig {
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStats {
    pub beacons_sent: u64,
    pub peer_beacons_received: u64,
}

/// Periodic beacon publisher and liveness oracle for one node.
pub struct HealthMonitor {
    node_id: NodeId,
    config: HealthMonitorConfig,
    peer: Option<NodeId>,
    link: Option<Arc<dyn PeerLink>>,
    /// 0 means never seen
    peer_last_seen_ms: AtomicU64,
    beacon_tx: broadcast::Sender<Beacon>,
    beacons_sent: AtomicU64,
    peer_beacons: AtomicU64,
}

impl HealthMonitor {
    pub fn new(node_id: NodeId, config: HealthMonitorConfig) -> Self {
        let (beacon_tx, _) = broadcast::channel(16);
        Self {
            node_id,
            config,
            peer: None,
            link: None,
            peer_last_seen_ms: AtomicU64::new(0),
            beacon_tx,
            beacons_sent: AtomicU64::new(0),
            peer_beacons: AtomicU64::new(0),
        }
    }

    /// Track `peer`, and also send beacons to it when a link is given.
    pub fn with_peer(mut self, peer: NodeId, link: Option<Arc<dyn PeerLink>>) -> Self {
        self.peer = Some(peer);
        self.link = link;
        self
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Subscribe to this node's beacons.
    pub fn subscribe(&self) -> broadcast::Receiver<Beacon> {
        self.beacon_tx.subscribe()
    }

    pub fn beacon(&self) -> Beacon {
        Beacon {
            node_id: self.node_id.clone(),
            timestamp_ms: now_millis(),
        }
    }

    /// Record a beacon received from the peer. Beacons of other nodes are ignored.
    pub fn observe_peer_beacon(&self, beacon: &Beacon) {
        if self.peer.as_ref() != Some(&beacon.node_id) {
            tracing::debug!("ignoring beacon from unknown node {}", beacon.node_id);
            return;
        }
        // Local receive time, so clock skew between sites does not matter.
        self.peer_last_seen_ms.store(now_millis(), Ordering::SeqCst);
        self.peer_beacons.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether the peer sent a beacon within the timeout.
    pub fn peer_reachable(&self) -> bool {
        self.peer_reachable_at(now_millis())
    }

    fn peer_reachable_at(&self, now_ms: u64) -> bool {
        let seen = self.peer_last_seen_ms.load(Ordering::SeqCst);
        seen > 0 && now_ms.saturating_sub(seen) <= self.config.peer_timeout.as_millis() as u64
    }

    /// On-demand liveness query. `Degraded` means the peer is not reachable
    /// and callers should continue against this node only.
    pub fn health(&self) -> HealthReport {
        let now = now_millis();
        let peer = self.peer.as_ref().map(|id| {
            let seen = self.peer_last_seen_ms.load(Ordering::SeqCst);
            PeerHealth {
                node_id: id.clone(),
                reachable: self.peer_reachable_at(now),
                last_seen_ms: (seen > 0).then_some(seen),
            }
        });
        let status = match &peer {
            Some(p) if !p.reachable => HealthStatus::Degraded,
            _ => HealthStatus::Up,
        };
        HealthReport {
            status,
            node_id: self.node_id.clone(),
            timestamp_ms: now,
            peer,
        }
    }

    /// Publish one beacon to subscribers and the peer.
    pub async fn emit(&self) -> Beacon {
        let beacon = self.beacon();
        // No subscribers is fine.
        let _ = self.beacon_tx.send(beacon.clone());
        if let Some(link) = &self.link {
            if let Err(e) = link.send(&Message::Heartbeat(beacon.clone())).await {
                tracing::debug!("heartbeat to {} failed: {}", link.peer_id(), e);
            }
        }
        self.beacons_sent.fetch_add(1, Ordering::Relaxed);
        beacon
    }

    /// Start the beacon loop.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn start(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.emit().await;
                }
                _ = shutdown.recv() => {
                    tracing::debug!("health monitor stopping");
                    break;
                }
            }
        }
    }

    pub fn stats(&self) -> HealthStats {
        HealthStats {
            beacons_sent: self.beacons_sent.load(Ordering::Relaxed),
            peer_beacons_received: self.peer_beacons.load(Ordering::Relaxed),
        }
    }

    /// Query the health endpoint of a (remote) node.
    pub async fn probe(&self, url: &str) -> anyhow::Result<HealthReport> {
        probe(url, self.config.probe_timeout).await
    }
}

/// HTTP liveness probe. Any error or non-2xx answer means unavailable.
pub async fn probe(url: &str, timeout: Duration) -> anyhow::Result<HealthReport> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let resp = client.get(url).send().await?;
    if !resp.status().is_success() {
        anyhow::bail!("unhealthy status: {}", resp.status());
    }
    Ok(resp.json::<HealthReport>().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::link::{LinkEvent, MemoryNetwork};

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(NodeId::new("A"), HealthMonitorConfig::default())
    }

    #[test]
    fn test_standalone_node_is_up() {
        let report = monitor().health();
        assert_eq!(report.status, HealthStatus::Up);
        assert_eq!(report.node_id, NodeId::new("A"));
        assert!(report.peer.is_none());
    }

    #[test]
    fn test_unseen_peer_is_degraded() {
        let m = monitor().with_peer(NodeId::new("B"), None);
        let report = m.health();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.peer.unwrap().last_seen_ms, None);
    }

    #[test]
    fn test_peer_beacon_makes_node_up() {
        let m = monitor().with_peer(NodeId::new("B"), None);
        m.observe_peer_beacon(&Beacon { node_id: NodeId::new("B"), timestamp_ms: 1 });
        assert!(m.peer_reachable());
        assert_eq!(m.health().status, HealthStatus::Up);
        assert_eq!(m.stats().peer_beacons_received, 1);
    }

    #[test]
    fn test_foreign_beacon_is_ignored() {
        let m = monitor().with_peer(NodeId::new("B"), None);
        m.observe_peer_beacon(&Beacon { node_id: NodeId::new("C"), timestamp_ms: 1 });
        assert!(!m.peer_reachable());
    }

    #[test]
    fn test_stale_beacon_times_out() {
        let m = HealthMonitor::new(
            NodeId::new("A"),
            HealthMonitorConfig::default().peer_timeout(Duration::from_millis(100)),
        )
        .with_peer(NodeId::new("B"), None);
        m.observe_peer_beacon(&Beacon { node_id: NodeId::new("B"), timestamp_ms: 1 });

        let seen = m.peer_last_seen_ms.load(Ordering::SeqCst);
        assert!(m.peer_reachable_at(seen + 100));
        assert!(!m.peer_reachable_at(seen + 101));
    }

    #[test]
    fn test_report_wire_shape() {
        let report = monitor().health();
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["status"], "up");
        assert_eq!(v["nodeId"], "A");
        assert!(v["timestampMs"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_emit_reaches_subscribers_and_peer() {
        let (_net, a, mut b) = MemoryNetwork::pair(NodeId::new("A"), NodeId::new("B"));
        let link: Arc<dyn PeerLink> = a.link;
        let m = monitor().with_peer(NodeId::new("B"), Some(link));
        let mut rx = m.subscribe();

        let sent = m.emit().await;
        assert_eq!(rx.recv().await.unwrap(), sent);

        assert_eq!(b.events.recv().await, Some(LinkEvent::Connected));
        assert_eq!(
            b.events.recv().await,
            Some(LinkEvent::Message(Message::Heartbeat(sent)))
        );
        assert_eq!(m.stats().beacons_sent, 1);
    }

    #[tokio::test]
    async fn test_beacon_loop_runs_on_interval() {
        let m = Arc::new(HealthMonitor::new(
            NodeId::new("A"),
            HealthMonitorConfig::default().interval(Duration::from_millis(20)),
        ));
        let mut rx = m.subscribe();
        let (tx, shutdown) = broadcast::channel(1);
        let handle = tokio::spawn(m.clone().start(shutdown));

        for _ in 0..3 {
            let beacon = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(beacon.node_id, NodeId::new("A"));
        }

        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
