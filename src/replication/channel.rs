//! Replication Channel
//!
//! Ships newly appended local log entries to the peer and ingests the peer's
//! entries through the node's idempotent apply path.
//!
//! Outbound is pull-based: the channel reads local entries from the log
//! starting after the last one sent, so anything not yet acknowledged is
//! simply read and sent again after a failure, a reconnect or a restart.
//! Entries received from the peer are stored with origin `Remote` and are
//! never read by the outbound path.

use crate::application::{Ingest, LendingNode};
use crate::domain::errors::StoreError;
use crate::domain::operation::OplogEntry;
use crate::domain::value_objects::NodeId;
use crate::infrastructure::health_monitor::HealthMonitor;
use crate::replication::config::ReplicationConfig;
use crate::replication::link::{LinkEvent, PeerLink};
use crate::replication::types::{EntryBatch, Message};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};

/// Out-of-order entries kept while waiting for a gap to fill.
const MAX_PENDING: usize = 10_000;

/// Progress of shipping local entries to the peer.
#[derive(Debug, Clone)]
pub struct OutboundState {
    /// Highest local `origin_seq` handed to the link
    pub last_sent: u64,
    /// Highest local `origin_seq` the peer acknowledged
    pub last_acked: u64,
    pub connected: bool,
    /// Delay before the next attempt after a failure
    pub backoff: Duration,
    pub retry_at: Option<Instant>,
    /// Last time something was sent or acknowledged
    pub last_progress: Instant,
}

/// Progress of ingesting the peer's entries.
#[derive(Debug, Clone, Default)]
pub struct InboundState {
    /// Highest contiguous peer `origin_seq` ingested
    pub applied_seq: u64,
    pub pending: BTreeMap<u64, OplogEntry>,
}

#[derive(Debug, Default)]
struct ChannelCounters {
    sent: AtomicU64,
    send_failures: AtomicU64,
    received: AtomicU64,
    applied: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    bad_batches: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStats {
    pub peer_id: String,
    pub connected: bool,
    pub last_sent: u64,
    pub last_acked: u64,
    pub applied_seq: u64,
    pub pending: usize,
    pub sent: u64,
    pub send_failures: u64,
    pub received: u64,
    pub applied: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub bad_batches: u64,
}

/// Bidirectional replication with the single peer site.
pub struct ReplicationChannel {
    node: Arc<LendingNode>,
    link: Arc<dyn PeerLink>,
    peer_id: NodeId,
    config: ReplicationConfig,
    health: Option<Arc<HealthMonitor>>,
    outbound: Mutex<OutboundState>,
    inbound: Mutex<InboundState>,
    counters: ChannelCounters,
}

impl ReplicationChannel {
    /// Resume from the persisted acknowledgement and applied-index.
    pub fn new(
        node: Arc<LendingNode>,
        link: Arc<dyn PeerLink>,
        config: ReplicationConfig,
    ) -> Result<Self, StoreError> {
        let peer_id = link.peer_id().clone();
        let last_acked = node.oplog().peer_ack(&peer_id)?;
        let applied_seq = node.oplog().applied_index(&peer_id)?;
        tracing::info!(
            "replication with {}: resuming at local seq {} / peer seq {}",
            peer_id,
            last_acked + 1,
            applied_seq + 1
        );

        Ok(Self {
            node,
            link,
            peer_id,
            outbound: Mutex::new(OutboundState {
                last_sent: last_acked,
                last_acked,
                connected: false,
                backoff: config.retry_initial,
                retry_at: None,
                last_progress: Instant::now(),
            }),
            inbound: Mutex::new(InboundState {
                applied_seq,
                pending: BTreeMap::new(),
            }),
            config,
            health: None,
            counters: ChannelCounters::default(),
        })
    }

    /// Forward heartbeats received from the peer to `health`.
    pub fn with_health(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn peer_id(&self) -> &NodeId {
        &self.peer_id
    }

    pub fn outbound_state(&self) -> OutboundState {
        self.outbound.lock().clone()
    }

    pub fn inbound_state(&self) -> InboundState {
        self.inbound.lock().clone()
    }

    /// Drive the channel until shutdown.
    ///
    /// Abandoning in-flight sends on shutdown loses nothing: unacknowledged
    /// entries are read from the log again on the next start.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<LinkEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let appended = self.node.appended();
        let mut ticker = tokio::time::interval(self.config.retry_initial);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.request_resync().await;
        self.ship().await;

        loop {
            tokio::select! {
                _ = appended.notified() => {
                    self.ship().await;
                }
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            tracing::warn!("link event stream closed, stopping replication");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.on_tick().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("replication channel stopping");
                    break;
                }
            }
        }
    }

    /// Handle one inbound link event.
    pub async fn handle_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => {
                tracing::info!("peer {} connected", self.peer_id);
                {
                    let mut out = self.outbound.lock();
                    out.connected = true;
                    out.backoff = self.config.retry_initial;
                    out.retry_at = None;
                    out.last_sent = out.last_acked;
                }
                self.request_resync().await;
                self.ship().await;
            }
            LinkEvent::Disconnected => {
                tracing::warn!("peer {} disconnected", self.peer_id);
                let mut out = self.outbound.lock();
                out.connected = false;
                out.last_sent = out.last_acked;
            }
            LinkEvent::Message(message) => self.handle_message(message).await,
        }
    }

    async fn handle_message(&self, message: Message) {
        tracing::debug!("received {} from {}", message.type_name(), self.peer_id);
        match message {
            Message::Entries(batch) => self.receive_batch(batch).await,
            Message::SyncRequest { from_seq } => {
                // The peer holds everything before `from_seq`.
                let acked = from_seq.saturating_sub(1);
                self.record_ack(acked).await;
                {
                    let mut out = self.outbound.lock();
                    out.last_sent = out.last_acked.max(acked);
                    out.retry_at = None;
                }
                self.ship().await;
            }
            Message::Ack { source, seq } => {
                if &source == self.node.node_id() {
                    self.record_ack(seq).await;
                }
            }
            Message::Heartbeat(beacon) => {
                if let Some(health) = &self.health {
                    health.observe_peer_beacon(&beacon);
                }
            }
        }
    }

    /// Ship every local entry after `last_sent`, batch by batch.
    pub async fn ship(&self) {
        loop {
            let from_seq = {
                let out = self.outbound.lock();
                if matches!(out.retry_at, Some(at) if Instant::now() < at) {
                    return;
                }
                out.last_sent + 1
            };
            if from_seq > self.node.last_local_seq() {
                return;
            }

            let node = self.node.clone();
            let limit = self.config.batch_size;
            let reads = match tokio::task::spawn_blocking(move || {
                node.oplog().local_entries_from(from_seq, limit)
            })
            .await
            {
                Ok(Ok(reads)) => reads,
                Ok(Err(e)) => {
                    tracing::error!("reading local entries from seq {}: {}", from_seq, e);
                    return;
                }
                Err(e) => {
                    tracing::error!("spawn_blocking error: {:?}", e);
                    return;
                }
            };

            let entries = contiguous_from(from_seq, reads);
            if entries.is_empty() {
                tracing::warn!("local entry seq {} missing from the log", from_seq);
                return;
            }

            let batch = EntryBatch::new(self.node.node_id().clone(), entries);
            let last = batch.last_seq().unwrap_or(from_seq);
            let count = batch.len() as u64;

            match self.link.send(&Message::Entries(batch)).await {
                Ok(()) => {
                    let mut out = self.outbound.lock();
                    out.last_sent = out.last_sent.max(last);
                    out.backoff = self.config.retry_initial;
                    out.last_progress = Instant::now();
                    self.counters.sent.fetch_add(count, Ordering::Relaxed);
                    tracing::debug!("shipped seq {}..={} to {}", from_seq, last, self.peer_id);
                }
                Err(e) => {
                    self.on_send_failure(&e);
                    return;
                }
            }
        }
    }

    fn on_send_failure(&self, err: &anyhow::Error) {
        self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
        let mut out = self.outbound.lock();
        let delay = out.backoff;
        let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
        out.retry_at = Some(Instant::now() + delay + Duration::from_millis(jitter));
        out.backoff = (delay * 2).min(self.config.retry_max);
        out.last_sent = out.last_acked;
        tracing::warn!(
            "send to {} failed: {} (retry in {:?})",
            self.peer_id,
            err,
            delay
        );
    }

    /// Periodic retry and resend of unacknowledged entries.
    async fn on_tick(&self) {
        let now = Instant::now();
        let resend = {
            let mut out = self.outbound.lock();
            if matches!(out.retry_at, Some(at) if now >= at) {
                out.retry_at = None;
            }
            let stale = out.last_sent > out.last_acked
                && now.duration_since(out.last_progress) >= self.config.ack_timeout;
            if stale {
                tracing::debug!(
                    "no ack from {} since seq {}, resending",
                    self.peer_id,
                    out.last_acked
                );
                out.last_sent = out.last_acked;
                out.last_progress = now;
            }
            out.retry_at.is_none()
        };
        if resend {
            self.ship().await;
        }
    }

    async fn request_resync(&self) {
        let from_seq = self.inbound.lock().applied_seq + 1;
        if let Err(e) = self.link.send(&Message::SyncRequest { from_seq }).await {
            tracing::debug!("sync request to {} failed: {}", self.peer_id, e);
        }
    }

    async fn record_ack(&self, seq: u64) {
        let advanced = {
            let mut out = self.outbound.lock();
            if seq > out.last_acked {
                out.last_acked = seq;
                out.last_sent = out.last_sent.max(seq);
                out.last_progress = Instant::now();
                true
            } else {
                false
            }
        };
        if !advanced {
            return;
        }
        let node = self.node.clone();
        let peer = self.peer_id.clone();
        match tokio::task::spawn_blocking(move || node.oplog().record_peer_ack(&peer, seq)).await {
            Ok(Ok(())) => tracing::debug!("peer {} acknowledged seq {}", self.peer_id, seq),
            Ok(Err(e)) => tracing::error!("persisting ack {}: {}", seq, e),
            Err(e) => tracing::error!("spawn_blocking error: {:?}", e),
        }
    }

    /// Ingest a batch from the peer in `origin_seq` order, then acknowledge.
    pub async fn receive_batch(&self, batch: EntryBatch) {
        if !batch.verify() {
            self.counters.bad_batches.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("dropping batch from {} with bad checksum", batch.source);
            return;
        }
        if batch.source != self.peer_id {
            self.counters.bad_batches.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("dropping batch from unexpected node {}", batch.source);
            return;
        }
        self.counters
            .received
            .fetch_add(batch.len() as u64, Ordering::Relaxed);

        {
            let mut inbound = self.inbound.lock();
            for entry in batch.entries {
                if entry.origin_seq <= inbound.applied_seq {
                    self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                if inbound.pending.len() >= MAX_PENDING {
                    tracing::warn!("inbound buffer full, dropping seq {}", entry.origin_seq);
                    break;
                }
                inbound.pending.insert(entry.origin_seq, entry);
            }
        }

        let applied_seq = self.drain_pending().await;
        if let Err(e) = self
            .link
            .send(&Message::Ack {
                source: self.peer_id.clone(),
                seq: applied_seq,
            })
            .await
        {
            tracing::debug!("ack to {} failed: {}", self.peer_id, e);
        }
    }

    /// Apply buffered entries while they are contiguous. Returns the new applied seq.
    async fn drain_pending(&self) -> u64 {
        loop {
            let next = {
                let mut inbound = self.inbound.lock();
                let want = inbound.applied_seq + 1;
                match inbound.pending.remove(&want) {
                    Some(entry) => entry,
                    None => return inbound.applied_seq,
                }
            };

            let node = self.node.clone();
            let entry = next.clone();
            let outcome = tokio::task::spawn_blocking(move || node.ingest(&entry)).await;
            match outcome {
                Ok(Ok(result)) => {
                    match result {
                        Ingest::Applied(_) => self.counters.applied.fetch_add(1, Ordering::Relaxed),
                        Ingest::Duplicate => self.counters.duplicates.fetch_add(1, Ordering::Relaxed),
                        Ingest::Rejected(_) => self.counters.rejected.fetch_add(1, Ordering::Relaxed),
                    };
                    self.inbound.lock().applied_seq = next.origin_seq;
                }
                Ok(Err(e)) => {
                    tracing::error!("ingesting seq {} from {}: {}", next.origin_seq, self.peer_id, e);
                    self.inbound.lock().pending.insert(next.origin_seq, next);
                    return self.inbound.lock().applied_seq;
                }
                Err(e) => {
                    tracing::error!("spawn_blocking error: {:?}", e);
                    self.inbound.lock().pending.insert(next.origin_seq, next);
                    return self.inbound.lock().applied_seq;
                }
            }
        }
    }

    pub fn stats(&self) -> ChannelStats {
        let out = self.outbound.lock().clone();
        let (applied_seq, pending) = {
            let inbound = self.inbound.lock();
            (inbound.applied_seq, inbound.pending.len())
        };
        let c = &self.counters;
        ChannelStats {
            peer_id: self.peer_id.to_string(),
            connected: out.connected,
            last_sent: out.last_sent,
            last_acked: out.last_acked,
            applied_seq,
            pending,
            sent: c.sent.load(Ordering::Relaxed),
            send_failures: c.send_failures.load(Ordering::Relaxed),
            received: c.received.load(Ordering::Relaxed),
            applied: c.applied.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            bad_batches: c.bad_batches.load(Ordering::Relaxed),
        }
    }
}

/// Keep the decodable prefix of `reads` whose seqs run `from_seq, from_seq + 1, ...`.
fn contiguous_from(from_seq: u64, reads: Vec<Result<OplogEntry, StoreError>>) -> Vec<OplogEntry> {
    let mut expected = from_seq;
    let mut entries = Vec::new();
    for read in reads {
        match read {
            Ok(entry) if entry.origin_seq == expected => {
                expected += 1;
                entries.push(entry);
            }
            Ok(entry) => {
                tracing::warn!(
                    "gap in local log: expected seq {}, found {}",
                    expected,
                    entry.origin_seq
                );
                break;
            }
            Err(e) => {
                tracing::warn!("cannot ship corrupt entry: {}", e);
                break;
            }
        }
    }
    entries
}
