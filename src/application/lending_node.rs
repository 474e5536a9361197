//! Lending Node - the idempotent apply path
//!
//! Ties the Catalog & Loan Store to the operation log: every operation,
//! local or replicated, is checked against the applied-id index, validated,
//! durably appended and only then committed to the in-memory catalog.
//! Recovery loads the latest snapshot and replays the log tail.

use crate::domain::entities::{CatalogState, Item};
use crate::domain::errors::{LendingError, NodeError, StoreError};
use crate::domain::operation::{OperationRequest, OperationResult, OplogEntry, Origin};
use crate::domain::ports::{OperationLog, Snapshot, SnapshotStore};
use crate::domain::services::Catalog;
use crate::domain::value_objects::{now_millis, HLCTimestamp, ItemId, NodeId};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Outcome of ingesting a replicated entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingest {
    /// Applied and appended at this local offset
    Applied(u64),
    /// Already applied earlier; nothing changed
    Duplicate,
    /// Refused by the local store; recorded so redelivery is a no-op
    Rejected(LendingError),
}

/// Counters of the apply path.
#[derive(Debug, Default)]
struct NodeCounters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    duplicates: AtomicU64,
    ingested: AtomicU64,
    ingest_rejected: AtomicU64,
    ingest_duplicates: AtomicU64,
    snapshots: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub accepted: u64,
    pub rejected: u64,
    pub duplicates: u64,
    pub ingested: u64,
    pub ingest_rejected: u64,
    pub ingest_duplicates: u64,
    pub snapshots: u64,
    pub items: usize,
    pub active_loans: usize,
    pub last_local_seq: u64,
}

/// Clock and local sequence; held while a local entry is stamped and appended
/// so `origin_seq` order matches offset order.
struct Sequencer {
    clock: HLCTimestamp,
    last_seq: u64,
    /// Newest peer timestamp ingested. Peer entries arrive in their origin
    /// order and local stamps are later than anything observed, so no
    /// operation at or before it can still arrive.
    settled_through: HLCTimestamp,
}

/// A catalog item as it appears in a seed file.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedItem {
    pub id: ItemId,
    pub title: String,
    #[serde(default = "available_by_default")]
    pub available: bool,
}

fn available_by_default() -> bool {
    true
}

impl From<SeedItem> for Item {
    fn from(seed: SeedItem) -> Self {
        Item {
            id: seed.id,
            title: seed.title,
            available: seed.available,
        }
    }
}

/// Read a JSON array of `{id, title, available}` records.
pub fn load_seed_file(path: impl AsRef<Path>) -> anyhow::Result<Vec<Item>> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    let seeds: Vec<SeedItem> = serde_json::from_str(&raw)?;
    Ok(seeds.into_iter().map(Item::from).collect())
}

/// One site's storage-and-replication authority.
pub struct LendingNode {
    node_id: NodeId,
    catalog: Catalog,
    oplog: Arc<dyn OperationLog>,
    snapshots: Arc<dyn SnapshotStore>,
    item_locks: DashMap<ItemId, Arc<Mutex<()>>>,
    /// Applies hold it shared; freezing a snapshot holds it exclusively.
    gate: RwLock<()>,
    sequencer: Mutex<Sequencer>,
    appended: Arc<Notify>,
    snapshot_due: Arc<Notify>,
    snapshot_every: u64,
    since_snapshot: AtomicU64,
    counters: NodeCounters,
}

impl LendingNode {
    /// Recover a node from its log and snapshot store.
    ///
    /// Corrupt log entries are logged and skipped so the node always starts.
    pub fn open(
        node_id: NodeId,
        oplog: Arc<dyn OperationLog>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Result<Self, StoreError> {
        let (catalog, replay_from) = match snapshots.latest()? {
            Some(snapshot) => {
                tracing::info!(
                    "loaded snapshot at offset {} ({} items, {} unsettled)",
                    snapshot.offset,
                    snapshot.state.items.len(),
                    snapshot.history.len()
                );
                let catalog = Catalog::from_state(snapshot.state);
                catalog.restore_history(snapshot.history);
                (catalog, snapshot.offset + 1)
            }
            None => (Catalog::new(), 1),
        };

        let mut clock = HLCTimestamp::now(&node_id);
        let mut settled_through = HLCTimestamp::default();
        let mut replayed = 0usize;
        let mut skipped = 0usize;
        for read in oplog.read_from(replay_from) {
            match read {
                Ok(entry) => {
                    if entry.origin == Origin::Remote {
                        settled_through = settled_through.max(entry.op.timestamp);
                    }
                    replay_entry(&catalog, &entry, settled_through);
                    clock = clock.max(entry.op.timestamp);
                    replayed += 1;
                }
                Err(StoreError::CorruptLogEntry { offset, reason }) => {
                    tracing::warn!("skipping corrupt log entry at offset {}: {}", offset, reason);
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let last_seq = oplog.applied_index(&node_id)?;
        tracing::info!(
            "node {} recovered: replayed={} skipped={} items={} last_local_seq={}",
            node_id,
            replayed,
            skipped,
            catalog.len(),
            last_seq
        );

        Ok(Self {
            node_id,
            catalog,
            oplog,
            snapshots,
            item_locks: DashMap::new(),
            gate: RwLock::new(()),
            sequencer: Mutex::new(Sequencer {
                clock,
                last_seq,
                settled_through,
            }),
            appended: Arc::new(Notify::new()),
            snapshot_due: Arc::new(Notify::new()),
            snapshot_every: 0,
            since_snapshot: AtomicU64::new(0),
            counters: NodeCounters::default(),
        })
    }

    /// Signal the snapshot manager every `n` accepted local operations (0 disables).
    pub fn with_snapshot_every(mut self, n: u64) -> Self {
        self.snapshot_every = n;
        self
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn oplog(&self) -> &Arc<dyn OperationLog> {
        &self.oplog
    }

    pub fn snapshot_store(&self) -> &Arc<dyn SnapshotStore> {
        &self.snapshots
    }

    /// Notified after each local append; the replication channel waits on it.
    pub fn appended(&self) -> Arc<Notify> {
        self.appended.clone()
    }

    /// Notified when the snapshot threshold is reached.
    pub fn snapshot_due(&self) -> Arc<Notify> {
        self.snapshot_due.clone()
    }

    /// Highest `origin_seq` assigned to a local entry.
    pub fn last_local_seq(&self) -> u64 {
        self.sequencer.lock().last_seq
    }

    /// Add catalog items that are not present yet and checkpoint them.
    ///
    /// Items are not operations, so the checkpoint is what makes them part of
    /// the recoverable state. Returns the number of items added.
    pub fn seed(&self, items: impl IntoIterator<Item = Item>) -> Result<usize, StoreError> {
        let _gate = self.gate.write();
        let added = items
            .into_iter()
            .filter(|item| self.catalog.add_item(item.clone()))
            .count();
        if added > 0 {
            let snapshot = Snapshot {
                offset: self.oplog.last_offset()?,
                state: self.catalog.state(),
                history: self.catalog.history(),
                taken_at_ms: now_millis(),
            };
            self.snapshots.save(&snapshot)?;
            tracing::info!("seeded {} items", added);
        }
        Ok(added)
    }

    /// Apply a request submitted at this site.
    ///
    /// Business rejections come back as `Ok` with `ok: false`. Reapplying an
    /// id returns the stored result without touching the catalog.
    pub fn apply(&self, request: OperationRequest) -> Result<OperationResult, NodeError> {
        request.validate()?;
        let Some(lock) = self.item_lock(&request.item_id) else {
            return self.reject_unknown_item(request);
        };
        let _item = lock.lock();

        if let Some(previous) = self.oplog.result_of(&request.id)? {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("duplicate operation {}, returning stored result", request.id);
            return Ok(previous);
        }

        let _gate = self.gate.read();
        let mut seq = self.sequencer.lock();
        seq.clock = seq.clock.tick(None, &self.node_id);
        let settled_through = seq.settled_through;
        let op = request.into_operation(seq.clock)?;

        let effect = match self.catalog.plan(&op) {
            Ok(effect) => effect,
            Err(err) => {
                drop(seq);
                let result = OperationResult::rejected(&err);
                self.oplog.record_rejection(&op.id, &result)?;
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("{} {} rejected: {}", op.kind.name(), op.id, err);
                return Ok(result);
            }
        };

        let result = OperationResult::accepted(effect.due_date());
        let entry = OplogEntry {
            offset: 0,
            op,
            result: result.clone(),
            origin: Origin::Local,
            origin_node: self.node_id.clone(),
            origin_seq: seq.last_seq + 1,
        };
        let offset = match self.oplog.append(&entry) {
            Ok(offset) => offset,
            Err(StoreError::DuplicateOperation(id)) => {
                // Same id raced in on another item.
                drop(seq);
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                return Ok(self.oplog.result_of(&id)?.unwrap_or(result));
            }
            Err(e) => return Err(e.into()),
        };
        seq.last_seq = entry.origin_seq;
        drop(seq);

        if let Err(err) = self.catalog.merge(&entry.op, settled_through).outcome {
            tracing::error!("accepted {} {} did not take effect: {}", entry.op.kind.name(), entry.op.id, err);
        }
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "{} {} accepted at offset {} (seq {})",
            entry.op.kind.name(),
            entry.op.id,
            offset,
            entry.origin_seq
        );

        self.appended.notify_one();
        if self.snapshot_every > 0
            && self.since_snapshot.fetch_add(1, Ordering::Relaxed) + 1 >= self.snapshot_every
        {
            self.snapshot_due.notify_one();
        }
        Ok(result)
    }

    /// Remember the rejection of a request for an item this node does not hold.
    fn reject_unknown_item(&self, request: OperationRequest) -> Result<OperationResult, NodeError> {
        if let Some(previous) = self.oplog.result_of(&request.id)? {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(previous);
        }
        let err = LendingError::ItemNotFound(request.item_id.clone());
        let result = OperationResult::rejected(&err);
        self.oplog.record_rejection(&request.id, &result)?;
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("{:?} {} rejected: {}", request.kind, request.id, err);
        Ok(result)
    }

    /// Apply an entry received from the peer through the same idempotent path.
    ///
    /// The entry is appended with origin `Remote` and is never shipped again;
    /// it is merged into its item's history in timestamp order, so an earlier
    /// operation can take precedence over ones applied before it arrived.
    /// The applied-index of its origin node advances whatever the outcome.
    pub fn ingest(&self, entry: &OplogEntry) -> Result<Ingest, StoreError> {
        let lock = self.item_lock(&entry.op.item_id);
        let _item = lock.as_ref().map(|l| l.lock());
        let settled_through = self.observe(&entry.op.timestamp);

        if self.oplog.is_applied(&entry.op.id)? {
            self.oplog
                .record_applied_index(&entry.origin_node, entry.origin_seq)?;
            self.counters.ingest_duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(Ingest::Duplicate);
        }

        let _gate = self.gate.read();
        if lock.is_none() {
            let err = LendingError::ItemNotFound(entry.op.item_id.clone());
            tracing::warn!("replicated {} from {} rejected: {}", entry.op.id, entry.origin_node, err);
            self.oplog
                .record_rejection(&entry.op.id, &OperationResult::rejected(&err))?;
            self.oplog
                .record_applied_index(&entry.origin_node, entry.origin_seq)?;
            self.counters.ingest_rejected.fetch_add(1, Ordering::Relaxed);
            return Ok(Ingest::Rejected(err));
        }

        let offset = match self.oplog.append(&entry.as_received()) {
            Ok(offset) => offset,
            Err(StoreError::DuplicateOperation(_)) => {
                self.oplog
                    .record_applied_index(&entry.origin_node, entry.origin_seq)?;
                self.counters.ingest_duplicates.fetch_add(1, Ordering::Relaxed);
                return Ok(Ingest::Duplicate);
            }
            Err(e) => return Err(e),
        };

        let merged = self.catalog.merge(&entry.op, settled_through);
        for displaced in &merged.displaced {
            tracing::warn!(
                "{} on {} no longer takes effect: earlier {} from {} came first",
                displaced,
                entry.op.item_id,
                entry.op.id,
                entry.origin_node
            );
        }
        match merged.outcome {
            Ok(_) => {
                self.counters.ingested.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "ingested {} {} from {} seq={} at offset {}",
                    entry.op.kind.name(),
                    entry.op.id,
                    entry.origin_node,
                    entry.origin_seq,
                    offset
                );
                Ok(Ingest::Applied(offset))
            }
            Err(err) => {
                self.counters.ingest_rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "replicated {} {} from {} takes no effect: {}",
                    entry.op.kind.name(),
                    entry.op.id,
                    entry.origin_node,
                    err
                );
                Ok(Ingest::Rejected(err))
            }
        }
    }

    /// Consistent copy of the catalog and the log offset it reflects.
    ///
    /// Blocks applies for the duration of the copy only.
    pub fn freeze(&self) -> Result<Snapshot, StoreError> {
        let _gate = self.gate.write();
        let settled_through = self.sequencer.lock().settled_through;
        self.catalog.settle(settled_through);
        let snapshot = Snapshot {
            offset: self.oplog.last_offset()?,
            state: self.catalog.state(),
            history: self.catalog.history(),
            taken_at_ms: now_millis(),
        };
        self.since_snapshot.store(0, Ordering::Relaxed);
        self.counters.snapshots.fetch_add(1, Ordering::Relaxed);
        Ok(snapshot)
    }

    pub fn state(&self) -> CatalogState {
        let _gate = self.gate.write();
        self.catalog.state()
    }

    pub fn stats(&self) -> NodeStats {
        let c = &self.counters;
        NodeStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            ingested: c.ingested.load(Ordering::Relaxed),
            ingest_rejected: c.ingest_rejected.load(Ordering::Relaxed),
            ingest_duplicates: c.ingest_duplicates.load(Ordering::Relaxed),
            snapshots: c.snapshots.load(Ordering::Relaxed),
            items: self.catalog.len(),
            active_loans: self.catalog.loans().len(),
            last_local_seq: self.last_local_seq(),
        }
    }

    /// Number of per-item locks handed out so far.
    pub fn item_lock_count(&self) -> usize {
        self.item_locks.len()
    }

    /// Lock of a catalog item; `None` for ids the catalog does not hold, so
    /// unknown ids never add entries.
    fn item_lock(&self, item: &ItemId) -> Option<Arc<Mutex<()>>> {
        if let Some(lock) = self.item_locks.get(item) {
            return Some(lock.clone());
        }
        if !self.catalog.contains(item) {
            return None;
        }
        Some(self.item_locks.entry(item.clone()).or_default().clone())
    }

    /// Advance the clock past a peer timestamp; returns the settled point.
    fn observe(&self, remote: &HLCTimestamp) -> HLCTimestamp {
        let mut seq = self.sequencer.lock();
        seq.clock = seq.clock.tick(Some(remote), &self.node_id);
        seq.settled_through = seq.settled_through.max(*remote);
        seq.settled_through
    }
}

fn replay_entry(catalog: &Catalog, entry: &OplogEntry, settled_through: HLCTimestamp) {
    if entry.origin == Origin::Local && !entry.result.ok {
        return;
    }
    if let Err(err) = catalog.merge(&entry.op, settled_through).outcome {
        match entry.origin {
            Origin::Local => tracing::warn!(
                "log entry {} ({} {}) no longer applies: {}",
                entry.offset,
                entry.op.kind.name(),
                entry.op.id,
                err
            ),
            Origin::Remote => tracing::debug!(
                "replicated log entry {} ({}) takes no effect: {}",
                entry.offset,
                entry.op.id,
                err
            ),
        }
    }
}
