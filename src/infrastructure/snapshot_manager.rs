//! Snapshot Manager
//!
//! Checkpoints the catalog every N accepted local operations and truncates
//! the log behind the oldest retained checkpoint, never past entries the peer
//! has not yet acknowledged.

use crate::application::LendingNode;
use crate::domain::errors::StoreError;
use crate::domain::value_objects::NodeId;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Outcome of one snapshot run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotReport {
    pub snapshot_id: i64,
    pub offset: u64,
    /// Highest offset removed from the log (0 if none)
    pub truncated_through: u64,
    pub removed: usize,
}

pub struct SnapshotManager {
    node: Arc<LendingNode>,
    /// Peer whose acknowledgements bound truncation; `None` when standalone
    peer: Option<NodeId>,
}

impl SnapshotManager {
    pub fn new(node: Arc<LendingNode>, peer: Option<NodeId>) -> Self {
        Self { node, peer }
    }

    /// Take a snapshot now and truncate what it makes redundant.
    pub fn run_once(&self) -> Result<SnapshotReport, StoreError> {
        let snapshot = self.node.freeze()?;
        let snapshot_id = self.node.snapshot_store().save(&snapshot)?;

        let retained = self
            .node
            .snapshot_store()
            .oldest_retained_offset()?
            .unwrap_or(0);
        let floor = self.truncation_floor(retained)?;
        let removed = if floor > 0 {
            self.node.oplog().truncate_through(floor)?
        } else {
            0
        };

        tracing::info!(
            "snapshot {} at offset {}, log truncated through {} ({} removed)",
            snapshot_id,
            snapshot.offset,
            floor,
            removed
        );
        Ok(SnapshotReport {
            snapshot_id,
            offset: snapshot.offset,
            truncated_through: floor,
            removed,
        })
    }

    /// Highest offset that every retained snapshot covers and that is no
    /// longer needed for shipping to the peer.
    pub fn truncation_floor(&self, retained_offset: u64) -> Result<u64, StoreError> {
        let Some(peer) = &self.peer else {
            return Ok(retained_offset);
        };
        let oplog = self.node.oplog();
        let acked = oplog.peer_ack(peer)?;
        let floor = match oplog.offset_of_local_seq(acked + 1)? {
            Some(first_unacked) => retained_offset.min(first_unacked - 1),
            None => retained_offset,
        };
        Ok(floor)
    }

    /// Run a snapshot each time the node reports the threshold was reached.
    pub async fn start(self, mut shutdown: broadcast::Receiver<()>) {
        let due = self.node.snapshot_due();
        let manager = Arc::new(self);
        loop {
            tokio::select! {
                _ = due.notified() => {
                    let m = manager.clone();
                    match tokio::task::spawn_blocking(move || m.run_once()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => tracing::error!("snapshot failed: {}", e),
                        Err(e) => tracing::error!("snapshot task panicked: {:?}", e),
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("snapshot manager stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::{SqliteDatabase, SqliteOperationLog, SqliteSnapshotStore};
    use crate::domain::entities::Item;
    use crate::domain::operation::OperationRequest;

    fn node(id: &str) -> Arc<LendingNode> {
        let db = SqliteDatabase::open_in_memory().unwrap();
        let node = LendingNode::open(
            NodeId::new(id),
            Arc::new(SqliteOperationLog::new(db.clone())),
            Arc::new(SqliteSnapshotStore::new(db)),
        )
        .unwrap();
        node.seed((1..=4).map(|i| Item::new(format!("B{}", i), "title")))
            .unwrap();
        Arc::new(node)
    }

    fn lend(node: &LendingNode, n: usize) {
        for i in 1..=n {
            let res = node
                .apply(OperationRequest::loan(format!("op-{}", i), format!("B{}", i), "u1"))
                .unwrap();
            assert!(res.ok);
        }
    }

    #[test]
    fn test_standalone_truncates_to_previous_snapshot() {
        let node = node("A");
        lend(&node, 3);
        let manager = SnapshotManager::new(node.clone(), None);

        // The seed snapshot at offset 0 is still the fallback.
        let first = manager.run_once().unwrap();
        assert_eq!(first.offset, 3);
        assert_eq!(first.truncated_through, 0);
        assert_eq!(node.oplog().stats().unwrap().entries, 3);

        node.apply(OperationRequest::return_item("r-1", "B1", "u1")).unwrap();
        let second = manager.run_once().unwrap();
        assert_eq!(second.offset, 4);
        assert_eq!(second.truncated_through, 3);
        assert_eq!(node.oplog().stats().unwrap().entries, 1);
        assert_eq!(node.snapshot_store().latest().unwrap().unwrap().offset, 4);
    }

    #[test]
    fn test_recovery_falls_back_when_newest_snapshot_is_corrupt() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        let open = || {
            LendingNode::open(
                NodeId::new("A"),
                Arc::new(SqliteOperationLog::new(db.clone())),
                Arc::new(SqliteSnapshotStore::new(db.clone())),
            )
            .unwrap()
        };
        let node = Arc::new(open());
        node.seed((1..=4).map(|i| Item::new(format!("B{}", i), "title")))
            .unwrap();
        let manager = SnapshotManager::new(node.clone(), None);
        lend(&node, 2);
        manager.run_once().unwrap();
        node.apply(OperationRequest::return_item("r-1", "B1", "u1")).unwrap();
        let newest = manager.run_once().unwrap();
        let expected = node.state();

        db.conn()
            .execute(
                "UPDATE snapshots SET state = x'00' WHERE id = ?1",
                [newest.snapshot_id],
            )
            .unwrap();

        let reopened = open();
        assert_eq!(reopened.state(), expected);
    }

    #[test]
    fn test_unacked_entries_are_kept() {
        let node = node("A");
        lend(&node, 4);
        let peer = NodeId::new("B");
        node.oplog().record_peer_ack(&peer, 2).unwrap();
        let manager = SnapshotManager::new(node.clone(), Some(peer));
        manager.run_once().unwrap();

        let report = manager.run_once().unwrap();
        assert_eq!(report.offset, 4);
        assert_eq!(report.truncated_through, 2);

        let remaining: Vec<u64> = node
            .oplog()
            .local_entries_from(1, 10)
            .unwrap()
            .into_iter()
            .map(|r| r.unwrap().origin_seq)
            .collect();
        assert_eq!(remaining, vec![3, 4]);
    }

    #[test]
    fn test_nothing_acked_truncates_nothing() {
        let node = node("A");
        lend(&node, 2);
        let manager = SnapshotManager::new(node.clone(), Some(NodeId::new("B")));

        let report = manager.run_once().unwrap();
        assert_eq!(report.truncated_through, 0);
        assert_eq!(report.removed, 0);
        assert_eq!(node.oplog().stats().unwrap().entries, 2);
    }

    #[tokio::test]
    async fn test_background_loop_reacts_to_threshold() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        let node = LendingNode::open(
            NodeId::new("A"),
            Arc::new(SqliteOperationLog::new(db.clone())),
            Arc::new(SqliteSnapshotStore::new(db)),
        )
        .unwrap()
        .with_snapshot_every(2);
        node.seed((1..=4).map(|i| Item::new(format!("B{}", i), "title")))
            .unwrap();
        let node = Arc::new(node);

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(SnapshotManager::new(node.clone(), None).start(rx));

        lend(&node, 2);
        for _ in 0..50 {
            if node.stats().snapshots > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(node.stats().snapshots, 1);

        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
