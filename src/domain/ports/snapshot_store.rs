//! Snapshot Store Port

use crate::domain::entities::{CatalogState, ItemHistory};
use crate::domain::errors::StoreError;
use serde::{Deserialize, Serialize};

/// Point-in-time copy of the catalog plus the log offset it reflects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Every log entry with offset `<= offset` is contained in `state`
    pub offset: u64,
    pub state: CatalogState,
    /// Operations that may still be reordered, per item
    pub history: Vec<ItemHistory>,
    pub taken_at_ms: u64,
}

/// Storage for snapshots.
///
/// The previous snapshot is retained next to the newest so recovery can fall
/// back to it; the log must therefore be kept from the oldest retained offset.
pub trait SnapshotStore: Send + Sync {
    /// Persist a new snapshot, pruning all but the retained ones. Returns its id.
    fn save(&self, snapshot: &Snapshot) -> Result<i64, StoreError>;

    /// Newest snapshot that verifies; corrupt newer ones are skipped.
    fn latest(&self) -> Result<Option<Snapshot>, StoreError>;

    /// Offset of the oldest retained snapshot.
    fn oldest_retained_offset(&self) -> Result<Option<u64>, StoreError>;
}
