mod operation_log;
mod snapshot_store;

pub use operation_log::{LogRead, OperationLog, OplogCursor, OplogStats};
pub use snapshot_store::{Snapshot, SnapshotStore};
