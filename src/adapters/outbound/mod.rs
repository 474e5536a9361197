mod sqlite_database;
mod sqlite_operation_log;
mod sqlite_snapshot_store;

pub use sqlite_database::SqliteDatabase;
pub use sqlite_operation_log::SqliteOperationLog;
pub use sqlite_snapshot_store::SqliteSnapshotStore;
