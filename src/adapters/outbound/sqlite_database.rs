//! SQLite Database
//!
//! One SQLite file per node holds the operation log, the idempotency and
//! replication bookkeeping tables, and the latest snapshot. The adapters
//! share a single connection so an append and its bookkeeping commit in one
//! transaction.

use crate::domain::errors::StoreError;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS oplog (
    log_offset INTEGER PRIMARY KEY AUTOINCREMENT,
    op_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    item_id TEXT NOT NULL,
    borrower_id TEXT NOT NULL,
    origin TEXT NOT NULL,
    origin_node TEXT NOT NULL,
    origin_seq INTEGER NOT NULL,
    timestamp_wall INTEGER NOT NULL,
    timestamp_counter INTEGER NOT NULL,
    timestamp_node INTEGER NOT NULL,
    body BLOB NOT NULL,
    checksum INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS oplog_by_origin_seq ON oplog (origin, origin_seq);

CREATE TABLE IF NOT EXISTS applied_ops (
    op_id TEXT PRIMARY KEY,
    result TEXT NOT NULL,
    logged INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS applied_index (
    node_id TEXT PRIMARY KEY,
    seq INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS peer_acks (
    node_id TEXT PRIMARY KEY,
    seq INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    log_offset INTEGER NOT NULL,
    taken_at INTEGER NOT NULL,
    state BLOB NOT NULL,
    checksum INTEGER NOT NULL
);
";

/// Shared handle to the node's SQLite file.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
    path: String,
}

impl SqliteDatabase {
    /// Open (or create) the database file and make sure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        Self::init(&conn, true)?;
        tracing::info!("sqlite store opened, path={}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.display().to_string(),
        })
    }

    /// Volatile database, used by tests and throwaway nodes.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn, false)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: ":memory:".to_string(),
        })
    }

    fn init(conn: &Connection, wal: bool) -> Result<(), StoreError> {
        if wal {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        }
        // Appends must be on disk before the caller gets its result.
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_schema() {
        let dir = TempDir::new().unwrap();
        let db = SqliteDatabase::open(dir.path().join("node.db")).unwrap();

        let tables: Vec<String> = {
            let conn = db.conn();
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .unwrap();
            let rows = stmt.query_map([], |row| row.get(0)).unwrap();
            rows.collect::<Result<_, _>>().unwrap()
        };
        for table in ["applied_index", "applied_ops", "oplog", "peer_acks", "snapshots"] {
            assert!(tables.iter().any(|t| t == table), "missing table {}", table);
        }
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.db");
        drop(SqliteDatabase::open(&path).unwrap());
        let db = SqliteDatabase::open(&path).unwrap();
        assert!(db.path().ends_with("node.db"));
    }
}
