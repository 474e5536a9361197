//! SQLite Snapshot Store

use super::sqlite_database::SqliteDatabase;
use crate::domain::entities::{CatalogState, ItemHistory};
use crate::domain::errors::StoreError;
use crate::domain::ports::{Snapshot, SnapshotStore};
use rusqlite::{params, OptionalExtension};

/// Snapshots kept in the table: the newest and the one before it.
pub const SNAPSHOTS_RETAINED: i64 = 2;

/// Keeps the latest snapshots in the `snapshots` table of the node database.
#[derive(Clone)]
pub struct SqliteSnapshotStore {
    db: SqliteDatabase,
}

impl SqliteSnapshotStore {
    pub fn new(db: SqliteDatabase) -> Self {
        Self { db }
    }

    fn decode(id: i64, blob: &[u8], checksum: i64) -> Result<(CatalogState, Vec<ItemHistory>), StoreError> {
        if crc32fast::hash(blob) != checksum as u32 {
            return Err(StoreError::CorruptSnapshot {
                id,
                reason: "checksum mismatch".to_string(),
            });
        }
        bincode::deserialize(blob).map_err(|e| StoreError::CorruptSnapshot {
            id,
            reason: e.to_string(),
        })
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn save(&self, snapshot: &Snapshot) -> Result<i64, StoreError> {
        let body = bincode::serialize(&(&snapshot.state, &snapshot.history))?;
        let checksum = crc32fast::hash(&body);

        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO snapshots (log_offset, taken_at, state, checksum) VALUES (?1, ?2, ?3, ?4)",
            params![
                snapshot.offset as i64,
                snapshot.taken_at_ms as i64,
                body,
                checksum as i64
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "DELETE FROM snapshots WHERE id NOT IN
             (SELECT id FROM snapshots ORDER BY id DESC LIMIT ?1)",
            [SNAPSHOTS_RETAINED],
        )?;
        tx.commit()?;

        tracing::info!(
            "snapshot {} saved at offset {} ({} items, {} loans, {} unsettled items)",
            id,
            snapshot.offset,
            snapshot.state.items.len(),
            snapshot.state.loans.len(),
            snapshot.history.len()
        );
        Ok(id)
    }

    fn latest(&self) -> Result<Option<Snapshot>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, log_offset, taken_at, state, checksum FROM snapshots ORDER BY id DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut newest_error = None;
        for (id, offset, taken_at, blob, checksum) in rows {
            match Self::decode(id, &blob, checksum) {
                Ok((state, history)) => {
                    return Ok(Some(Snapshot {
                        offset: offset as u64,
                        state,
                        history,
                        taken_at_ms: taken_at as u64,
                    }));
                }
                Err(e) => {
                    tracing::error!("{}; falling back to an older snapshot", e);
                    newest_error.get_or_insert(e);
                }
            }
        }
        match newest_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    fn oldest_retained_offset(&self) -> Result<Option<u64>, StoreError> {
        let conn = self.db.conn();
        let offset: Option<i64> = conn
            .query_row(
                "SELECT log_offset FROM snapshots ORDER BY id ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(offset.map(|o| o as u64))
    }
}
