//! SQLite Operation Log
//!
//! Implements OperationLog on top of the node's SQLite file. Each row keeps
//! the searchable fields (id, kind, origin, timestamp) in columns and the full
//! entry as a bincode body guarded by a CRC32 checksum.

use super::sqlite_database::SqliteDatabase;
use crate::domain::errors::StoreError;
use crate::domain::operation::{OperationResult, OplogEntry, Origin};
use crate::domain::ports::{LogRead, OperationLog, OplogStats};
use crate::domain::value_objects::{NodeId, OpId};
use rusqlite::{params, OptionalExtension, Row};

/// SQLite-backed operation log.
#[derive(Clone)]
pub struct SqliteOperationLog {
    db: SqliteDatabase,
}

impl SqliteOperationLog {
    pub fn new(db: SqliteDatabase) -> Self {
        Self { db }
    }

    /// Decode a `(log_offset, body, checksum)` row.
    fn row_to_entry(row: &Row) -> rusqlite::Result<LogRead> {
        let offset = row.get::<_, i64>(0)? as u64;
        let body: Vec<u8> = row.get(1)?;
        let checksum = row.get::<_, i64>(2)? as u32;

        let mut entry: OplogEntry = match bincode::deserialize(&body) {
            Ok(entry) => entry,
            Err(e) => {
                return Ok(Err(StoreError::CorruptLogEntry {
                    offset,
                    reason: format!("undecodable body: {}", e),
                }))
            }
        };
        if entry.checksum() != checksum {
            return Ok(Err(StoreError::CorruptLogEntry {
                offset,
                reason: "checksum mismatch".to_string(),
            }));
        }
        entry.offset = offset;
        Ok(Ok(entry))
    }

    fn upsert_max(
        conn: &rusqlite::Connection,
        table: &str,
        node: &NodeId,
        seq: u64,
    ) -> Result<(), StoreError> {
        conn.execute(
            &format!(
                "INSERT INTO {table} (node_id, seq) VALUES (?1, ?2)
                 ON CONFLICT(node_id) DO UPDATE SET seq = MAX(seq, excluded.seq)"
            ),
            params![node.as_str(), seq as i64],
        )?;
        Ok(())
    }

    fn get_seq(&self, table: &str, node: &NodeId) -> Result<u64, StoreError> {
        let conn = self.db.conn();
        let seq: Option<i64> = conn
            .query_row(
                &format!("SELECT seq FROM {table} WHERE node_id = ?1"),
                [node.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seq.unwrap_or(0) as u64)
    }
}

impl OperationLog for SqliteOperationLog {
    fn append(&self, entry: &OplogEntry) -> Result<u64, StoreError> {
        let stored = OplogEntry {
            offset: 0,
            ..entry.clone()
        };
        let body = bincode::serialize(&stored)?;
        let result = serde_json::to_string(&entry.result)?;

        let mut conn = self.db.conn();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO applied_ops (op_id, result, logged) VALUES (?1, ?2, 1)",
            params![entry.op.id.as_str(), result],
        )?;
        if inserted == 0 {
            return Err(StoreError::DuplicateOperation(entry.op.id.clone()));
        }

        tx.execute(
            "INSERT INTO oplog (op_id, kind, item_id, borrower_id, origin, origin_node, origin_seq,
                                timestamp_wall, timestamp_counter, timestamp_node, body, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                entry.op.id.as_str(),
                entry.op.kind.name(),
                entry.op.item_id.as_str(),
                entry.op.borrower_id.as_str(),
                entry.origin.as_str(),
                entry.origin_node.as_str(),
                entry.origin_seq as i64,
                entry.op.timestamp.wall_time as i64,
                entry.op.timestamp.counter as i64,
                entry.op.timestamp.node_hash as i64,
                body,
                stored.checksum() as i64,
            ],
        )?;
        let offset = tx.last_insert_rowid() as u64;

        Self::upsert_max(&tx, "applied_index", &entry.origin_node, entry.origin_seq)?;
        tx.commit()?;

        tracing::debug!(
            "oplog append offset={} op={} kind={} origin={}",
            offset,
            entry.op.id,
            entry.op.kind.name(),
            entry.origin.as_str()
        );
        Ok(offset)
    }

    fn is_applied(&self, id: &OpId) -> Result<bool, StoreError> {
        let conn = self.db.conn();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM applied_ops WHERE op_id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn result_of(&self, id: &OpId) -> Result<Option<OperationResult>, StoreError> {
        let conn = self.db.conn();
        let raw: Option<String> = conn
            .query_row(
                "SELECT result FROM applied_ops WHERE op_id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn record_rejection(&self, id: &OpId, result: &OperationResult) -> Result<(), StoreError> {
        let raw = serde_json::to_string(result)?;
        let conn = self.db.conn();
        conn.execute(
            "INSERT OR IGNORE INTO applied_ops (op_id, result, logged) VALUES (?1, ?2, 0)",
            params![id.as_str(), raw],
        )?;
        Ok(())
    }

    fn read_page(&self, after: u64, limit: usize) -> Result<Vec<LogRead>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT log_offset, body, checksum FROM oplog
             WHERE log_offset > ?1 ORDER BY log_offset LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after as i64, limit as i64], |row| {
            Self::row_to_entry(row)
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn local_entries_from(&self, from_seq: u64, limit: usize) -> Result<Vec<LogRead>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT log_offset, body, checksum FROM oplog
             WHERE origin = ?1 AND origin_seq >= ?2 ORDER BY origin_seq LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![Origin::Local.as_str(), from_seq as i64, limit as i64],
            |row| Self::row_to_entry(row),
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn offset_of_local_seq(&self, seq: u64) -> Result<Option<u64>, StoreError> {
        let conn = self.db.conn();
        let offset: Option<i64> = conn
            .query_row(
                "SELECT MIN(log_offset) FROM oplog WHERE origin = ?1 AND origin_seq >= ?2",
                params![Origin::Local.as_str(), seq as i64],
                |row| row.get(0),
            )?;
        Ok(offset.map(|o| o as u64))
    }

    fn last_offset(&self) -> Result<u64, StoreError> {
        let conn = self.db.conn();
        // sqlite_sequence keeps the high-water mark even after truncation.
        let seq: Option<i64> = conn
            .query_row(
                "SELECT seq FROM sqlite_sequence WHERE name = 'oplog'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seq.unwrap_or(0) as u64)
    }

    fn truncate_through(&self, offset: u64) -> Result<usize, StoreError> {
        let conn = self.db.conn();
        let removed = conn.execute(
            "DELETE FROM oplog WHERE log_offset <= ?1",
            [offset as i64],
        )?;
        if removed > 0 {
            tracing::info!("oplog truncated through offset {} ({} entries)", offset, removed);
        }
        Ok(removed)
    }

    fn applied_index(&self, node: &NodeId) -> Result<u64, StoreError> {
        self.get_seq("applied_index", node)
    }

    fn record_applied_index(&self, node: &NodeId, seq: u64) -> Result<(), StoreError> {
        let conn = self.db.conn();
        Self::upsert_max(&conn, "applied_index", node, seq)
    }

    fn peer_ack(&self, node: &NodeId) -> Result<u64, StoreError> {
        self.get_seq("peer_acks", node)
    }

    fn record_peer_ack(&self, node: &NodeId, seq: u64) -> Result<(), StoreError> {
        let conn = self.db.conn();
        Self::upsert_max(&conn, "peer_acks", node, seq)
    }

    fn stats(&self) -> Result<OplogStats, StoreError> {
        let (entries, first) = {
            let conn = self.db.conn();
            let (entries, first): (i64, Option<i64>) = conn.query_row(
                "SELECT COUNT(*), MIN(log_offset) FROM oplog",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            (entries, first)
        };
        let applied_ops: i64 = {
            let conn = self.db.conn();
            conn.query_row("SELECT COUNT(*) FROM applied_ops", [], |row| row.get(0))?
        };
        Ok(OplogStats {
            entries: entries as u64,
            applied_ops: applied_ops as u64,
            first_offset: first.map(|o| o as u64),
            last_offset: self.last_offset()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::operation::{OperationRequest, OplogEntry};
    use crate::domain::value_objects::HLCTimestamp;
    use tempfile::TempDir;

    fn entry(id: &str, origin: Origin, node: &str, seq: u64) -> OplogEntry {
        let node = NodeId::new(node);
        OplogEntry {
            offset: 0,
            op: OperationRequest::loan(id, "B1", "u1")
                .into_operation(HLCTimestamp::at(1_000 + seq, &node))
                .unwrap(),
            result: OperationResult::accepted(None),
            origin,
            origin_node: node,
            origin_seq: seq,
        }
    }

    fn log() -> SqliteOperationLog {
        SqliteOperationLog::new(SqliteDatabase::open_in_memory().unwrap())
    }

    #[test]
    fn test_append_assigns_increasing_offsets() {
        let log = log();
        let a = log.append(&entry("op-1", Origin::Local, "A", 1)).unwrap();
        let b = log.append(&entry("op-2", Origin::Local, "A", 2)).unwrap();
        assert!(b > a);
        assert_eq!(log.last_offset().unwrap(), b);
        assert_eq!(log.applied_index(&NodeId::new("A")).unwrap(), 2);
    }

    #[test]
    fn test_duplicate_append_is_rejected_and_not_logged() {
        let log = log();
        log.append(&entry("op-1", Origin::Local, "A", 1)).unwrap();
        let dup = log.append(&entry("op-1", Origin::Remote, "B", 1));
        assert!(matches!(dup, Err(StoreError::DuplicateOperation(_))));
        assert_eq!(log.stats().unwrap().entries, 1);
        assert_eq!(log.applied_index(&NodeId::new("B")).unwrap(), 0);
    }

    #[test]
    fn test_result_of_and_rejections() {
        let log = log();
        log.append(&entry("op-1", Origin::Local, "A", 1)).unwrap();
        assert!(log.is_applied(&OpId::new("op-1")).unwrap());
        assert_eq!(
            log.result_of(&OpId::new("op-1")).unwrap(),
            Some(OperationResult::accepted(None))
        );

        let rejected = OperationResult {
            ok: false,
            reason: Some("NotAvailable".into()),
            due_date: None,
        };
        log.record_rejection(&OpId::new("op-2"), &rejected).unwrap();
        assert_eq!(log.result_of(&OpId::new("op-2")).unwrap(), Some(rejected));
        assert_eq!(log.result_of(&OpId::new("op-3")).unwrap(), None);

        let stats = log.stats().unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.applied_ops, 2);
    }

    #[test]
    fn test_read_page_and_local_entries() {
        let log = log();
        log.append(&entry("a1", Origin::Local, "A", 1)).unwrap();
        log.append(&entry("b1", Origin::Remote, "B", 1)).unwrap();
        log.append(&entry("a2", Origin::Local, "A", 2)).unwrap();

        let page = log.read_page(1, 10).unwrap();
        let ids: Vec<String> = page.into_iter().map(|r| r.unwrap().op.id.0).collect();
        assert_eq!(ids, vec!["b1", "a2"]);

        let local = log.local_entries_from(2, 10).unwrap();
        assert_eq!(local.len(), 1);
        let a2 = local.into_iter().next().unwrap().unwrap();
        assert_eq!(a2.origin_seq, 2);
        assert_eq!(a2.offset, 3);

        assert_eq!(log.offset_of_local_seq(2).unwrap(), Some(3));
        assert_eq!(log.offset_of_local_seq(3).unwrap(), None);
    }

    #[test]
    fn test_truncate_keeps_offsets_and_idempotency() {
        let log = log();
        for i in 1..=4 {
            log.append(&entry(&format!("op-{}", i), Origin::Local, "A", i)).unwrap();
        }
        assert_eq!(log.truncate_through(2).unwrap(), 2);

        let stats = log.stats().unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.first_offset, Some(3));
        assert_eq!(stats.last_offset, 4);
        assert!(log.is_applied(&OpId::new("op-1")).unwrap());

        let next = log.append(&entry("op-5", Origin::Local, "A", 5)).unwrap();
        assert_eq!(next, 5);
    }

    #[test]
    fn test_corrupt_row_is_reported_with_offset() {
        let log = log();
        log.append(&entry("op-1", Origin::Local, "A", 1)).unwrap();
        log.append(&entry("op-2", Origin::Local, "A", 2)).unwrap();
        log.db
            .conn()
            .execute("UPDATE oplog SET checksum = checksum + 1 WHERE log_offset = 1", [])
            .unwrap();

        let page = log.read_page(0, 10).unwrap();
        assert!(matches!(page[0], Err(StoreError::CorruptLogEntry { offset: 1, .. })));
        assert_eq!(page[1].as_ref().unwrap().op.id.as_str(), "op-2");
    }

    #[test]
    fn test_indexes_never_move_backwards() {
        let log = log();
        let peer = NodeId::new("B");
        log.record_peer_ack(&peer, 7).unwrap();
        log.record_peer_ack(&peer, 3).unwrap();
        assert_eq!(log.peer_ack(&peer).unwrap(), 7);

        log.record_applied_index(&peer, 4).unwrap();
        log.record_applied_index(&peer, 2).unwrap();
        assert_eq!(log.applied_index(&peer).unwrap(), 4);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.db");
        {
            let log = SqliteOperationLog::new(SqliteDatabase::open(&path).unwrap());
            log.append(&entry("op-1", Origin::Local, "A", 1)).unwrap();
            log.record_peer_ack(&NodeId::new("B"), 1).unwrap();
        }
        let log = SqliteOperationLog::new(SqliteDatabase::open(&path).unwrap());
        assert!(log.is_applied(&OpId::new("op-1")).unwrap());
        assert_eq!(log.peer_ack(&NodeId::new("B")).unwrap(), 1);
        assert_eq!(log.last_offset().unwrap(), 1);
    }
}
