//! Operation Log Port
//!
//! Durable, append-only record of accepted operations together with the
//! bookkeeping needed for idempotent apply and replication resume.

use crate::domain::errors::StoreError;
use crate::domain::operation::{OperationResult, OplogEntry};
use crate::domain::value_objects::{NodeId, OpId};
use serde::Serialize;
use std::collections::VecDeque;

/// One decoded log row; corrupt rows surface as `StoreError::CorruptLogEntry`.
pub type LogRead = Result<OplogEntry, StoreError>;

/// Counters describing the log content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OplogStats {
    pub entries: u64,
    pub applied_ops: u64,
    pub first_offset: Option<u64>,
    pub last_offset: u64,
}

/// Durable operation log.
///
/// Calls are synchronous and block until the data is on disk; async callers
/// go through `spawn_blocking`.
pub trait OperationLog: Send + Sync {
    /// Persist `entry` (its `offset` is ignored) and return the assigned offset.
    ///
    /// In the same transaction the op id is marked applied with the entry's
    /// result and the applied-index of `entry.origin_node` advances to
    /// `entry.origin_seq`. Fails with `StoreError::DuplicateOperation` if the
    /// id was already recorded.
    fn append(&self, entry: &OplogEntry) -> Result<u64, StoreError>;

    fn is_applied(&self, id: &OpId) -> Result<bool, StoreError>;

    /// Result recorded for an applied operation id.
    fn result_of(&self, id: &OpId) -> Result<Option<OperationResult>, StoreError>;

    /// Record a rejected operation so a retry returns the same result.
    /// Nothing is appended to the log.
    fn record_rejection(&self, id: &OpId, result: &OperationResult) -> Result<(), StoreError>;

    /// Up to `limit` rows with offset strictly greater than `after`, in order.
    fn read_page(&self, after: u64, limit: usize) -> Result<Vec<LogRead>, StoreError>;

    /// Up to `limit` locally originated entries with `origin_seq >= from_seq`.
    fn local_entries_from(&self, from_seq: u64, limit: usize) -> Result<Vec<LogRead>, StoreError>;

    /// Offset of the first local entry with `origin_seq >= seq`, if still in the log.
    fn offset_of_local_seq(&self, seq: u64) -> Result<Option<u64>, StoreError>;

    /// Highest offset ever assigned (0 for an empty log).
    fn last_offset(&self) -> Result<u64, StoreError>;

    /// Delete every entry with offset `<= offset`. Returns the number removed.
    fn truncate_through(&self, offset: u64) -> Result<usize, StoreError>;

    /// Highest contiguous `origin_seq` ingested from `node` (0 if none).
    fn applied_index(&self, node: &NodeId) -> Result<u64, StoreError>;

    /// Advance the applied-index of `node`; never moves it backwards.
    fn record_applied_index(&self, node: &NodeId, seq: u64) -> Result<(), StoreError>;

    /// Highest local `origin_seq` the peer `node` acknowledged.
    fn peer_ack(&self, node: &NodeId) -> Result<u64, StoreError>;

    /// Advance the acknowledgement of `node`; never moves it backwards.
    fn record_peer_ack(&self, node: &NodeId, seq: u64) -> Result<(), StoreError>;

    fn stats(&self) -> Result<OplogStats, StoreError>;
}

impl dyn OperationLog {
    /// Lazy, restartable sequence of entries at or after `offset`.
    pub fn read_from(&self, offset: u64) -> OplogCursor<'_> {
        OplogCursor::new(self, offset)
    }
}

const PAGE_SIZE: usize = 256;

/// Iterator over the log, fetching one page at a time.
///
/// The cursor keeps only its position, so a fresh cursor can always be
/// created at `position() + 1` to resume after a restart.
pub struct OplogCursor<'a> {
    log: &'a dyn OperationLog,
    after: u64,
    page: VecDeque<LogRead>,
    page_size: usize,
    done: bool,
}

impl<'a> OplogCursor<'a> {
    pub fn new(log: &'a dyn OperationLog, offset: u64) -> Self {
        Self {
            log,
            after: offset.saturating_sub(1),
            page: VecDeque::new(),
            page_size: PAGE_SIZE,
            done: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Offset of the last row handed out (or skipped as corrupt).
    pub fn position(&self) -> u64 {
        self.after
    }

    fn fill(&mut self) -> Result<(), StoreError> {
        let page = self.log.read_page(self.after, self.page_size)?;
        if page.is_empty() {
            self.done = true;
        }
        self.page.extend(page);
        Ok(())
    }
}

impl Iterator for OplogCursor<'_> {
    type Item = LogRead;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.done {
            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(e));
            }
        }
        let read = self.page.pop_front()?;
        match &read {
            Ok(entry) => self.after = entry.offset,
            Err(StoreError::CorruptLogEntry { offset, .. }) => self.after = *offset,
            Err(_) => {}
        }
        Some(read)
    }
}
