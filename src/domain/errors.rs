//! Error types for the lending core.

use crate::domain::value_objects::{BorrowerId, ItemId, OpId};
use thiserror::Error;

/// Business-rule rejections produced by the Catalog & Loan Store.
///
/// These are returned to the caller inside an `OperationResult` with the
/// variant name as reason code; they are never retried by the core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LendingError {
    #[error("item {0} not found")]
    ItemNotFound(ItemId),

    #[error("item {0} is not available")]
    NotAvailable(ItemId),

    #[error("no active loan of item {item} for borrower {borrower}")]
    NoActiveLoan { item: ItemId, borrower: BorrowerId },

    #[error("renewal limit reached for item {0}")]
    RenewalLimitExceeded(ItemId),

    /// A replicated LOAN lost against an earlier loan of the same item.
    #[error("item {item} already lent to {held_by} by an earlier loan")]
    LoanConflict { item: ItemId, held_by: BorrowerId },
}

impl LendingError {
    /// Stable reason code carried in `OperationResult.reason`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ItemNotFound(_) => "ItemNotFound",
            Self::NotAvailable(_) => "NotAvailable",
            Self::NoActiveLoan { .. } => "NoActiveLoan",
            Self::RenewalLimitExceeded(_) => "RenewalLimitExceeded",
            Self::LoanConflict { .. } => "LoanConflict",
        }
    }
}

/// Persistence failures of the operation log and snapshot store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("encoding error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An oplog row failed its checksum or could not be decoded.
    #[error("corrupt log entry at offset {offset}: {reason}")]
    CorruptLogEntry { offset: u64, reason: String },

    #[error("corrupt snapshot {id}: {reason}")]
    CorruptSnapshot { id: i64, reason: String },

    /// The operation id is already recorded; the caller returns the stored result.
    #[error("operation {0} already applied")]
    DuplicateOperation(OpId),
}

/// Errors surfaced by the apply path of a node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
