//! Operation records
//!
//! The request/result shapes exchanged with the dispatcher layer, and the
//! immutable operation record that is appended to the oplog and shipped to
//! the peer.

use crate::domain::errors::{LendingError, NodeError};
use crate::domain::value_objects::{BorrowerId, HLCTimestamp, ItemId, NodeId, OpId};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Operation kind as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestKind {
    Loan,
    Renew,
    Return,
}

/// Request consumed from the dispatcher layer.
///
/// ```json
/// { "id": "op-1", "itemId": "B1", "borrowerId": "u1", "kind": "RENEW", "newDueDate": "2024-03-22" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    pub id: OpId,
    pub item_id: ItemId,
    pub borrower_id: BorrowerId,
    pub kind: RequestKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_due_date: Option<NaiveDate>,
}

impl OperationRequest {
    pub fn loan(id: impl Into<OpId>, item: impl Into<ItemId>, borrower: impl Into<BorrowerId>) -> Self {
        Self {
            id: id.into(),
            item_id: item.into(),
            borrower_id: borrower.into(),
            kind: RequestKind::Loan,
            new_due_date: None,
        }
    }

    pub fn renew(
        id: impl Into<OpId>,
        item: impl Into<ItemId>,
        borrower: impl Into<BorrowerId>,
        new_due_date: NaiveDate,
    ) -> Self {
        Self {
            id: id.into(),
            item_id: item.into(),
            borrower_id: borrower.into(),
            kind: RequestKind::Renew,
            new_due_date: Some(new_due_date),
        }
    }

    pub fn return_item(
        id: impl Into<OpId>,
        item: impl Into<ItemId>,
        borrower: impl Into<BorrowerId>,
    ) -> Self {
        Self {
            id: id.into(),
            item_id: item.into(),
            borrower_id: borrower.into(),
            kind: RequestKind::Return,
            new_due_date: None,
        }
    }

    /// Check required fields without touching any state.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.id.is_empty() {
            return Err(NodeError::InvalidRequest("missing operation id".into()));
        }
        if self.item_id.is_empty() {
            return Err(NodeError::InvalidRequest("missing itemId".into()));
        }
        if self.borrower_id.is_empty() {
            return Err(NodeError::InvalidRequest("missing borrowerId".into()));
        }
        if self.kind == RequestKind::Renew && self.new_due_date.is_none() {
            return Err(NodeError::InvalidRequest("RENEW requires newDueDate".into()));
        }
        Ok(())
    }

    /// Turn a validated request into an operation stamped at `timestamp`.
    pub fn into_operation(self, timestamp: HLCTimestamp) -> Result<Operation, NodeError> {
        self.validate()?;
        let kind = match (self.kind, self.new_due_date) {
            (RequestKind::Loan, _) => OpKind::Loan,
            (RequestKind::Renew, Some(new_due_date)) => OpKind::Renew { new_due_date },
            (RequestKind::Renew, None) => {
                return Err(NodeError::InvalidRequest("RENEW requires newDueDate".into()))
            }
            (RequestKind::Return, _) => OpKind::Return,
        };
        Ok(Operation {
            id: self.id,
            item_id: self.item_id,
            borrower_id: self.borrower_id,
            kind,
            timestamp,
        })
    }
}

/// Result produced to the dispatcher layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
}

impl OperationResult {
    pub fn accepted(due_date: Option<NaiveDate>) -> Self {
        Self {
            ok: true,
            reason: None,
            due_date,
        }
    }

    pub fn rejected(err: &LendingError) -> Self {
        Self {
            ok: false,
            reason: Some(err.code().to_string()),
            due_date: None,
        }
    }
}

/// Kind of a committed operation, with its kind-specific payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Loan,
    Renew { new_due_date: NaiveDate },
    Return,
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Loan => "LOAN",
            Self::Renew { .. } => "RENEW",
            Self::Return => "RETURN",
        }
    }
}

/// An operation as applied to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    pub item_id: ItemId,
    pub borrower_id: BorrowerId,
    pub kind: OpKind,
    /// Logical time assigned when the origin node accepted the operation
    pub timestamp: HLCTimestamp,
}

/// Where a log entry was first accepted, from the point of view of the log
/// that holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// Accepted by this node; shipped to the peer
    Local,
    /// Received from the peer; never shipped again
    Remote,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "remote" => Some(Self::Remote),
            _ => None,
        }
    }
}

/// One record of the operation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OplogEntry {
    /// Position in the log that holds this entry (assigned on append)
    pub offset: u64,
    pub op: Operation,
    /// Result computed by the origin node
    pub result: OperationResult,
    pub origin: Origin,
    /// Node that first accepted the operation
    pub origin_node: NodeId,
    /// Contiguous per-origin sequence number (1, 2, 3, ...)
    pub origin_seq: u64,
}

impl OplogEntry {
    /// Checksum over the immutable content of the entry (offset excluded).
    pub fn checksum(&self) -> u32 {
        let bytes = bincode::serialize(&(
            &self.op,
            &self.result,
            self.origin,
            &self.origin_node,
            self.origin_seq,
        ))
        .unwrap_or_default();
        crc32fast::hash(&bytes)
    }

    /// The same record as the peer should store it.
    pub fn as_received(&self) -> Self {
        Self {
            offset: 0,
            origin: Origin::Remote,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_request_wire_shape() {
        let json = r#"{"id":"op-1","itemId":"B1","borrowerId":"u1","kind":"RENEW","newDueDate":"2024-03-22"}"#;
        let req: OperationRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.kind, RequestKind::Renew);
        assert_eq!(req.new_due_date, Some(date(2024, 3, 22)));

        let loan = OperationRequest::loan("op-2", "B1", "u1");
        let encoded = serde_json::to_value(&loan).unwrap();
        assert_eq!(encoded["kind"], "LOAN");
        assert!(encoded.get("newDueDate").is_none());
    }

    #[test]
    fn test_result_wire_shape() {
        let ok = OperationResult::accepted(Some(date(2024, 3, 15)));
        let v = serde_json::to_value(&ok).unwrap();
        assert_eq!(v, serde_json::json!({"ok": true, "dueDate": "2024-03-15"}));

        let rejected = OperationResult::rejected(&LendingError::RenewalLimitExceeded(ItemId::new("B1")));
        let v = serde_json::to_value(&rejected).unwrap();
        assert_eq!(v, serde_json::json!({"ok": false, "reason": "RenewalLimitExceeded"}));
    }

    #[test]
    fn test_renew_without_date_is_invalid() {
        let mut req = OperationRequest::renew("op-1", "B1", "u1", date(2024, 1, 1));
        req.new_due_date = None;
        assert!(matches!(req.validate(), Err(NodeError::InvalidRequest(_))));
    }

    #[test]
    fn test_missing_ids_are_invalid() {
        let req = OperationRequest::loan("", "B1", "u1");
        assert!(req.validate().is_err());
        let req = OperationRequest::loan("op", "", "u1");
        assert!(req.validate().is_err());
        let req = OperationRequest::loan("op", "B1", " ");
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_into_operation_carries_payload() {
        let ts = HLCTimestamp::at(10, &NodeId::new("A"));
        let op = OperationRequest::renew("op-1", "B1", "u1", date(2024, 3, 22))
            .into_operation(ts)
            .unwrap();
        assert_eq!(op.kind, OpKind::Renew { new_due_date: date(2024, 3, 22) });
        assert_eq!(op.kind.name(), "RENEW");
        assert_eq!(op.timestamp, ts);
    }

    #[test]
    fn test_origin_round_trip_names() {
        assert_eq!(Origin::parse(Origin::Local.as_str()), Some(Origin::Local));
        assert_eq!(Origin::parse(Origin::Remote.as_str()), Some(Origin::Remote));
        assert_eq!(Origin::parse("peer"), None);
    }

    #[test]
    fn test_checksum_ignores_offset_but_detects_tamper() {
        let op = OperationRequest::loan("op-1", "B1", "u1")
            .into_operation(HLCTimestamp::at(10, &NodeId::new("A")))
            .unwrap();
        let entry = OplogEntry {
            offset: 1,
            op,
            result: OperationResult::accepted(None),
            origin: Origin::Local,
            origin_node: NodeId::new("A"),
            origin_seq: 1,
        };
        let moved = OplogEntry { offset: 99, ..entry.clone() };
        assert_eq!(entry.checksum(), moved.checksum());

        let mut tampered = entry.clone();
        tampered.op.borrower_id = BorrowerId::new("u2");
        assert_ne!(entry.checksum(), tampered.checksum());
    }

    #[test]
    fn test_as_received_marks_remote() {
        let op = OperationRequest::return_item("op-1", "B1", "u1")
            .into_operation(HLCTimestamp::default())
            .unwrap();
        let entry = OplogEntry {
            offset: 5,
            op,
            result: OperationResult::accepted(None),
            origin: Origin::Local,
            origin_node: NodeId::new("A"),
            origin_seq: 3,
        };
        let received = entry.as_received();
        assert_eq!(received.origin, Origin::Remote);
        assert_eq!(received.origin_seq, 3);
        assert_eq!(received.origin_node, NodeId::new("A"));
    }
}
