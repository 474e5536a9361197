//! Replication Types
//!
//! Messages exchanged between the two sites and the checksummed batch of
//! log entries they carry.

use crate::domain::operation::OplogEntry;
use crate::domain::value_objects::NodeId;
use crate::infrastructure::health_monitor::Beacon;
use serde::{Deserialize, Serialize};

/// Locally originated log entries shipped together, in `origin_seq` order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryBatch {
    /// Node that originated every entry of the batch
    pub source: NodeId,
    pub entries: Vec<OplogEntry>,
    /// CRC32 checksum for integrity
    pub checksum: u32,
}

impl EntryBatch {
    pub fn new(source: NodeId, entries: Vec<OplogEntry>) -> Self {
        let checksum = Self::compute_checksum(&entries);
        Self {
            source,
            entries,
            checksum,
        }
    }

    /// Verify the checksum.
    pub fn verify(&self) -> bool {
        self.checksum == Self::compute_checksum(&self.entries)
    }

    pub fn first_seq(&self) -> Option<u64> {
        self.entries.first().map(|e| e.origin_seq)
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.entries.last().map(|e| e.origin_seq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn compute_checksum(entries: &[OplogEntry]) -> u32 {
        let bytes = bincode::serialize(entries).unwrap_or_default();
        crc32fast::hash(&bytes)
    }
}

/// Message types for peer communication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// New local entries of the sender
    Entries(EntryBatch),
    /// Ask the peer to (re)send its entries starting at `from_seq`
    SyncRequest { from_seq: u64 },
    /// Entries of `source` up to `seq` are durably ingested
    Ack { source: NodeId, seq: u64 },
    /// Liveness beacon
    Heartbeat(Beacon),
}

impl Message {
    /// Get the message type as a string.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Entries(_) => "Entries",
            Self::SyncRequest { .. } => "SyncRequest",
            Self::Ack { .. } => "Ack",
            Self::Heartbeat(_) => "Heartbeat",
        }
    }
}
