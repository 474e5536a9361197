//! Value Objects - Immutable domain primitives
//!
//! Identifiers and the logical clock used to order operations across sites.
//! They are immutable and can be freely shared.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Days a new loan runs before it is due.
pub const LOAN_PERIOD_DAYS: i64 = 14;

/// Days a renewal adds to the current due date.
pub const RENEWAL_EXTENSION_DAYS: i64 = 7;

/// Maximum number of renewals a single loan may receive.
pub const MAX_RENEWALS: u8 = 2;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Identity of one site's storage-and-replication instance (e.g. "A").
    NodeId
);
string_id!(
    /// Unique code of a catalog item.
    ItemId
);
string_id!(
    /// Identity of the user holding or requesting a loan.
    BorrowerId
);
string_id!(
    /// Caller-assigned operation id; the idempotency key.
    OpId
);

/// Current wall clock in microseconds since the UNIX epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Current wall clock in milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    now_micros() / 1_000
}

/// Hybrid Logical Clock timestamp for ordering events.
///
/// Combines wall clock time with a logical counter so that every operation
/// accepted by either site gets a distinct, totally ordered stamp even when
/// the two wall clocks are skewed.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct HLCTimestamp {
    /// Wall clock time in microseconds since UNIX epoch
    pub wall_time: u64,
    /// Logical counter for events at the same wall time
    pub counter: u32,
    /// Node ID hash for tie-breaking
    pub node_hash: u32,
}

impl HLCTimestamp {
    /// Stamp for the current wall clock with a zero counter.
    pub fn now(node_id: &NodeId) -> Self {
        Self::at(now_micros(), node_id)
    }

    /// Next stamp after `self`, also after `observed` when a peer stamp was seen.
    ///
    /// The wall part never goes backwards; when it does not move forward the
    /// counter is bumped past every stamp sharing that wall time.
    pub fn tick(&self, observed: Option<&HLCTimestamp>, node_id: &NodeId) -> Self {
        let mut next = Self::now(node_id);
        for prior in std::iter::once(self).chain(observed) {
            if prior.wall_time > next.wall_time {
                next.wall_time = prior.wall_time;
                next.counter = prior.counter + 1;
            } else if prior.wall_time == next.wall_time {
                next.counter = next.counter.max(prior.counter + 1);
            }
        }
        next
    }

    /// Build a timestamp at a fixed wall time (microseconds). Used by replay and tests.
    pub fn at(wall_time: u64, node_id: &NodeId) -> Self {
        Self {
            wall_time,
            counter: 0,
            node_hash: crc32fast::hash(node_id.0.as_bytes()),
        }
    }

    /// Milliseconds since the UNIX epoch.
    pub fn as_millis(&self) -> u64 {
        self.wall_time / 1_000
    }

    /// Calendar date (UTC) this timestamp falls on.
    pub fn date(&self) -> NaiveDate {
        DateTime::<Utc>::from_timestamp_micros(self.wall_time as i64)
            .map(|dt| dt.date_naive())
            .unwrap_or_default()
    }
}

/// Due date of a loan created at `at`.
pub fn loan_due_date(at: &HLCTimestamp) -> NaiveDate {
    at.date() + Duration::days(LOAN_PERIOD_DAYS)
}

/// Due date a renewal should request, given the current one.
pub fn renewal_due_date(current: NaiveDate) -> NaiveDate {
    current + Duration::days(RENEWAL_EXTENSION_DAYS)
}
