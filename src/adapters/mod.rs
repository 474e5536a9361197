//! Adapters: SQLite persistence (outbound) and the HTTP status API (inbound).

pub mod inbound;
pub mod outbound;
