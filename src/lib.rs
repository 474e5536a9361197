//! lending-core Library
//!
//! Storage and replication core of a two-site lending system: the catalog
//! and loan store, the operation log, snapshots, peer replication and the
//! health monitor. Exposed as a library for the node binary and the
//! integration tests.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod replication;

// Re-export commonly used types
pub use application::{Ingest, LendingNode};
pub use config::{load_config, Config};
pub use domain::entities::{CatalogState, Item, Loan};
pub use domain::operation::{OperationRequest, OperationResult, OplogEntry};
pub use domain::ports::{OperationLog, SnapshotStore};
pub use domain::services::Catalog;
pub use domain::value_objects::NodeId;
pub use infrastructure::{HealthMonitor, SnapshotManager};
pub use replication::{ReplicationChannel, ReplicationConfig};
