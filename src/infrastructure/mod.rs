//! Infrastructure Layer
//!
//! Background components of a node: liveness beacons, snapshotting and
//! coordinated shutdown.

pub mod health_monitor;
pub mod shutdown;
pub mod snapshot_manager;

pub use health_monitor::{
    Beacon, HealthMonitor, HealthMonitorConfig, HealthReport, HealthStats, HealthStatus,
    PeerHealth,
};
pub use shutdown::{shutdown_signal, ShutdownController};
pub use snapshot_manager::{SnapshotManager, SnapshotReport};
