//! lending-node - one site of the two-site lending core
//!
//! This is the composition root that wires together all the components.

use lending_core::adapters::inbound::{ApiServer, ApiState};
use lending_core::adapters::outbound::{SqliteDatabase, SqliteOperationLog, SqliteSnapshotStore};
use lending_core::application::{load_seed_file, LendingNode};
use lending_core::config::load_config;
use lending_core::domain::value_objects::NodeId;
use lending_core::infrastructure::{shutdown_signal, HealthMonitor, ShutdownController, SnapshotManager};
use lending_core::replication::{PeerLink, ReplicationChannel, TransportService};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing::info!(
        "starting lending-node id={} db={} peer={}",
        cfg.node_id,
        cfg.db_path,
        cfg.peer_id.as_deref().unwrap_or("none")
    );

    // ===== COMPOSITION ROOT =====

    // 1. Storage and recovery
    let node_id = NodeId::new(cfg.node_id.clone());
    let db = SqliteDatabase::open(&cfg.db_path)?;
    let node = LendingNode::open(
        node_id.clone(),
        Arc::new(SqliteOperationLog::new(db.clone())),
        Arc::new(SqliteSnapshotStore::new(db)),
    )?
    .with_snapshot_every(cfg.snapshot_every);
    let node = Arc::new(node);

    if let Some(path) = &cfg.seed_path {
        let items = load_seed_file(path)?;
        let added = node.seed(items)?;
        tracing::info!("catalog seed {}: {} new items", path, added);
    }

    let shutdown = ShutdownController::new();
    let replication = cfg.replication()?;
    let peer_id = replication.peer_id.clone();

    // 2. Peer link (QUIC) when a peer is configured
    let mut transport = None;
    let mut peer = None;
    if let (Some(id), Some(addr)) = (replication.peer_id.clone(), replication.peer_addr) {
        let mut service = TransportService::new(replication.clone());
        service.start().await?;
        let events = service
            .take_event_rx()
            .ok_or_else(|| anyhow::anyhow!("transport events already taken"))?;
        let link: Arc<dyn PeerLink> = Arc::new(service.link(id.clone(), addr)?);
        peer = Some((id, link, events));
        transport = Some(service);
    }

    // 3. Health monitor
    let mut health = HealthMonitor::new(node_id.clone(), cfg.health());
    if let Some((id, link, _)) = &peer {
        health = health.with_peer(id.clone(), Some(link.clone()));
    }
    let health = Arc::new(health);
    shutdown.track("health-monitor", tokio::spawn(health.clone().start(shutdown.subscribe())));

    // 4. Replication channel
    let mut api_state = ApiState::new(node.clone(), health.clone());
    if let Some((_, link, events)) = peer {
        let channel = Arc::new(
            ReplicationChannel::new(node.clone(), link, replication)?.with_health(health.clone()),
        );
        api_state = api_state.with_channel(channel.clone());
        shutdown.track("replication", tokio::spawn(channel.run(events, shutdown.subscribe())));
    }

    // 5. Snapshots
    let snapshots = SnapshotManager::new(node.clone(), peer_id);
    shutdown.track("snapshots", tokio::spawn(snapshots.start(shutdown.subscribe())));

    // 6. HTTP API
    let api = ApiServer::new(cfg.api_listen_addr.clone(), api_state);
    let api_shutdown = shutdown.subscribe();
    let api_controller = shutdown.clone();
    shutdown.track(
        "api",
        tokio::spawn(async move {
            if let Err(e) = api.run(api_shutdown).await {
                tracing::error!("API server failed: {:?}", e);
                api_controller.shutdown();
            }
        }),
    );

    shutdown_signal(shutdown.clone()).await;

    let clean = shutdown.drain(Duration::from_secs(10)).await;
    if let Some(service) = &transport {
        service.shutdown();
    }
    tracing::info!("lending-node {} stopped (clean={})", node_id, clean);
    Ok(())
}
