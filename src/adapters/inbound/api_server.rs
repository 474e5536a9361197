//! Node API Server
//!
//! HTTP surface of one site: the on-demand liveness query, statistics, the
//! apply entry point used by the dispatcher and read access to the catalog.

use crate::application::{LendingNode, NodeStats};
use crate::domain::errors::NodeError;
use crate::domain::operation::OperationRequest;
use crate::domain::ports::OplogStats;
use crate::domain::value_objects::ItemId;
use crate::infrastructure::health_monitor::{HealthMonitor, HealthStats};
use crate::replication::{ChannelStats, ReplicationChannel};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

/// Statistics response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub node_id: String,
    pub node: NodeStats,
    pub oplog: OplogStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication: Option<ChannelStats>,
    pub health: HealthStats,
}

/// API Server state.
#[derive(Clone)]
pub struct ApiState {
    pub node: Arc<LendingNode>,
    pub health: Arc<HealthMonitor>,
    /// Absent when running without a peer
    pub channel: Option<Arc<ReplicationChannel>>,
}

impl ApiState {
    pub fn new(node: Arc<LendingNode>, health: Arc<HealthMonitor>) -> Self {
        Self {
            node,
            health,
            channel: None,
        }
    }

    pub fn with_channel(mut self, channel: Arc<ReplicationChannel>) -> Self {
        self.channel = Some(channel);
        self
    }
}

pub struct ApiServer {
    listen_addr: String,
    state: ApiState,
}

impl ApiServer {
    pub fn new(listen_addr: String, state: ApiState) -> Self {
        Self { listen_addr, state }
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve until the shutdown signal.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let app = self.router().layer(TraceLayer::new_for_http());

        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("node API listening on {}", self.listen_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;
        Ok(())
    }
}

/// Routes of the node API.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/api/v1/operations", post(apply_handler))
        .route("/api/v1/items", get(list_items_handler))
        .route("/api/v1/items/:id", get(get_item_handler))
        .route("/api/v1/loans", get(list_loans_handler))
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl ToString) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.to_string() })),
    )
        .into_response()
}

// Handler functions

async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    // Degraded still answers 200: the node keeps serving local traffic.
    Json(state.health.health())
}

async fn stats_handler(State(state): State<ApiState>) -> Response {
    let node = state.node.clone();
    let oplog = match tokio::task::spawn_blocking(move || node.oplog().stats()).await {
        Ok(Ok(stats)) => stats,
        Ok(Err(e)) => {
            tracing::error!("reading oplog stats: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
        }
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };

    Json(StatsResponse {
        node_id: state.node.node_id().to_string(),
        node: state.node.stats(),
        oplog,
        replication: state.channel.as_ref().map(|c| c.stats()),
        health: state.health.stats(),
    })
    .into_response()
}

async fn apply_handler(
    State(state): State<ApiState>,
    Json(request): Json<OperationRequest>,
) -> Response {
    let node = state.node.clone();
    match tokio::task::spawn_blocking(move || node.apply(request)).await {
        Ok(Ok(result)) => Json(result).into_response(),
        Ok(Err(NodeError::InvalidRequest(msg))) => error_response(StatusCode::BAD_REQUEST, msg),
        Ok(Err(e)) => {
            tracing::error!("apply failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn list_items_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.node.catalog().items())
}

async fn get_item_handler(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let id = ItemId::new(id);
    match state.node.catalog().item(&id) {
        Some(item) => Json(serde_json::json!({
            "item": item,
            "loan": state.node.catalog().loan(&id),
        }))
        .into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("item {} not found", id)),
    }
}

async fn list_loans_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.node.catalog().loans())
}
