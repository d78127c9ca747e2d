//! Status HTTP server: table dumps, reconciliation status, metrics.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
};
use pkg_proxy::ServiceProxy;
use pkg_proxy::datapath::{Packet, Verdict};
use pkg_proxy::reconciler::ServiceStatus;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

type ApiError = (StatusCode, String);

#[derive(Debug, Deserialize)]
pub struct FlowsQuery {
    #[serde(default)]
    pub table: Option<u8>,
}

pub fn router(proxy: Arc<ServiceProxy>) -> Router {
    Router::new()
        .route("/flows", get(flows))
        .route("/groups", get(groups))
        .route("/status", get(status))
        .route("/trace", post(trace))
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .with_state(proxy)
}

pub async fn serve(proxy: Arc<ServiceProxy>, addr: SocketAddr) -> anyhow::Result<()> {
    info!("Starting status server on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router(proxy)).await?;
    Ok(())
}

fn internal(e: anyhow::Error) -> ApiError {
    warn!("Status request failed: {:#}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// GET /flows?table=N: installed flows, one per line.
async fn flows(
    State(proxy): State<Arc<ServiceProxy>>,
    Query(query): Query<FlowsQuery>,
) -> Result<String, ApiError> {
    let lines = proxy.dump_flows(query.table).await.map_err(internal)?;
    Ok(lines.join("\n"))
}

/// GET /groups: installed select groups, one per line.
async fn groups(State(proxy): State<Arc<ServiceProxy>>) -> Result<String, ApiError> {
    let lines = proxy.dump_groups().await.map_err(internal)?;
    Ok(lines.join("\n"))
}

async fn status(State(proxy): State<Arc<ServiceProxy>>) -> Json<Vec<ServiceStatus>> {
    Json(proxy.statuses())
}

/// POST /trace: walk a packet through the installed tables.
async fn trace(
    State(proxy): State<Arc<ServiceProxy>>,
    Json(packet): Json<Packet>,
) -> Result<Json<Verdict>, ApiError> {
    let verdict = proxy
        .datapath()
        .process(packet)
        .await
        .map_err(|e| internal(e.into()))?;
    Ok(Json(verdict))
}

async fn metrics(State(proxy): State<Arc<ServiceProxy>>) -> String {
    proxy.metrics().render()
}

async fn healthz() -> &'static str {
    "ok"
}
