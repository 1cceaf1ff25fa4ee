/// HTTP stats and administration surface
///
/// Response bodies are informal JSON for dashboards and the core miner.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::blockchain::{Daemon, DaemonSettings};
use crate::metrics::prometheus as metrics;
use crate::pool::Pool;
use crate::storage::RECENT_BLOCKS;

#[derive(Clone)]
pub struct ApiState {
    pub pool: Arc<Pool>,
    /// Client for the default node
    pub daemon: Arc<dyn Daemon>,
    pub hostname: String,
    pub port: u16,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/stats", get(pool_stats))
        .route("/stats/blocks", get(recent_blocks))
        .route("/stats/:address", get(miner_stats))
        .route("/stats/:address/workers", get(miner_workers))
        .route("/block", post(submit_block))
        .route("/block/last", get(last_block))
        .route("/block/template", post(block_template))
        .route("/:address", post(reconfigure))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn prometheus_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics::render(),
    )
}

async fn pool_stats(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let info = state.daemon.info().await.ok();

    let mut miners = 0;
    let mut hashrate = 0;
    for session in state.pool.sessions().await {
        miners += session.worker_count().await;
        hashrate += session.hashrate().await;
    }

    let last = state.pool.store().last_block().await.ok();

    Json(json!({
        "height": info.as_ref().map(|i| i.height),
        "difficulty": info.as_ref().map(|i| i.difficulty),
        "hashrate": hashrate,
        "miners": miners,
        "fee": 0,
        "lastBlock": last.as_ref().map(|b| b.timestamp),
        "lastBlockHash": last.as_ref().map(|b| b.hash.clone()),
        "hostname": state.hostname,
        "port": state.port,
        "node": state.pool.options().default_settings,
    }))
}

async fn recent_blocks(State(state): State<ApiState>) -> Response {
    match state.pool.store().last_blocks(RECENT_BLOCKS).await {
        Ok(blocks) => Json(blocks).into_response(),
        Err(e) => {
            tracing::warn!("Block history unavailable: {}", e);
            StatusCode::NOT_IMPLEMENTED.into_response()
        }
    }
}

fn valid_address(state: &ApiState, address: &str) -> bool {
    state.pool.controller().validate_address(address).is_ok()
}

async fn miner_stats(State(state): State<ApiState>, Path(address): Path<String>) -> Response {
    if !valid_address(&state, &address) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let Some(session) = state.pool.session(&address).await else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let last = state.pool.store().last_miner_block(&address).await.ok();

    Json(json!({
        "address": address,
        "workers": session.worker_count().await,
        "hashrate": session.hashrate().await,
        "last_block": last.as_ref().map(|b| b.timestamp),
        "last_block_hash": last.as_ref().map(|b| b.hash.clone()),
        "node": session.settings(),
    }))
    .into_response()
}

async fn miner_workers(State(state): State<ApiState>, Path(address): Path<String>) -> Response {
    if !valid_address(&state, &address) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    match state.pool.session(&address).await {
        Some(session) => Json(session.workers().await).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Raw block from a core miner, as a hex body.
async fn submit_block(State(state): State<ApiState>, body: String) -> Response {
    let raw = body.trim().trim_matches('"');
    match state.pool.submit_raw_block(state.daemon.as_ref(), raw).await {
        Ok(result) => (StatusCode::ACCEPTED, Json(result)).into_response(),
        Err(e) => {
            tracing::warn!("Core miner block submission failed: {}", e);
            StatusCode::NOT_IMPLEMENTED.into_response()
        }
    }
}

async fn last_block(State(state): State<ApiState>) -> Response {
    match state.daemon.last_block().await {
        Ok(header) => Json(header).into_response(),
        Err(e) => {
            tracing::warn!("Last block lookup failed: {}", e);
            StatusCode::NOT_IMPLEMENTED.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TemplateRequest {
    #[serde(default)]
    pub address: String,
}

async fn block_template(State(state): State<ApiState>, Json(body): Json<TemplateRequest>) -> Response {
    if !valid_address(&state, &body.address) {
        return StatusCode::BAD_REQUEST.into_response();
    }

    match state.pool.core_job(&body.address).await {
        Ok(template) => (StatusCode::CREATED, Json(template)).into_response(),
        Err(e) => {
            tracing::warn!("Core job for {} failed: {}", body.address, e);
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct NodeUpdate {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ssl: Option<bool>,
    /// Milliseconds
    pub timeout: Option<u64>,
}

impl NodeUpdate {
    pub fn apply(&self, current: &DaemonSettings) -> DaemonSettings {
        DaemonSettings::new(
            self.host
                .clone()
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| current.host.clone()),
            self.port.unwrap_or(current.port),
            self.ssl.unwrap_or(current.ssl),
            self.timeout.map(Duration::from_millis).unwrap_or(current.timeout),
        )
    }
}

async fn reconfigure(
    State(state): State<ApiState>,
    Path(address): Path<String>,
    body: Option<Json<NodeUpdate>>,
) -> Response {
    let Some(session) = state.pool.session(&address).await else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let update = body.map(|Json(u)| u).unwrap_or_default();
    let settings = update.apply(&session.settings());

    match session.reconfigure(settings) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            tracing::warn!("Reconfigure of {} failed: {}", address, e);
            StatusCode::BAD_REQUEST.into_response()
        }
    }
}
