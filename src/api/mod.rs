/// Read-only HTTP API. Versioned REST under /api/v1, served by axum on
/// the shared runtime. The handlers only read: all writes flow through
/// the sync engine.

pub mod addresses;
pub mod blocks;
pub mod helpers;
pub mod network;
pub mod transactions;
pub mod types;

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::cache::ApiCache;
use crate::config::IndexerConfig;
use crate::metrics;
use crate::rpc::RpcClient;
use crate::store::Store;

use helpers::{unix_now, ApiResult};
use types::{HealthResponse, StatusResponse, SyncResponse};

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub rpc: RpcClient,
    pub cache: Arc<ApiCache>,
}

pub fn build_router(state: ApiState, cors_enabled: bool) -> Router {
    let mut router = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/status", get(status_handler))
        .route("/api/v1/sync", get(sync_handler))
        .route("/api/v1/blocks/latest", get(blocks::latest_blocks))
        .route("/api/v1/blocks", get(blocks::list_blocks))
        .route("/api/v1/blocks/{height_or_hash}", get(blocks::block_by_id))
        .route("/api/v1/transactions/batch", post(transactions::tx_batch))
        .route("/api/v1/transactions/{txid}", get(transactions::tx_by_id))
        .route("/api/v1/addresses/{address}", get(addresses::address_summary))
        .route(
            "/api/v1/addresses/{address}/transactions",
            get(addresses::address_transactions),
        )
        .route(
            "/api/v1/addresses/{address}/utxos",
            get(addresses::address_utxos),
        )
        .route("/api/v1/richlist", get(network::richlist))
        .route("/api/v1/supply", get(network::supply))
        .route("/api/v1/producers", get(network::producers))
        .route("/api/v1/producers/{id}", get(network::producer_by_id))
        .route("/api/v1/nodes", get(network::nodes))
        .route("/api/v1/nodes/{ip}", get(network::node_by_ip))
        .route("/api/v1/network", get(network::network_info))
        .route("/api/v1/mempool", get(network::mempool))
        .route("/api/v1/stats/dashboard", get(network::dashboard));

    if cors_enabled {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        router = router.layer(cors);
    }

    router.layer(Extension(state))
}

/// Bind and serve until the process exits.
pub async fn serve(state: ApiState, config: &IndexerConfig) -> Result<(), std::io::Error> {
    let router = build_router(state, config.api_cors_enabled);
    let addr = format!("{}:{}", config.api_host, config.api_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "api listening");
    axum::serve(listener, router).await
}

async fn root_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "fluxblox",
        "version": env!("CARGO_PKG_VERSION"),
        "api": "/api/v1",
    }))
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: unix_now(),
    })
}

async fn metrics_handler() -> (StatusCode, String) {
    (StatusCode::OK, metrics::render())
}

async fn status_handler(Extension(state): Extension<ApiState>) -> ApiResult<StatusResponse> {
    let sync_state = state
        .store
        .sync_state()
        .map_err(|e| helpers::internal_error(e.to_string()))?;

    let (consensus, blocks, best_block_hash, reachable) =
        match crate::rpc::ChainRpc::get_blockchain_info(&state.rpc).await {
            Ok(info) => (info.chain, info.blocks, info.best_block_hash, true),
            Err(_) => ("unknown".to_string(), 0, String::new(), false),
        };

    let in_sync = reachable
        && sync_state.current_height >= 0
        && sync_state.current_height >= blocks.saturating_sub(1);

    Ok(Json(StatusResponse {
        best_height: sync_state.current_height,
        in_sync,
        consensus,
        blocks,
        best_block_hash,
        last_sync_time: sync_state.last_sync_time,
        daemon_reachable: reachable,
    }))
}

pub(crate) fn sync_response(state: &ApiState) -> Result<SyncResponse, crate::store::StoreError> {
    let row = state.store.sync_state()?;
    let percentage = if row.chain_height > 0 && row.current_height >= 0 {
        (row.current_height as f64 / row.chain_height as f64 * 100.0).min(100.0)
    } else {
        0.0
    };
    Ok(SyncResponse {
        current_height: row.current_height,
        chain_height: row.chain_height,
        percentage,
        is_syncing: row.is_syncing,
        last_sync_time: row.last_sync_time,
    })
}

async fn sync_handler(Extension(state): Extension<ApiState>) -> ApiResult<SyncResponse> {
    sync_response(&state)
        .map(Json)
        .map_err(|e| helpers::internal_error(e.to_string()))
}
