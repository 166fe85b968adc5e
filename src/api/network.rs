// Network-wide endpoints: richlist, supply, producers, node ledger,
// daemon network state, mempool, and the dashboard rollup. The scans
// behind richlist and the dashboard run on the blocking pool and cache
// their JSON for a short TTL.

use axum::extract::{Extension, Path};
use axum::Json;
use serde_json::Value;
use std::time::Duration;

use crate::rpc::ChainRpc;
use crate::store::{
    CF_ADDRESS_SUMMARY, CF_TRANSACTIONS, CF_UTXOS,
};
use crate::types::Tier;

use super::helpers::{internal_error, no_data_yet, not_found, ApiResult};
use super::types::{
    DashboardResponse, MempoolResponse, NetworkResponse, NodesResponse, ProducersResponse,
    RichlistEntry, SupplyResponse,
};
use super::ApiState;

const RICHLIST_SIZE: usize = 100;
const RICHLIST_TTL: Duration = Duration::from_secs(60);
const DASHBOARD_TTL: Duration = Duration::from_secs(30);
const MEMPOOL_PREVIEW: usize = 500;

/// GET /api/v1/richlist
pub async fn richlist(Extension(state): Extension<ApiState>) -> ApiResult<Value> {
    let store = state.store.clone();
    let value = state
        .cache
        .get_or_compute("richlist", RICHLIST_TTL, || async move {
            let rows = tokio::task::spawn_blocking(move || store.richlist(RICHLIST_SIZE))
                .await
                .map_err(|e| internal_error(e.to_string()))?
                .map_err(|e| internal_error(e.to_string()))?;
            let entries: Vec<RichlistEntry> = rows
                .into_iter()
                .enumerate()
                .map(|(i, row)| RichlistEntry {
                    rank: i + 1,
                    address: row.address,
                    balance: row.balance,
                    tx_count: row.tx_count,
                })
                .collect();
            serde_json::to_value(entries).map_err(|e| internal_error(e.to_string()))
        })
        .await?;
    Ok(Json(value))
}

fn supply_from_store(state: &ApiState) -> Result<Option<SupplyResponse>, String> {
    let row = state.store.latest_supply().map_err(|e| e.to_string())?;
    Ok(row.map(|row| SupplyResponse {
        height: row.height,
        transparent: row.transparent,
        sapling: row.sapling,
        sprout: row.sprout,
        total: row.transparent + row.sapling + row.sprout,
    }))
}

/// GET /api/v1/supply
pub async fn supply(Extension(state): Extension<ApiState>) -> ApiResult<SupplyResponse> {
    match supply_from_store(&state).map_err(internal_error)? {
        Some(response) => Ok(Json(response)),
        None => Err(no_data_yet()),
    }
}

/// GET /api/v1/producers
pub async fn producers(Extension(state): Extension<ApiState>) -> ApiResult<ProducersResponse> {
    let mut rows = state
        .store
        .producers()
        .map_err(|e| internal_error(e.to_string()))?;
    rows.sort_by(|a, b| b.blocks_produced.cmp(&a.blocks_produced));
    Ok(Json(ProducersResponse { producers: rows }))
}

/// GET /api/v1/producers/{id}
pub async fn producer_by_id(
    Path(id): Path<String>,
    Extension(state): Extension<ApiState>,
) -> ApiResult<crate::types::ProducerRow> {
    match state
        .store
        .producer(&id)
        .map_err(|e| internal_error(e.to_string()))?
    {
        Some(row) => Ok(Json(row)),
        None => Err(not_found(format!("producer {} not found", id))),
    }
}

fn count_tier(nodes: &[crate::types::FluxNodeRow], tier: Tier) -> usize {
    nodes.iter().filter(|n| n.tier == Some(tier)).count()
}

/// GET /api/v1/nodes
pub async fn nodes(Extension(state): Extension<ApiState>) -> ApiResult<NodesResponse> {
    let nodes = state
        .store
        .fluxnodes()
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(NodesResponse {
        total: nodes.len(),
        cumulus: count_tier(&nodes, Tier::Cumulus),
        nimbus: count_tier(&nodes, Tier::Nimbus),
        stratus: count_tier(&nodes, Tier::Stratus),
        nodes,
    }))
}

/// GET /api/v1/nodes/{ip}
pub async fn node_by_ip(
    Path(ip): Path<String>,
    Extension(state): Extension<ApiState>,
) -> ApiResult<crate::types::FluxNodeRow> {
    match state
        .store
        .fluxnode(&ip)
        .map_err(|e| internal_error(e.to_string()))?
    {
        Some(row) => Ok(Json(row)),
        None => Err(not_found(format!("node {} not found", ip))),
    }
}

/// GET /api/v1/network
pub async fn network_info(Extension(state): Extension<ApiState>) -> ApiResult<NetworkResponse> {
    let chain_info = state
        .rpc
        .get_blockchain_info()
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    let net = state.rpc.get_network_info().await.ok();

    Ok(Json(NetworkResponse {
        chain: chain_info.chain,
        blocks: chain_info.blocks,
        headers: chain_info.headers,
        difficulty: chain_info.difficulty,
        connections: net.as_ref().map(|n| n.connections).unwrap_or(0),
        subversion: net
            .as_ref()
            .map(|n| n.subversion.clone())
            .unwrap_or_default(),
        protocol_version: net.as_ref().map(|n| n.protocolversion).unwrap_or(0),
    }))
}

/// GET /api/v1/mempool
pub async fn mempool(Extension(state): Extension<ApiState>) -> ApiResult<MempoolResponse> {
    let mut txids = state
        .rpc
        .get_raw_mempool()
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    let size = txids.len();
    txids.truncate(MEMPOOL_PREVIEW);
    Ok(Json(MempoolResponse { size, txids }))
}

/// GET /api/v1/stats/dashboard
pub async fn dashboard(Extension(state): Extension<ApiState>) -> ApiResult<Value> {
    let state_for_compute = state.clone();
    let value = state
        .cache
        .get_or_compute("dashboard", DASHBOARD_TTL, || async move {
            let sync = super::sync_response(&state_for_compute)
                .map_err(|e| internal_error(e.to_string()))?;
            if sync.current_height < 0 {
                return Err(no_data_yet());
            }

            let store = state_for_compute.store.clone();
            let (latest_blocks, supply, node_count, producer_count, reorg_count) =
                tokio::task::spawn_blocking(move || {
                    let blocks = store.latest_blocks(10, None)?;
                    let supply = store.latest_supply()?;
                    let nodes = store.fluxnodes()?.len();
                    let producers = store.producers()?.len();
                    let reorgs = store.reorg_events()?.len();
                    Ok::<_, crate::store::StoreError>((blocks, supply, nodes, producers, reorgs))
                })
                .await
                .map_err(|e| internal_error(e.to_string()))?
                .map_err(|e| internal_error(e.to_string()))?;

            let response = DashboardResponse {
                sync,
                latest_blocks,
                supply: supply.map(|row| SupplyResponse {
                    height: row.height,
                    transparent: row.transparent,
                    sapling: row.sapling,
                    sprout: row.sprout,
                    total: row.transparent + row.sapling + row.sprout,
                }),
                node_count,
                producer_count,
                reorg_count,
                transactions_indexed: state_for_compute.store.estimate_keys(CF_TRANSACTIONS),
                utxos_tracked: state_for_compute.store.estimate_keys(CF_UTXOS),
                addresses_tracked: state_for_compute.store.estimate_keys(CF_ADDRESS_SUMMARY),
            };
            serde_json::to_value(&response).map_err(|e| internal_error(e.to_string()))
        })
        .await?;
    Ok(Json(value))
}
