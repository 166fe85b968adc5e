// Response shapes for the read API. Everything serializes camelCase.

use serde::{Deserialize, Serialize};

use crate::types::{
    AddressSummaryRow, AddressTxRow, BlockRow, FluxNodeRow, ProducerRow, TxRow, UtxoRow,
};

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub best_height: i64,
    pub in_sync: bool,
    pub consensus: String,
    pub blocks: i64,
    pub best_block_hash: String,
    pub last_sync_time: i64,
    pub daemon_reachable: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub current_height: i64,
    pub chain_height: i64,
    pub percentage: f64,
    pub is_syncing: bool,
    pub last_sync_time: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockResponse {
    #[serde(flatten)]
    pub block: BlockRow,
    pub txids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockListResponse {
    pub blocks: Vec<BlockRow>,
    pub next_before: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct BlockListQuery {
    pub limit: Option<usize>,
    pub before: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResponse {
    #[serde(flatten)]
    pub tx: TxRow,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_tx: Option<crate::types::FluxNodeTxRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participants: Option<crate::types::TxParticipantsRow>,
}

#[derive(Debug, Deserialize)]
pub struct TxBatchRequest {
    pub txids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxBatchResponse {
    pub transactions: Vec<TxRow>,
    pub not_found: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressResponse {
    #[serde(flatten)]
    pub summary: AddressSummaryRow,
}

#[derive(Debug, Deserialize)]
pub struct AddressTxQuery {
    pub limit: Option<usize>,
    /// Cursor "height:txid" from a previous page.
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressTxResponse {
    pub transactions: Vec<AddressTxRow>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressUtxosResponse {
    pub utxos: Vec<UtxoRow>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RichlistEntry {
    pub rank: usize,
    pub address: String,
    pub balance: i64,
    pub tx_count: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplyResponse {
    pub height: u32,
    pub transparent: i64,
    pub sapling: i64,
    pub sprout: i64,
    pub total: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducersResponse {
    pub producers: Vec<ProducerRow>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodesResponse {
    pub total: usize,
    pub cumulus: usize,
    pub nimbus: usize,
    pub stratus: usize,
    pub nodes: Vec<FluxNodeRow>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkResponse {
    pub chain: String,
    pub blocks: i64,
    pub headers: i64,
    pub difficulty: f64,
    pub connections: u32,
    pub subversion: String,
    pub protocol_version: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MempoolResponse {
    pub size: usize,
    pub txids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardResponse {
    pub sync: SyncResponse,
    pub latest_blocks: Vec<BlockRow>,
    pub supply: Option<SupplyResponse>,
    pub node_count: usize,
    pub producer_count: usize,
    pub reorg_count: usize,
    pub transactions_indexed: u64,
    pub utxos_tracked: u64,
    pub addresses_tracked: u64,
}
