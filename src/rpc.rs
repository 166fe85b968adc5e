/// Typed JSON-RPC client for the Flux daemon.
///
/// Single calls, id-correlated batch calls, and a per-block fallback path
/// for blocks the daemon refuses to serialize at verbosity 2 (some blocks
/// containing node transactions do). JSON is decoded into strict schemas
/// at this boundary; nothing untyped escapes the client.

use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::types::COIN;

/// Parallel workers for per-block fallback fetches.
const FALLBACK_WORKERS: usize = 4;

#[derive(Debug, Clone)]
pub enum RpcError {
    /// Connection-level failure (refused, reset, DNS, TLS).
    Transport { method: String, detail: String },
    /// The per-call deadline expired.
    Timeout { method: String },
    /// The daemon answered with a JSON-RPC error object.
    Rpc {
        method: String,
        code: i64,
        message: String,
    },
    /// The daemon answered 2xx/5xx but the body did not match the schema.
    Malformed { method: String, detail: String },
}

impl RpcError {
    pub fn method(&self) -> &str {
        match self {
            RpcError::Transport { method, .. }
            | RpcError::Timeout { method }
            | RpcError::Rpc { method, .. }
            | RpcError::Malformed { method, .. } => method,
        }
    }

    /// Transient errors are retried indefinitely during warm-up.
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Transport { .. } | RpcError::Timeout { .. })
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Transport { method, detail } => {
                write!(f, "rpc transport error in {}: {}", method, detail)
            }
            RpcError::Timeout { method } => write!(f, "rpc timeout in {}", method),
            RpcError::Rpc {
                method,
                code,
                message,
            } => write!(f, "rpc error {} in {}: {}", code, method, message),
            RpcError::Malformed { method, detail } => {
                write!(f, "malformed rpc response in {}: {}", method, detail)
            }
        }
    }
}

impl std::error::Error for RpcError {}

// ---------------------------------------------------------------------------
// Response schemas
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ValuePool {
    pub id: String,
    #[serde(rename = "chainValue", default)]
    pub chain_value: f64,
    #[serde(rename = "chainValueZat", default)]
    pub chain_value_zat: Option<i64>,
}

impl ValuePool {
    /// Pool value in minor units, preferring the integer field.
    pub fn value_sat(&self) -> i64 {
        self.chain_value_zat
            .unwrap_or_else(|| (self.chain_value * COIN as f64).round() as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockchainInfo {
    pub chain: String,
    pub blocks: i64,
    pub headers: i64,
    #[serde(rename = "bestblockhash")]
    pub best_block_hash: String,
    #[serde(default)]
    pub difficulty: f64,
    #[serde(rename = "valuePools", default)]
    pub value_pools: Vec<ValuePool>,
}

impl BlockchainInfo {
    pub fn pool_value(&self, id: &str) -> Option<i64> {
        self.value_pools
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.value_sat())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainTip {
    pub height: i64,
    pub hash: String,
    #[serde(default)]
    pub branchlen: u32,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcScriptPubKey {
    #[serde(default)]
    pub hex: String,
    #[serde(rename = "type", default)]
    pub script_type: Option<String>,
    #[serde(default)]
    pub addresses: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcVout {
    #[serde(default)]
    pub value: f64,
    #[serde(rename = "valueZat", default)]
    pub value_zat: Option<i64>,
    #[serde(rename = "valueSat", default)]
    pub value_sat_field: Option<i64>,
    pub n: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: RpcScriptPubKey,
}

impl RpcVout {
    pub fn value_sat(&self) -> i64 {
        self.value_zat
            .or(self.value_sat_field)
            .unwrap_or_else(|| (self.value * COIN as f64).round() as i64)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcVin {
    #[serde(default)]
    pub coinbase: Option<String>,
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub vout: Option<u32>,
    #[serde(default)]
    pub sequence: Option<u64>,
}

impl RpcVin {
    pub fn is_coinbase(&self) -> bool {
        self.coinbase.is_some()
    }

    /// A transparent input referencing a prior outpoint.
    pub fn prev_outpoint(&self) -> Option<(&str, u32)> {
        match (&self.txid, self.vout) {
            (Some(txid), Some(vout)) => Some((txid.as_str(), vout)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcTransaction {
    pub txid: String,
    #[serde(default)]
    pub version: i32,
    #[serde(default)]
    pub size: Option<u32>,
    #[serde(default)]
    pub hex: Option<String>,
    #[serde(default)]
    pub vin: Vec<RpcVin>,
    #[serde(default)]
    pub vout: Vec<RpcVout>,
}

impl RpcTransaction {
    /// Shielded-only: value moves entirely inside a privacy pool.
    pub fn is_shielded(&self) -> bool {
        self.vin.is_empty() && self.vout.is_empty()
    }
}

/// Verbosity 2 gives transaction objects; verbosity 1 gives txid strings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RpcBlockTx {
    Full(RpcTransaction),
    Id(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcBlock {
    pub hash: String,
    pub height: u32,
    #[serde(default)]
    pub size: u32,
    #[serde(default)]
    pub version: i32,
    #[serde(default)]
    pub merkleroot: String,
    pub tx: Vec<RpcBlockTx>,
    pub time: i64,
    #[serde(default)]
    pub difficulty: f64,
    #[serde(default)]
    pub previousblockhash: Option<String>,
    #[serde(rename = "valuePools", default)]
    pub value_pools: Vec<ValuePool>,
}

impl RpcBlock {
    pub fn pool_value(&self, id: &str) -> Option<i64> {
        self.value_pools
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.value_sat())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FluxNodeEntry {
    #[serde(default)]
    pub collateral: Option<String>,
    #[serde(default)]
    pub txhash: String,
    #[serde(default)]
    pub outidx: u32,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub payment_address: String,
    #[serde(default)]
    pub added_height: u32,
    #[serde(default)]
    pub confirmed_height: u32,
    #[serde(default)]
    pub last_confirmed_height: u32,
    #[serde(default)]
    pub last_paid_height: u32,
    #[serde(default)]
    pub rank: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkInfo {
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub subversion: String,
    #[serde(default)]
    pub connections: u32,
    #[serde(default)]
    pub protocolversion: i64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorObject>,
    #[serde(default)]
    id: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorObject {
    code: i64,
    message: String,
}

// ---------------------------------------------------------------------------
// Daemon surface, as a trait so the engine can run against a scripted
// fixture in tests.
// ---------------------------------------------------------------------------

pub trait ChainRpc: Send + Sync {
    fn get_blockchain_info(
        &self,
    ) -> impl Future<Output = Result<BlockchainInfo, RpcError>> + Send;

    fn get_block_hash(&self, height: u32)
        -> impl Future<Output = Result<String, RpcError>> + Send;

    /// Fetch a height range as full blocks, falling back per block (and to
    /// verbosity 1) when the daemon errors. Results are in input order.
    fn batch_get_blocks(
        &self,
        heights: &[u32],
    ) -> impl Future<Output = Result<Vec<RpcBlock>, RpcError>> + Send;

    fn get_raw_transaction(
        &self,
        txid: &str,
    ) -> impl Future<Output = Result<RpcTransaction, RpcError>> + Send;

    fn list_flux_nodes(
        &self,
    ) -> impl Future<Output = Result<Vec<FluxNodeEntry>, RpcError>> + Send;
}

impl<T: ChainRpc> ChainRpc for std::sync::Arc<T> {
    async fn get_blockchain_info(&self) -> Result<BlockchainInfo, RpcError> {
        (**self).get_blockchain_info().await
    }

    async fn get_block_hash(&self, height: u32) -> Result<String, RpcError> {
        (**self).get_block_hash(height).await
    }

    async fn batch_get_blocks(&self, heights: &[u32]) -> Result<Vec<RpcBlock>, RpcError> {
        (**self).batch_get_blocks(heights).await
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<RpcTransaction, RpcError> {
        (**self).get_raw_transaction(txid).await
    }

    async fn list_flux_nodes(&self) -> Result<Vec<FluxNodeEntry>, RpcError> {
        (**self).list_flux_nodes().await
    }
}

// ---------------------------------------------------------------------------
// Real client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    user: String,
    password: String,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(url: String, user: String, password: String, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            user,
            password,
            timeout,
        }
    }

    fn map_send_error(&self, method: &str, err: reqwest::Error) -> RpcError {
        if err.is_timeout() {
            RpcError::Timeout {
                method: method.to_string(),
            }
        } else {
            RpcError::Transport {
                method: method.to_string(),
                detail: err.to_string(),
            }
        }
    }

    async fn post(&self, method: &str, body: Value) -> Result<Value, RpcError> {
        let response = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(method, e))?;

        // The daemon answers RPC-level errors with non-2xx statuses but a
        // well-formed JSON body; decode before judging the status.
        response
            .json::<Value>()
            .await
            .map_err(|e| self.map_send_error(method, e))
    }

    /// Single JSON-RPC call with a typed result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": "fluxblox",
            "method": method,
            "params": params,
        });

        let raw = self.post(method, body).await?;
        let parsed: JsonRpcResponse =
            serde_json::from_value(raw).map_err(|e| RpcError::Malformed {
                method: method.to_string(),
                detail: e.to_string(),
            })?;

        if let Some(err) = parsed.error {
            return Err(RpcError::Rpc {
                method: method.to_string(),
                code: err.code,
                message: err.message,
            });
        }

        let result = parsed.result.ok_or_else(|| RpcError::Malformed {
            method: method.to_string(),
            detail: "response carries neither result nor error".to_string(),
        })?;

        serde_json::from_value(result).map_err(|e| RpcError::Malformed {
            method: method.to_string(),
            detail: e.to_string(),
        })
    }

    /// One HTTP request carrying an array of sub-requests. Results come
    /// back in input order; any sub-error fails the whole batch and the
    /// caller may retry individually.
    pub async fn batch_call(
        &self,
        calls: &[(&str, Value)],
    ) -> Result<Vec<Value>, RpcError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        let method = calls[0].0;

        let body: Vec<Value> = calls
            .iter()
            .enumerate()
            .map(|(id, (m, params))| {
                json!({"jsonrpc": "2.0", "id": id, "method": m, "params": params})
            })
            .collect();

        let raw = self.post(method, Value::Array(body)).await?;
        let entries = match raw {
            Value::Array(entries) => entries,
            other => {
                return Err(RpcError::Malformed {
                    method: method.to_string(),
                    detail: format!("batch response is not an array: {}", other),
                })
            }
        };

        if entries.len() != calls.len() {
            return Err(RpcError::Malformed {
                method: method.to_string(),
                detail: format!(
                    "batch returned {} results for {} requests",
                    entries.len(),
                    calls.len()
                ),
            });
        }

        let mut ordered: Vec<Option<Value>> = vec![None; calls.len()];
        for entry in entries {
            let parsed: JsonRpcResponse =
                serde_json::from_value(entry).map_err(|e| RpcError::Malformed {
                    method: method.to_string(),
                    detail: e.to_string(),
                })?;
            let id = parsed
                .id
                .as_ref()
                .and_then(Value::as_u64)
                .ok_or_else(|| RpcError::Malformed {
                    method: method.to_string(),
                    detail: "batch sub-response without numeric id".to_string(),
                })? as usize;
            if id >= calls.len() {
                return Err(RpcError::Malformed {
                    method: method.to_string(),
                    detail: format!("batch sub-response id {} out of range", id),
                });
            }
            if let Some(err) = parsed.error {
                return Err(RpcError::Rpc {
                    method: calls[id].0.to_string(),
                    code: err.code,
                    message: err.message,
                });
            }
            ordered[id] = Some(parsed.result.unwrap_or(Value::Null));
        }

        ordered
            .into_iter()
            .map(|v| {
                v.ok_or_else(|| RpcError::Malformed {
                    method: method.to_string(),
                    detail: "batch sub-response missing".to_string(),
                })
            })
            .collect()
    }

    pub async fn get_block_count(&self) -> Result<i64, RpcError> {
        self.call("getblockcount", json!([])).await
    }

    pub async fn get_block_by_hash(
        &self,
        hash: &str,
        verbosity: u8,
    ) -> Result<RpcBlock, RpcError> {
        self.call("getblock", json!([hash, verbosity])).await
    }

    pub async fn get_block_by_height(
        &self,
        height: u32,
        verbosity: u8,
    ) -> Result<RpcBlock, RpcError> {
        // The daemon accepts a height rendered as a string in the hash slot.
        self.call("getblock", json!([height.to_string(), verbosity]))
            .await
    }

    pub async fn get_chain_tips(&self) -> Result<Vec<ChainTip>, RpcError> {
        self.call("getchaintips", json!([])).await
    }

    pub async fn get_raw_mempool(&self) -> Result<Vec<String>, RpcError> {
        self.call("getrawmempool", json!([])).await
    }

    pub async fn get_network_info(&self) -> Result<NetworkInfo, RpcError> {
        self.call("getnetworkinfo", json!([])).await
    }

    async fn batch_get_block_hashes(&self, heights: &[u32]) -> Result<Vec<String>, RpcError> {
        let calls: Vec<(&str, Value)> = heights
            .iter()
            .map(|h| ("getblockhash", json!([h])))
            .collect();
        let results = self.batch_call(&calls).await?;
        results
            .into_iter()
            .map(|v| {
                serde_json::from_value(v).map_err(|e| RpcError::Malformed {
                    method: "getblockhash".to_string(),
                    detail: e.to_string(),
                })
            })
            .collect()
    }

    /// Per-block fallback: verbosity 2, then verbosity 1.
    async fn fetch_block_with_fallback(&self, hash: &str) -> Result<RpcBlock, RpcError> {
        match self.get_block_by_hash(hash, 2).await {
            Ok(block) => Ok(block),
            Err(err) if err.is_transient() => Err(err),
            Err(err) => {
                tracing::debug!(
                    hash = %crate::telemetry::truncate_hex(hash, 16),
                    error = %err,
                    "verbosity-2 fetch failed, falling back to verbosity 1"
                );
                self.get_block_by_hash(hash, 1).await
            }
        }
    }
}

impl ChainRpc for RpcClient {
    async fn get_blockchain_info(&self) -> Result<BlockchainInfo, RpcError> {
        self.call("getblockchaininfo", json!([])).await
    }

    async fn get_block_hash(&self, height: u32) -> Result<String, RpcError> {
        self.call("getblockhash", json!([height])).await
    }

    async fn batch_get_blocks(&self, heights: &[u32]) -> Result<Vec<RpcBlock>, RpcError> {
        if heights.is_empty() {
            return Ok(Vec::new());
        }

        let hashes = self.batch_get_block_hashes(heights).await?;

        // One batch at full verbosity first; blocks with node transactions
        // can make the daemon error, in which case every block in the range
        // is refetched individually with its own fallback chain.
        let calls: Vec<(&str, Value)> = hashes
            .iter()
            .map(|h| ("getblock", json!([h, 2])))
            .collect();

        match self.batch_call(&calls).await {
            Ok(results) => {
                let mut blocks = Vec::with_capacity(results.len());
                for v in results {
                    let block: RpcBlock =
                        serde_json::from_value(v).map_err(|e| RpcError::Malformed {
                            method: "getblock".to_string(),
                            detail: e.to_string(),
                        })?;
                    blocks.push(block);
                }
                Ok(blocks)
            }
            Err(err) if err.is_transient() => Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "batch getblock failed, refetching per block");
                stream::iter(hashes.iter())
                    .map(|hash| async move { self.fetch_block_with_fallback(hash).await })
                    .buffered(FALLBACK_WORKERS)
                    .collect::<Vec<_>>()
                    .await
                    .into_iter()
                    .collect()
            }
        }
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<RpcTransaction, RpcError> {
        self.call("getrawtransaction", json!([txid, 1])).await
    }

    async fn list_flux_nodes(&self) -> Result<Vec<FluxNodeEntry>, RpcError> {
        self.call("listfluxnodes", json!([])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blockchain_info_decodes() {
        let raw = serde_json::json!({
            "chain": "main",
            "blocks": 1500000,
            "headers": 1500123,
            "bestblockhash": "00".repeat(32),
            "difficulty": 12345.6,
            "valuePools": [
                {"id": "transparent", "chainValue": 312345678.5, "chainValueZat": 31234567850000000i64},
                {"id": "sapling", "chainValue": 1000.0}
            ]
        });
        let info: BlockchainInfo = serde_json::from_value(raw).unwrap();
        assert_eq!(info.blocks, 1_500_000);
        assert_eq!(info.pool_value("transparent"), Some(31_234_567_850_000_000));
        assert_eq!(info.pool_value("sapling"), Some(1_000 * COIN));
        assert_eq!(info.pool_value("sprout"), None);
    }

    #[test]
    fn block_tx_decodes_both_verbosities() {
        let v2 = serde_json::json!({
            "hash": "aa".repeat(32),
            "height": 7,
            "size": 300,
            "version": 4,
            "merkleroot": "bb".repeat(32),
            "time": 1700000000,
            "tx": [{"txid": "cc".repeat(32), "version": 1, "vin": [{"coinbase": "04ff"}],
                    "vout": [{"value": 75.0, "valueZat": 7500000000i64, "n": 0,
                              "scriptPubKey": {"hex": "76a914", "type": "pubkeyhash",
                                               "addresses": ["t1example"]}}]}]
        });
        let block: RpcBlock = serde_json::from_value(v2).unwrap();
        match &block.tx[0] {
            RpcBlockTx::Full(tx) => {
                assert!(tx.vin[0].is_coinbase());
                assert_eq!(tx.vout[0].value_sat(), 75 * COIN);
            }
            other => panic!("expected full tx, got {:?}", other),
        }

        let v1 = serde_json::json!({
            "hash": "aa".repeat(32),
            "height": 7,
            "time": 1700000000,
            "tx": ["cc".repeat(32)]
        });
        let block: RpcBlock = serde_json::from_value(v1).unwrap();
        assert!(matches!(&block.tx[0], RpcBlockTx::Id(_)));
    }

    #[test]
    fn vout_value_fallback_chain() {
        let zat: RpcVout = serde_json::from_value(serde_json::json!({
            "value": 1.0, "valueZat": 99, "n": 0, "scriptPubKey": {"hex": ""}
        }))
        .unwrap();
        assert_eq!(zat.value_sat(), 99);

        let sat: RpcVout = serde_json::from_value(serde_json::json!({
            "value": 1.0, "valueSat": 98, "n": 0, "scriptPubKey": {"hex": ""}
        }))
        .unwrap();
        assert_eq!(sat.value_sat(), 98);

        let float_only: RpcVout = serde_json::from_value(serde_json::json!({
            "value": 1.5, "n": 0, "scriptPubKey": {"hex": ""}
        }))
        .unwrap();
        assert_eq!(float_only.value_sat(), 150_000_000);
    }

    #[test]
    fn error_taxonomy_distinguishes_timeout() {
        let timeout = RpcError::Timeout {
            method: "getblock".into(),
        };
        let transport = RpcError::Transport {
            method: "getblock".into(),
            detail: "connection refused".into(),
        };
        let rpc = RpcError::Rpc {
            method: "getblock".into(),
            code: -32600,
            message: "bad".into(),
        };
        assert!(timeout.is_transient());
        assert!(transport.is_transient());
        assert!(!rpc.is_transient());
        assert_eq!(rpc.method(), "getblock");
    }
}
