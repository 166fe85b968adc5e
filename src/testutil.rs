/// Test fixtures: a scripted in-memory daemon implementing `ChainRpc`
/// plus builders for deterministic blocks and transactions.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use crate::rpc::{
    BlockchainInfo, ChainRpc, FluxNodeEntry, RpcBlock, RpcBlockTx, RpcError, RpcScriptPubKey,
    RpcTransaction, RpcVin, RpcVout, ValuePool,
};
use crate::types::COIN;

pub fn hash_of(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())
}

/// Deterministic block hash; `salt` distinguishes fork branches.
pub fn block_hash(height: u32, salt: u8) -> String {
    hash_of(&["block", &height.to_string(), &salt.to_string()])
}

pub fn coinbase_txid(height: u32, producer: &str) -> String {
    hash_of(&["coinbase", &height.to_string(), producer])
}

fn vout(n: u32, address: &str, value: i64) -> RpcVout {
    RpcVout {
        value: value as f64 / COIN as f64,
        value_zat: Some(value),
        value_sat_field: None,
        n,
        script_pub_key: RpcScriptPubKey {
            hex: String::new(),
            script_type: Some("pubkeyhash".to_string()),
            addresses: Some(vec![address.to_string()]),
        },
    }
}

/// Coinbase paying `producer` the mining amount plus extra labelled
/// outputs (tier / foundation payouts).
pub fn coinbase_tx(
    height: u32,
    producer: &str,
    mining_value: i64,
    extra: &[(&str, i64)],
) -> RpcTransaction {
    let mut vouts = vec![vout(0, producer, mining_value)];
    for (i, (address, value)) in extra.iter().enumerate() {
        vouts.push(vout(i as u32 + 1, address, *value));
    }
    RpcTransaction {
        txid: coinbase_txid(height, producer),
        version: 4,
        size: Some(200),
        hex: None,
        vin: vec![RpcVin {
            coinbase: Some(format!("{:08x}", height)),
            txid: None,
            vout: None,
            sequence: Some(u64::MAX),
        }],
        vout: vouts,
    }
}

/// Spend of one prior outpoint into the given outputs.
pub fn spend_tx(prev_txid: &str, prev_vout: u32, outputs: &[(&str, i64)]) -> RpcTransaction {
    let mut parts = vec!["spend".to_string(), prev_txid.to_string(), prev_vout.to_string()];
    for (address, value) in outputs {
        parts.push(format!("{}:{}", address, value));
    }
    let part_refs: Vec<&str> = parts.iter().map(String::as_str).collect();
    let txid = hash_of(&part_refs);

    RpcTransaction {
        txid,
        version: 4,
        size: Some(250),
        hex: None,
        vin: vec![RpcVin {
            coinbase: None,
            txid: Some(prev_txid.to_string()),
            vout: Some(prev_vout),
            sequence: Some(0xFFFF_FFFF),
        }],
        vout: outputs
            .iter()
            .enumerate()
            .map(|(n, (address, value))| vout(n as u32, address, *value))
            .collect(),
    }
}

/// Wrap a raw node-transaction hex into an RPC transaction shape.
pub fn node_tx(txid_seed: &str, version: i32, raw_hex: String) -> RpcTransaction {
    RpcTransaction {
        txid: hash_of(&["nodetx", txid_seed]),
        version,
        size: Some((raw_hex.len() / 2) as u32),
        hex: Some(raw_hex),
        vin: vec![],
        vout: vec![],
    }
}

fn push_varbytes(buf: &mut Vec<u8>, data: &[u8]) {
    buf.push(data.len() as u8);
    buf.extend_from_slice(data);
}

/// Raw hex of a version-6 node-start message (normal dialect) whose
/// collateral outpoint references (txid, vout) in display order.
pub fn node_start_hex(collateral_txid: &str, vout: u32) -> String {
    let mut buf = Vec::new();
    buf.extend_from_slice(&6u32.to_le_bytes());
    buf.push(2); // nType start
    buf.extend_from_slice(&0x01u32.to_le_bytes()); // normal dialect
    let mut txid = hex::decode(collateral_txid).unwrap();
    txid.reverse(); // wire order
    buf.extend_from_slice(&txid);
    buf.extend_from_slice(&vout.to_le_bytes());
    push_varbytes(&mut buf, &[0x02; 33]); // collateral pubkey
    push_varbytes(&mut buf, &[0x03; 33]); // node pubkey
    buf.extend_from_slice(&1_700_000_000u32.to_le_bytes());
    push_varbytes(&mut buf, &[0xAA; 65]); // signature
    hex::encode(buf)
}

/// Raw hex of a version-6 node-confirm message.
pub fn node_confirm_hex(ip: &str, tier_byte: i8) -> String {
    let mut buf = Vec::new();
    buf.extend_from_slice(&6u32.to_le_bytes());
    buf.push(4); // nType confirm
    buf.extend_from_slice(&[0x44; 32]);
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&1_700_000_100u32.to_le_bytes());
    buf.push(tier_byte as u8);
    buf.extend_from_slice(&1_700_000_050u32.to_le_bytes());
    buf.push(1); // updateType
    push_varbytes(&mut buf, ip.as_bytes());
    push_varbytes(&mut buf, &[0xCC; 65]);
    push_varbytes(&mut buf, &[0xDD; 65]);
    hex::encode(buf)
}

pub fn make_block(height: u32, txs: Vec<RpcTransaction>, thin: Option<bool>) -> RpcBlock {
    make_block_with(height, 0, txs, thin.unwrap_or(false))
}

pub fn make_block_with(height: u32, salt: u8, txs: Vec<RpcTransaction>, thin: bool) -> RpcBlock {
    let prev = if height == 0 {
        None
    } else {
        Some(block_hash(height - 1, salt))
    };
    make_block_linked(height, salt, prev, txs, thin)
}

/// Fork branches need an explicit parent: the first post-fork block
/// chains onto the other branch's hash.
pub fn make_block_linked(
    height: u32,
    salt: u8,
    prev: Option<String>,
    txs: Vec<RpcTransaction>,
    thin: bool,
) -> RpcBlock {
    let tx = if thin {
        txs.iter()
            .map(|t| RpcBlockTx::Id(t.txid.clone()))
            .collect()
    } else {
        txs.into_iter().map(RpcBlockTx::Full).collect()
    };
    RpcBlock {
        hash: block_hash(height, salt),
        height,
        size: 1_000,
        version: 4,
        merkleroot: hash_of(&["merkle", &height.to_string(), &salt.to_string()]),
        tx,
        time: 1_700_000_000 + height as i64 * 120,
        difficulty: 1000.0,
        previousblockhash: prev,
        value_pools: Vec::new(),
    }
}

#[derive(Default)]
struct FixtureInner {
    blocks: BTreeMap<u32, RpcBlock>,
    raw_txs: HashMap<String, RpcTransaction>,
    headers_override: Option<i64>,
    daemon_blocks_override: Option<i64>,
    pools: Vec<ValuePool>,
    nodes: Vec<FluxNodeEntry>,
    /// Heights the fixture degrades to verbosity 1 in batch responses,
    /// emulating the client's per-block fallback.
    thin_heights: HashSet<u32>,
    /// Heights that error entirely.
    broken_heights: HashSet<u32>,
}

/// Scripted daemon. Interior-mutable so tests can rewind the chain and
/// present a fork mid-run.
pub struct FixtureRpc {
    inner: Mutex<FixtureInner>,
}

impl FixtureRpc {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FixtureInner::default()),
        }
    }

    pub fn add_block(&self, block: RpcBlock) {
        let mut inner = self.inner.lock().unwrap();
        for entry in &block.tx {
            if let RpcBlockTx::Full(tx) = entry {
                inner.raw_txs.insert(tx.txid.clone(), tx.clone());
            }
        }
        inner.blocks.insert(block.height, block);
    }

    pub fn add_raw_tx(&self, tx: RpcTransaction) {
        self.inner.lock().unwrap().raw_txs.insert(tx.txid.clone(), tx);
    }

    /// Drop every block above `height` (fork simulation step 1).
    pub fn rewind_to(&self, height: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.blocks.retain(|h, _| *h <= height);
    }

    pub fn set_headers(&self, headers: i64) {
        self.inner.lock().unwrap().headers_override = Some(headers);
    }

    pub fn set_daemon_blocks(&self, blocks: i64) {
        self.inner.lock().unwrap().daemon_blocks_override = Some(blocks);
    }

    pub fn set_pools(&self, pools: Vec<ValuePool>) {
        self.inner.lock().unwrap().pools = pools;
    }

    pub fn set_nodes(&self, nodes: Vec<FluxNodeEntry>) {
        self.inner.lock().unwrap().nodes = nodes;
    }

    pub fn serve_thin(&self, height: u32) {
        self.inner.lock().unwrap().thin_heights.insert(height);
    }

    pub fn break_height(&self, height: u32) {
        self.inner.lock().unwrap().broken_heights.insert(height);
    }

    fn thin_copy(block: &RpcBlock) -> RpcBlock {
        let mut thin = block.clone();
        thin.tx = block
            .tx
            .iter()
            .map(|entry| match entry {
                RpcBlockTx::Full(tx) => RpcBlockTx::Id(tx.txid.clone()),
                RpcBlockTx::Id(txid) => RpcBlockTx::Id(txid.clone()),
            })
            .collect();
        thin
    }
}

impl ChainRpc for FixtureRpc {
    async fn get_blockchain_info(&self) -> Result<BlockchainInfo, RpcError> {
        let inner = self.inner.lock().unwrap();
        let (tip_height, tip_hash) = inner
            .blocks
            .iter()
            .next_back()
            .map(|(h, b)| (*h as i64, b.hash.clone()))
            .unwrap_or((-1, String::new()));
        Ok(BlockchainInfo {
            chain: "main".to_string(),
            blocks: inner.daemon_blocks_override.unwrap_or(tip_height),
            headers: inner.headers_override.unwrap_or(tip_height),
            best_block_hash: tip_hash,
            difficulty: 1000.0,
            value_pools: inner.pools.clone(),
        })
    }

    async fn get_block_hash(&self, height: u32) -> Result<String, RpcError> {
        let inner = self.inner.lock().unwrap();
        inner
            .blocks
            .get(&height)
            .map(|b| b.hash.clone())
            .ok_or(RpcError::Rpc {
                method: "getblockhash".to_string(),
                code: -8,
                message: format!("Block height out of range: {}", height),
            })
    }

    async fn batch_get_blocks(&self, heights: &[u32]) -> Result<Vec<RpcBlock>, RpcError> {
        let inner = self.inner.lock().unwrap();
        let mut blocks = Vec::with_capacity(heights.len());
        for height in heights {
            if inner.broken_heights.contains(height) {
                return Err(RpcError::Rpc {
                    method: "getblock".to_string(),
                    code: -32603,
                    message: format!("cannot serialize block {}", height),
                });
            }
            let block = inner.blocks.get(height).ok_or(RpcError::Rpc {
                method: "getblock".to_string(),
                code: -8,
                message: format!("Block height out of range: {}", height),
            })?;
            if inner.thin_heights.contains(height) {
                blocks.push(Self::thin_copy(block));
            } else {
                blocks.push(block.clone());
            }
        }
        Ok(blocks)
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<RpcTransaction, RpcError> {
        let inner = self.inner.lock().unwrap();
        inner
            .raw_txs
            .get(txid)
            .cloned()
            .ok_or(RpcError::Rpc {
                method: "getrawtransaction".to_string(),
                code: -5,
                message: "No information available about transaction".to_string(),
            })
    }

    async fn list_flux_nodes(&self) -> Result<Vec<FluxNodeEntry>, RpcError> {
        Ok(self.inner.lock().unwrap().nodes.clone())
    }
}
