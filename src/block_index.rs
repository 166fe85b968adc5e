/// Block indexer: normalizes one RPC block into row batches for every
/// materialized table.
///
/// Verbosity-2 blocks carry full transaction objects; for verbosity-1
/// blocks every transaction is fetched individually. Derived fields
/// (coinbase flag, shielded-only flag, producer identity, reward
/// breakdown, node-tx subtype) are computed here; the bulk loader owns
/// buffering and summary deltas.

use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

use crate::bulk_loader::{BulkLoader, LoaderError};
use crate::node_tx::{parse_node_tx, NodeTx, StartDialect};
use crate::rewards;
use crate::rpc::{ChainRpc, RpcBlock, RpcBlockTx, RpcError, RpcTransaction};
use crate::script_utils;
use crate::telemetry::truncate_hex;
use crate::types::{
    AddressTxRow, BlockRow, CoinbaseOutput, Direction, FluxNodeTxRow, NodeTxSubtype, OutPoint,
    RewardLabel, Tier, TxParticipantsRow, TxRow, SENTINEL_NONSTANDARD,
};

#[derive(Debug)]
pub enum IndexError {
    Rpc(RpcError),
    Loader(LoaderError),
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::Rpc(e) => write!(f, "{}", e),
            IndexError::Loader(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for IndexError {}

impl From<RpcError> for IndexError {
    fn from(e: RpcError) -> Self {
        IndexError::Rpc(e)
    }
}

impl From<LoaderError> for IndexError {
    fn from(e: LoaderError) -> Self {
        IndexError::Loader(e)
    }
}

/// Sentinels never participate in summaries or the richlist.
pub fn is_real_address(address: &str) -> bool {
    !address.is_empty()
        && address != SENTINEL_NONSTANDARD
        && address != crate::types::SENTINEL_SHIELDED
}

/// Address + script type for one output, from the daemon's fields when
/// present, otherwise from classifying the script ourselves.
fn output_address(vout: &crate::rpc::RpcVout) -> (String, String) {
    if let Some(addresses) = &vout.script_pub_key.addresses {
        if let Some(first) = addresses.first() {
            let script_type = vout
                .script_pub_key
                .script_type
                .clone()
                .unwrap_or_else(|| "pubkeyhash".to_string());
            return (first.clone(), script_type);
        }
    }
    let class = script_utils::classify_script_hex(&vout.script_pub_key.hex);
    match class.address() {
        Some(addr) => (addr.to_string(), class.type_name().to_string()),
        None => (
            SENTINEL_NONSTANDARD.to_string(),
            class.type_name().to_string(),
        ),
    }
}

pub struct BlockIndexer {
    /// Fast-sync mode: suppress AddressSummary and TransactionParticipants
    /// updates so they can be rebuilt in bulk after catch-up.
    skip_summaries: bool,
}

impl BlockIndexer {
    pub fn new() -> Self {
        Self {
            skip_summaries: false,
        }
    }

    pub fn set_skip_summaries(&mut self, skip: bool) {
        self.skip_summaries = skip;
    }

    pub fn skip_summaries(&self) -> bool {
        self.skip_summaries
    }

    /// Index one block into the loader's buffers.
    pub async fn index_block<R: ChainRpc>(
        &self,
        block: &RpcBlock,
        rpc: &R,
        loader: &mut BulkLoader,
    ) -> Result<(), IndexError> {
        let track = !self.skip_summaries;
        let transactions = self.materialize_transactions(block, rpc).await?;

        let mut transparent_delta: i64 = 0;
        let mut coinbase_outputs: Vec<CoinbaseOutput> = Vec::new();
        let mut producer: Option<String> = None;
        let mut reward = RewardTotals::default();

        for (index, tx) in transactions.iter().enumerate() {
            let is_coinbase = index == 0 || self.looks_like_coinbase(tx, block.height);

            // Node transactions are recognized from the raw hex; a parse
            // failure is logged and the transaction treated as non-node.
            let node_tx = match &tx.hex {
                Some(hex) => match parse_node_tx(hex) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        debug!(
                            txid = %truncate_hex(&tx.txid, 16),
                            error = %e,
                            "node-tx parse failed, treating as non-node"
                        );
                        NodeTx::NotNodeTx
                    }
                },
                None => NodeTx::NotNodeTx,
            };

            // Node transactions also have no transparent ins/outs; the
            // shielded flag is reserved for genuine pool-only transfers.
            let is_shielded = tx.is_shielded() && matches!(node_tx, NodeTx::NotNodeTx);

            // Outputs first so later inputs in this block resolve from
            // the cache.
            let mut value_out: i64 = 0;
            let mut received: HashMap<String, i64> = HashMap::new();
            let mut output_addresses: Vec<String> = Vec::new();
            for vout in &tx.vout {
                let (address, script_type) = output_address(vout);
                let value = vout.value_sat();
                value_out += value;
                transparent_delta += value;
                *received.entry(address.clone()).or_insert(0) += value;
                if !output_addresses.contains(&address) {
                    output_addresses.push(address.clone());
                }
                loader.create_utxo(
                    &tx.txid,
                    vout.n,
                    address,
                    value,
                    script_type,
                    block.height,
                    block.time,
                    track,
                );
            }

            // Inputs: flip the producing UTXOs to spent. Inputs without a
            // prior outpoint (coinbase, shielded synthetics) are skipped.
            let mut value_in: i64 = 0;
            let mut sent: HashMap<String, i64> = HashMap::new();
            let mut input_addresses: Vec<String> = Vec::new();
            for vin in &tx.vin {
                let Some((prev_txid, prev_vout)) = vin.prev_outpoint() else {
                    continue;
                };
                let outpoint = OutPoint::new(prev_txid, prev_vout);
                let produced = self
                    .spend_with_retry(loader, &outpoint, &tx.txid, block.height, block.time, track)
                    .await?;
                value_in += produced.value;
                transparent_delta -= produced.value;
                *sent.entry(produced.address.clone()).or_insert(0) += produced.value;
                if !input_addresses.contains(&produced.address) {
                    input_addresses.push(produced.address.clone());
                }
            }

            let fee = if is_coinbase || value_in == 0 {
                0
            } else {
                value_in - value_out
            };

            // Per-(tx, address) history rows.
            let mut participants: Vec<String> = received.keys().cloned().collect();
            for addr in sent.keys() {
                if !received.contains_key(addr) {
                    participants.push(addr.clone());
                }
            }
            for address in &participants {
                if !is_real_address(address) {
                    continue;
                }
                let r = *received.get(address).unwrap_or(&0);
                let s = *sent.get(address).unwrap_or(&0);
                let row = AddressTxRow {
                    address: address.clone(),
                    txid: tx.txid.clone(),
                    height: block.height,
                    time: block.time,
                    block_hash: block.hash.clone(),
                    direction: if r >= s {
                        Direction::Received
                    } else {
                        Direction::Sent
                    },
                    received: r,
                    sent: s,
                };
                loader.add_address_tx(&row, track)?;
            }

            if track {
                loader.add_participants(&TxParticipantsRow {
                    txid: tx.txid.clone(),
                    input_count: input_addresses.len() as u32,
                    output_count: output_addresses.len() as u32,
                    input_addresses,
                    output_addresses,
                })?;
            }

            // Coinbase outputs drive the producer identity and the reward
            // breakdown for the block row.
            if is_coinbase {
                for vout in &tx.vout {
                    let (address, _) = output_address(vout);
                    let value = vout.value_sat();
                    let label = rewards::label(value, block.height);
                    match label {
                        RewardLabel::Mining => {
                            reward.mining += value;
                            if producer.is_none() && is_real_address(&address) {
                                producer = Some(address.clone());
                            }
                        }
                        RewardLabel::Foundation => reward.foundation += value,
                        RewardLabel::Cumulus => reward.cumulus += value,
                        RewardLabel::Nimbus => reward.nimbus += value,
                        RewardLabel::Stratus => reward.stratus += value,
                        RewardLabel::Unknown => {}
                    }
                    coinbase_outputs.push(CoinbaseOutput {
                        address: if is_real_address(&address) {
                            Some(address)
                        } else {
                            None
                        },
                        value,
                        label,
                    });
                }
            }

            let (is_node_tx, node_subtype) = self.record_node_tx(&node_tx, tx, block, loader)?;

            loader.add_tx(
                index as u32,
                &TxRow {
                    txid: tx.txid.clone(),
                    height: block.height,
                    block_hash: block.hash.clone(),
                    time: block.time,
                    version: tx.version,
                    size: tx
                        .size
                        .or_else(|| tx.hex.as_ref().map(|h| (h.len() / 2) as u32))
                        .unwrap_or(0),
                    vin_count: tx.vin.len() as u32,
                    vout_count: tx.vout.len() as u32,
                    value_in,
                    value_out,
                    fee,
                    is_coinbase,
                    is_shielded,
                    is_node_tx,
                    node_subtype,
                },
            )?;

            loader.maybe_spill().await?;
        }

        if let Some(ref producer_address) = producer {
            loader.add_producer(producer_address, reward.mining, block.height);
        }

        loader.add_block(&BlockRow {
            height: block.height,
            hash: block.hash.clone(),
            prev_hash: block.previousblockhash.clone(),
            time: block.time,
            size: block.size,
            version: block.version,
            merkle_root: block.merkleroot.clone(),
            difficulty: block.difficulty,
            tx_count: transactions.len() as u32,
            producer,
            reward_mining: reward.mining,
            reward_foundation: reward.foundation,
            reward_cumulus: reward.cumulus,
            reward_nimbus: reward.nimbus,
            reward_stratus: reward.stratus,
            coinbase_outputs,
        })?;

        loader.add_supply(
            block.height,
            transparent_delta,
            block.pool_value("sapling").unwrap_or(0),
            block.pool_value("sprout").unwrap_or(0),
        )?;

        Ok(())
    }

    /// Verbosity 2 gives full objects; otherwise fetch each transaction.
    async fn materialize_transactions<R: ChainRpc>(
        &self,
        block: &RpcBlock,
        rpc: &R,
    ) -> Result<Vec<RpcTransaction>, IndexError> {
        let mut transactions = Vec::with_capacity(block.tx.len());
        for entry in &block.tx {
            match entry {
                RpcBlockTx::Full(tx) => transactions.push(tx.clone()),
                RpcBlockTx::Id(txid) => {
                    transactions.push(rpc.get_raw_transaction(txid).await?);
                }
            }
        }
        Ok(transactions)
    }

    /// A missing outpoint may still be queued in the async inserter:
    /// drain once and retry before declaring the batch failed.
    async fn spend_with_retry(
        &self,
        loader: &mut BulkLoader,
        outpoint: &OutPoint,
        spending_txid: &str,
        height: u32,
        time: i64,
        track: bool,
    ) -> Result<crate::types::UtxoRow, IndexError> {
        match loader.spend_utxo(outpoint, spending_txid, height, time, track) {
            Ok(row) => Ok(row),
            Err(LoaderError::UnknownOutpoint(_)) => {
                warn!(
                    outpoint = %outpoint,
                    spender = %truncate_hex(spending_txid, 16),
                    "outpoint missing, draining inserter and retrying"
                );
                loader.drain_inserter().await?;
                Ok(loader.spend_utxo(outpoint, spending_txid, height, time, track)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Non-first transactions with no standard inputs can still be a
    /// coinbase when an output matches a known reward amount.
    fn looks_like_coinbase(&self, tx: &RpcTransaction, height: u32) -> bool {
        !tx.vin.is_empty()
            && tx.vin.iter().all(|vin| vin.prev_outpoint().is_none())
            && tx
                .vout
                .iter()
                .any(|vout| rewards::is_reward_amount(vout.value_sat(), height))
    }

    fn record_node_tx(
        &self,
        node_tx: &NodeTx,
        tx: &RpcTransaction,
        block: &RpcBlock,
        loader: &mut BulkLoader,
    ) -> Result<(bool, Option<NodeTxSubtype>), IndexError> {
        let raw_hex = tx.hex.clone().unwrap_or_default();
        let row = match node_tx {
            NodeTx::NotNodeTx => return Ok((false, None)),
            NodeTx::LegacyV3 { .. } => FluxNodeTxRow {
                txid: tx.txid.clone(),
                height: block.height,
                time: block.time,
                version: 3,
                subtype: NodeTxSubtype::Legacy,
                collateral_txid: String::new(),
                collateral_vout: 0,
                ip: None,
                public_key: None,
                collateral_pubkey: None,
                redeem_script: None,
                p2sh_address: None,
                signature: None,
                sig_time: None,
                tier: None,
                benchmark_tier_byte: None,
                benchmark_sig_time: None,
                benchmark_signature: None,
                update_type: None,
                delegate_keys: Vec::new(),
                raw_hex,
            },
            NodeTx::Start(start) => {
                // A start does not carry a tier; infer it from the
                // collateral value when the outpoint resolves.
                let tier = loader
                    .resolve_outpoint(&start.collateral)?
                    .and_then(|utxo| rewards::tier_from_collateral(utxo.value));

                let (public_key, collateral_pubkey, redeem_script, p2sh_address) =
                    match &start.dialect {
                        StartDialect::Normal {
                            collateral_pubkey,
                            pubkey,
                        } => (
                            Some(hex::encode(pubkey)),
                            Some(hex::encode(collateral_pubkey)),
                            None,
                            None,
                        ),
                        StartDialect::P2sh {
                            pubkey,
                            redeem_script,
                        } => (
                            Some(hex::encode(pubkey)),
                            None,
                            Some(hex::encode(redeem_script)),
                            Some(script_utils::redeem_script_to_address(redeem_script)),
                        ),
                    };

                FluxNodeTxRow {
                    txid: tx.txid.clone(),
                    height: block.height,
                    time: block.time,
                    version: start.version,
                    subtype: NodeTxSubtype::Start,
                    collateral_txid: start.collateral.txid.clone(),
                    collateral_vout: start.collateral.vout,
                    ip: None,
                    public_key,
                    collateral_pubkey,
                    redeem_script,
                    p2sh_address,
                    signature: Some(hex::encode(&start.signature)),
                    sig_time: Some(start.sig_time),
                    tier,
                    benchmark_tier_byte: None,
                    benchmark_sig_time: None,
                    benchmark_signature: None,
                    update_type: None,
                    delegate_keys: start.delegate_keys.iter().map(hex::encode).collect(),
                    raw_hex,
                }
            }
            NodeTx::Confirm(confirm) => FluxNodeTxRow {
                txid: tx.txid.clone(),
                height: block.height,
                time: block.time,
                version: confirm.version,
                subtype: NodeTxSubtype::Confirm,
                collateral_txid: confirm.collateral.txid.clone(),
                collateral_vout: confirm.collateral.vout,
                ip: Some(confirm.ip.clone()),
                public_key: None,
                collateral_pubkey: None,
                redeem_script: None,
                p2sh_address: None,
                signature: Some(hex::encode(&confirm.signature)),
                sig_time: Some(confirm.sig_time),
                tier: Tier::from_benchmark_byte(confirm.benchmark_tier),
                benchmark_tier_byte: Some(confirm.benchmark_tier),
                benchmark_sig_time: Some(confirm.benchmark_sig_time),
                benchmark_signature: Some(hex::encode(&confirm.benchmark_signature)),
                update_type: Some(confirm.update_type),
                delegate_keys: Vec::new(),
                raw_hex,
            },
        };

        let subtype = row.subtype;
        loader.add_fluxnode_tx(&row)?;
        Ok((true, Some(subtype)))
    }
}

impl Default for BlockIndexer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct RewardTotals {
    mining: i64,
    foundation: i64,
    cumulus: i64,
    nimbus: i64,
    stratus: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::testutil::{coinbase_tx, make_block, spend_tx, FixtureRpc};
    use crate::types::COIN;
    use tempfile::TempDir;

    async fn setup() -> (BulkLoader, Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let sink = store.spawn_sink();
        let loader = BulkLoader::new(store.clone(), sink).unwrap();
        (loader, store, dir)
    }

    #[tokio::test]
    async fn coinbase_block_derives_producer_and_reward() {
        let (mut loader, store, _dir) = setup().await;
        let rpc = FixtureRpc::new();
        let indexer = BlockIndexer::new();

        let coinbase = coinbase_tx(10, "t1miner", 75 * COIN, &[("t1stratus", 45 * COIN)]);
        let block = make_block(10, vec![coinbase], None);
        indexer.index_block(&block, &rpc, &mut loader).await.unwrap();
        loader.flush().await.unwrap();

        let row = store.block_by_height(10).unwrap().unwrap();
        assert_eq!(row.producer.as_deref(), Some("t1miner"));
        assert_eq!(row.reward_mining, 75 * COIN);
        assert_eq!(row.reward_stratus, 45 * COIN);
        assert_eq!(row.coinbase_outputs.len(), 2);

        let producer = store.producer("t1miner").unwrap().unwrap();
        assert_eq!(producer.blocks_produced, 1);
        assert_eq!(producer.total_reward, 75 * COIN);

        let coinbase_txid = store.block_txids(10).unwrap()[0].clone();
        let tx = store.transaction(&coinbase_txid).unwrap().unwrap();
        assert!(tx.is_coinbase);
        assert_eq!(tx.fee, 0);
    }

    #[tokio::test]
    async fn spend_attributes_sender_and_receiver() {
        let (mut loader, store, _dir) = setup().await;
        let rpc = FixtureRpc::new();
        let indexer = BlockIndexer::new();

        let coinbase = coinbase_tx(10, "t1alice", 100 * COIN, &[]);
        let coinbase_txid = coinbase.txid.clone();
        let block10 = make_block(10, vec![coinbase], None);
        indexer.index_block(&block10, &rpc, &mut loader).await.unwrap();
        loader.flush().await.unwrap();

        let coinbase12 = coinbase_tx(12, "t1miner", 75 * COIN, &[]);
        let spend = spend_tx(&coinbase_txid, 0, &[("t1bob", 100 * COIN)]);
        let spend_txid = spend.txid.clone();
        let block12 = make_block(12, vec![coinbase12, spend], None);
        indexer.index_block(&block12, &rpc, &mut loader).await.unwrap();
        loader.flush().await.unwrap();

        let utxo = store
            .utxo(&OutPoint::new(coinbase_txid, 0))
            .unwrap()
            .unwrap();
        assert!(utxo.spent);
        assert_eq!(utxo.spent_txid.as_deref(), Some(spend_txid.as_str()));
        assert_eq!(utxo.spent_height, Some(12));

        let alice = store.address_summary("t1alice").unwrap().unwrap();
        assert_eq!(alice.balance, 0);
        assert_eq!(alice.total_sent, 100 * COIN);
        assert_eq!(alice.tx_count, 2);

        let bob = store.address_summary("t1bob").unwrap().unwrap();
        assert_eq!(bob.balance, 100 * COIN);
        assert_eq!(bob.unspent_count, 1);

        let spend_row = store.transaction(&spend_txid).unwrap().unwrap();
        assert_eq!(spend_row.value_in, 100 * COIN);
        assert_eq!(spend_row.fee, 0);

        let participants = store.participants(&spend_txid).unwrap().unwrap();
        assert_eq!(participants.input_addresses, vec!["t1alice".to_string()]);
        assert_eq!(participants.output_addresses, vec!["t1bob".to_string()]);
    }

    #[tokio::test]
    async fn skip_summaries_suppresses_projections() {
        let (mut loader, store, _dir) = setup().await;
        let rpc = FixtureRpc::new();
        let mut indexer = BlockIndexer::new();
        indexer.set_skip_summaries(true);

        let coinbase = coinbase_tx(5, "t1fast", 150 * COIN, &[]);
        let txid = coinbase.txid.clone();
        let block = make_block(5, vec![coinbase], None);
        indexer.index_block(&block, &rpc, &mut loader).await.unwrap();
        loader.flush().await.unwrap();

        assert!(store.address_summary("t1fast").unwrap().is_none());
        assert!(store.participants(&txid).unwrap().is_none());
        // History rows and UTXOs still land.
        assert_eq!(store.address_txs_page("t1fast", None, 10).unwrap().len(), 1);
        assert_eq!(store.address_utxos("t1fast", true).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn verbosity_one_block_fetches_transactions() {
        let (mut loader, store, _dir) = setup().await;
        let indexer = BlockIndexer::new();

        let coinbase = coinbase_tx(7, "t1thin", 150 * COIN, &[]);
        let rpc = FixtureRpc::new();
        rpc.add_raw_tx(coinbase.clone());
        let thin = make_block(7, vec![coinbase], Some(true));

        indexer.index_block(&thin, &rpc, &mut loader).await.unwrap();
        loader.flush().await.unwrap();
        assert_eq!(store.block_by_height(7).unwrap().unwrap().tx_count, 1);
    }

    #[tokio::test]
    async fn node_transactions_materialize_ledger_rows() {
        let (mut loader, store, _dir) = setup().await;
        let rpc = FixtureRpc::new();
        let indexer = BlockIndexer::new();

        // Height 3 funds a CUMULUS-sized collateral.
        let cb3 = coinbase_tx(3, "t1op", 75 * COIN, &[("t1collateral", 1_000 * COIN)]);
        let collateral_txid = cb3.txid.clone();
        let block3 = make_block(3, vec![cb3], None);
        indexer.index_block(&block3, &rpc, &mut loader).await.unwrap();
        loader.flush().await.unwrap();

        // Height 4 carries the start and a confirm.
        let start = crate::testutil::node_tx(
            "start",
            6,
            crate::testutil::node_start_hex(&collateral_txid, 1),
        );
        let start_txid = start.txid.clone();
        let confirm = crate::testutil::node_tx(
            "confirm",
            6,
            crate::testutil::node_confirm_hex("203.0.113.9:16125", 2),
        );
        let confirm_txid = confirm.txid.clone();
        let cb4 = coinbase_tx(4, "t1op", 75 * COIN, &[]);
        let block4 = make_block(4, vec![cb4, start, confirm], None);
        indexer.index_block(&block4, &rpc, &mut loader).await.unwrap();
        loader.flush().await.unwrap();

        let start_row = store.fluxnode_tx(&start_txid).unwrap().unwrap();
        assert_eq!(start_row.subtype, crate::types::NodeTxSubtype::Start);
        assert_eq!(start_row.collateral_txid, collateral_txid);
        assert_eq!(start_row.collateral_vout, 1);
        // Tier inferred from the 1000-coin collateral.
        assert_eq!(start_row.tier, Some(Tier::Cumulus));
        assert!(start_row.public_key.is_some());

        let confirm_row = store.fluxnode_tx(&confirm_txid).unwrap().unwrap();
        assert_eq!(confirm_row.subtype, crate::types::NodeTxSubtype::Confirm);
        assert_eq!(confirm_row.ip.as_deref(), Some("203.0.113.9:16125"));
        assert_eq!(confirm_row.tier, Some(Tier::Nimbus));

        // The transaction rows carry the node flags, and a node tx is not
        // mistaken for a shielded transfer.
        let tx = store.transaction(&start_txid).unwrap().unwrap();
        assert!(tx.is_node_tx);
        assert_eq!(tx.node_subtype, Some(crate::types::NodeTxSubtype::Start));
        assert!(!tx.is_shielded);

        // Rollback indexing: both rows are found above height 3.
        assert_eq!(store.fluxnode_txids_above(3).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn shielded_transaction_flagged() {
        let (mut loader, store, _dir) = setup().await;
        let rpc = FixtureRpc::new();
        let indexer = BlockIndexer::new();

        let coinbase = coinbase_tx(9, "t1m", 150 * COIN, &[]);
        let shielded = RpcTransaction {
            txid: "5d".repeat(32),
            version: 4,
            size: Some(2000),
            hex: None,
            vin: vec![],
            vout: vec![],
        };
        let block = make_block(9, vec![coinbase, shielded], None);
        indexer.index_block(&block, &rpc, &mut loader).await.unwrap();
        loader.flush().await.unwrap();

        let row = store.transaction(&"5d".repeat(32)).unwrap().unwrap();
        assert!(row.is_shielded);
        assert!(!row.is_coinbase);
        assert!(!row.is_node_tx);
    }
}
