/// Shared row types for every materialized table, plus the handful of
/// enums the indexer dispatches on.
///
/// All amounts are integer minor units (1e-8 FLUX). Rows are stored with
/// bincode; the serde derives double for the JSON the API returns.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Minor units per coin.
pub const COIN: i64 = 100_000_000;

/// Address sentinel for outputs that only exist inside a value pool.
pub const SENTINEL_SHIELDED: &str = "shielded";
/// Address sentinel for scripts we cannot attribute to an address.
pub const SENTINEL_NONSTANDARD: &str = "nonstandard";

/// (txid, vout) identity of a transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: String,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: impl Into<String>, vout: u32) -> Self {
        Self {
            txid: txid.into(),
            vout,
        }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// FluxNode benchmark tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    Cumulus,
    Nimbus,
    Stratus,
}

impl Tier {
    /// Tier byte carried by node-confirm messages: 1/2/3.
    pub fn from_benchmark_byte(b: i8) -> Option<Self> {
        match b {
            1 => Some(Tier::Cumulus),
            2 => Some(Tier::Nimbus),
            3 => Some(Tier::Stratus),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Cumulus => write!(f, "CUMULUS"),
            Tier::Nimbus => write!(f, "NIMBUS"),
            Tier::Stratus => write!(f, "STRATUS"),
        }
    }
}

/// Subtype tag stored on transactions the node-tx parser accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeTxSubtype {
    Start,
    Confirm,
    Legacy,
}

impl fmt::Display for NodeTxSubtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeTxSubtype::Start => write!(f, "start"),
            NodeTxSubtype::Confirm => write!(f, "confirm"),
            NodeTxSubtype::Legacy => write!(f, "legacy"),
        }
    }
}

/// Classification of a single coinbase output by the reward-label rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewardLabel {
    Mining,
    Foundation,
    Cumulus,
    Nimbus,
    Stratus,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinbaseOutput {
    pub address: Option<String>,
    pub value: i64,
    pub label: RewardLabel,
}

/// One row per canonical block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRow {
    pub height: u32,
    pub hash: String,
    pub prev_hash: Option<String>,
    pub time: i64,
    pub size: u32,
    pub version: i32,
    pub merkle_root: String,
    pub difficulty: f64,
    pub tx_count: u32,
    /// Address the reward-label rule classified as MINING, if any.
    pub producer: Option<String>,
    pub reward_mining: i64,
    pub reward_foundation: i64,
    pub reward_cumulus: i64,
    pub reward_nimbus: i64,
    pub reward_stratus: i64,
    pub coinbase_outputs: Vec<CoinbaseOutput>,
}

/// One row per transaction, inserted with its block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRow {
    pub txid: String,
    pub height: u32,
    pub block_hash: String,
    pub time: i64,
    pub version: i32,
    pub size: u32,
    pub vin_count: u32,
    pub vout_count: u32,
    pub value_in: i64,
    pub value_out: i64,
    pub fee: i64,
    pub is_coinbase: bool,
    pub is_shielded: bool,
    pub is_node_tx: bool,
    pub node_subtype: Option<NodeTxSubtype>,
}

/// Transparent output, flipped to spent when consumed.
///
/// `version` implements the store's merge-on-replace contract: the
/// effective row for a (txid, vout) is the highest-versioned one, and the
/// bulk loader assigns versions so a spend always outranks its create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtxoRow {
    pub txid: String,
    pub vout: u32,
    pub address: String,
    pub value: i64,
    pub script_type: String,
    pub height: u32,
    pub time: i64,
    pub spent: bool,
    pub spent_txid: Option<String>,
    pub spent_height: Option<u32>,
    pub spent_time: Option<i64>,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Received,
    Sent,
}

/// One row per (address, txid) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressTxRow {
    pub address: String,
    pub txid: String,
    pub height: u32,
    pub time: i64,
    pub block_hash: String,
    pub direction: Direction,
    pub received: i64,
    pub sent: i64,
}

/// Incrementally maintained per-address rollup; rebuildable from UTXOs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressSummaryRow {
    pub address: String,
    pub balance: i64,
    pub tx_count: u64,
    pub total_received: i64,
    pub total_sent: i64,
    pub unspent_count: u64,
    pub first_seen_height: u32,
    pub last_activity_height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxParticipantsRow {
    pub txid: String,
    pub input_addresses: Vec<String>,
    pub output_addresses: Vec<String>,
    pub input_count: u32,
    pub output_count: u32,
}

/// Decoded node-registration (start) or node-confirmation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FluxNodeTxRow {
    pub txid: String,
    pub height: u32,
    pub time: i64,
    pub version: i32,
    pub subtype: NodeTxSubtype,
    pub collateral_txid: String,
    pub collateral_vout: u32,
    pub ip: Option<String>,
    pub public_key: Option<String>,
    pub collateral_pubkey: Option<String>,
    pub redeem_script: Option<String>,
    pub p2sh_address: Option<String>,
    pub signature: Option<String>,
    pub sig_time: Option<u32>,
    pub tier: Option<Tier>,
    pub benchmark_tier_byte: Option<i8>,
    pub benchmark_sig_time: Option<u32>,
    pub benchmark_signature: Option<String>,
    /// Opaque signed byte; downstream consumers only log it.
    pub update_type: Option<i8>,
    pub delegate_keys: Vec<String>,
    pub raw_hex: String,
}

/// Per-block supply checkpoint; transparent is cumulative, pool values are
/// the absolute chain values reported by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplyStatsRow {
    pub height: u32,
    pub transparent: i64,
    pub sapling: i64,
    pub sprout: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerRow {
    pub producer: String,
    pub blocks_produced: u64,
    pub total_reward: i64,
    pub first_height: u32,
    pub last_height: u32,
}

/// Singleton sync cursor. `current_height` is -1 before genesis lands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStateRow {
    pub current_height: i64,
    pub last_block_hash: String,
    pub chain_height: i64,
    pub is_syncing: bool,
    pub last_sync_time: i64,
    pub fast_sync: bool,
}

impl Default for SyncStateRow {
    fn default() -> Self {
        Self {
            current_height: -1,
            last_block_hash: String::new(),
            chain_height: 0,
            is_syncing: false,
            last_sync_time: 0,
            fast_sync: false,
        }
    }
}

/// Append-only reorg audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReorgEventRow {
    pub id: u64,
    pub from_height: u32,
    pub to_height: u32,
    pub common_ancestor: u32,
    pub old_hash: String,
    pub new_hash: String,
    pub blocks_affected: u32,
    pub occurred_at: i64,
}

/// Current FluxNode ledger entry, refreshed by the secondary sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FluxNodeRow {
    pub ip: String,
    pub tier: Option<Tier>,
    pub payment_address: String,
    pub txid: String,
    pub vout: u32,
    pub added_height: u32,
    pub confirmed_height: u32,
    pub last_confirmed_height: u32,
    pub last_paid_height: u32,
    pub rank: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_from_benchmark_byte() {
        assert_eq!(Tier::from_benchmark_byte(1), Some(Tier::Cumulus));
        assert_eq!(Tier::from_benchmark_byte(2), Some(Tier::Nimbus));
        assert_eq!(Tier::from_benchmark_byte(3), Some(Tier::Stratus));
        assert_eq!(Tier::from_benchmark_byte(0), None);
        assert_eq!(Tier::from_benchmark_byte(-1), None);
    }

    #[test]
    fn tier_display() {
        assert_eq!(Tier::Stratus.to_string(), "STRATUS");
    }

    #[test]
    fn outpoint_display() {
        let op = OutPoint::new("ab".repeat(32), 3);
        assert!(op.to_string().ends_with(":3"));
    }
}
