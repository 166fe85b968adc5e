/// Bulk loader: accumulates row batches across blocks and pushes them to
/// the store's async insert path.
///
/// - rows buffer per table and spill to the background inserter when a
///   size threshold is crossed; `flush()` submits the remainder, applies
///   summary/producer deltas, and takes the drain barrier
/// - a two-generation UTXO cache (current + previous batch) resolves
///   input lookups without round-tripping the store
/// - UTXO rows carry a version of (height << 24 | seq-in-block) so the
///   replacement row for a spend always outranks its create, and replays
///   of the same blocks produce identical rows

use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use crate::store::{ops, BulkSink, Store, StoreError, WriteOp};
use crate::types::{
    AddressSummaryRow, AddressTxRow, BlockRow, FluxNodeTxRow, OutPoint, ProducerRow,
    SupplyStatsRow, TxParticipantsRow, TxRow, UtxoRow,
};

/// Pending-op count that triggers a mid-batch spill to the inserter.
const SPILL_THRESHOLD: usize = 20_000;

/// Per-block sequence bits in the UTXO version.
const VERSION_SEQ_BITS: u32 = 24;

#[derive(Debug)]
pub enum LoaderError {
    UnknownOutpoint(OutPoint),
    Store(StoreError),
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoaderError::UnknownOutpoint(op) => {
                write!(f, "spend references unknown outpoint {}", op)
            }
            LoaderError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for LoaderError {}

impl From<StoreError> for LoaderError {
    fn from(e: StoreError) -> Self {
        LoaderError::Store(e)
    }
}

/// Per-address accumulation for one batch; merged into the stored summary
/// at flush and discarded.
#[derive(Debug, Default, Clone)]
struct SummaryDelta {
    balance: i64,
    received: i64,
    sent: i64,
    unspent: i64,
    tx_count: u64,
    first_height: Option<u32>,
    last_height: Option<u32>,
}

impl SummaryDelta {
    fn touch(&mut self, height: u32) {
        self.first_height = Some(self.first_height.map_or(height, |h| h.min(height)));
        self.last_height = Some(self.last_height.map_or(height, |h| h.max(height)));
    }
}

#[derive(Debug, Default, Clone)]
struct ProducerDelta {
    blocks: u64,
    reward: i64,
    first_height: Option<u32>,
    last_height: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FlushStats {
    pub ops: usize,
    pub utxo_rows: usize,
    pub addresses_touched: usize,
}

pub struct BulkLoader {
    store: Store,
    sink: BulkSink,

    pending_ops: Vec<WriteOp>,
    utxo_rows: HashMap<OutPoint, UtxoRow>,
    summary_deltas: HashMap<String, SummaryDelta>,
    producer_deltas: HashMap<String, ProducerDelta>,

    cache_current: HashMap<OutPoint, UtxoRow>,
    cache_previous: HashMap<OutPoint, UtxoRow>,

    version_height: u32,
    version_seq: u64,

    transparent_supply: i64,
}

impl BulkLoader {
    pub fn new(store: Store, sink: BulkSink) -> Result<Self, LoaderError> {
        let transparent_supply = store.latest_supply()?.map(|s| s.transparent).unwrap_or(0);
        Ok(Self {
            store,
            sink,
            pending_ops: Vec::new(),
            utxo_rows: HashMap::new(),
            summary_deltas: HashMap::new(),
            producer_deltas: HashMap::new(),
            cache_current: HashMap::new(),
            cache_previous: HashMap::new(),
            version_height: 0,
            version_seq: 0,
            transparent_supply,
        })
    }

    /// Deterministic version: (height << 24) | per-block sequence. Call
    /// order within a block is deterministic, so replays assign identical
    /// versions.
    fn next_version(&mut self, height: u32) -> u64 {
        if height != self.version_height {
            self.version_height = height;
            self.version_seq = 0;
        }
        let v = ((height as u64) << VERSION_SEQ_BITS) | self.version_seq;
        self.version_seq += 1;
        v
    }

    // -- row intake ---------------------------------------------------------

    pub fn add_block(&mut self, block: &BlockRow) -> Result<(), LoaderError> {
        self.pending_ops.extend(ops::put_block(block)?);
        Ok(())
    }

    pub fn add_tx(&mut self, index_in_block: u32, tx: &TxRow) -> Result<(), LoaderError> {
        self.pending_ops.extend(ops::put_tx(index_in_block, tx)?);
        Ok(())
    }

    /// New transparent output. Populates the in-batch cache so later
    /// spends in the same batch resolve without touching the store.
    pub fn create_utxo(
        &mut self,
        txid: &str,
        vout: u32,
        address: String,
        value: i64,
        script_type: String,
        height: u32,
        time: i64,
        track_summary: bool,
    ) {
        let version = self.next_version(height);
        let row = UtxoRow {
            txid: txid.to_string(),
            vout,
            address: address.clone(),
            value,
            script_type,
            height,
            time,
            spent: false,
            spent_txid: None,
            spent_height: None,
            spent_time: None,
            version,
        };
        let outpoint = OutPoint::new(txid, vout);
        self.cache_current.insert(outpoint.clone(), row.clone());
        self.utxo_rows.insert(outpoint, row);

        if track_summary && crate::block_index::is_real_address(&address) {
            let delta = self.summary_deltas.entry(address).or_default();
            delta.balance += value;
            delta.received += value;
            delta.unspent += 1;
            delta.touch(height);
        }
    }

    /// Resolve a prior outpoint: batch buffer, then the two cache
    /// generations, then the store.
    pub fn resolve_outpoint(&self, outpoint: &OutPoint) -> Result<Option<UtxoRow>, LoaderError> {
        if let Some(row) = self.utxo_rows.get(outpoint) {
            return Ok(Some(row.clone()));
        }
        if let Some(row) = self.cache_current.get(outpoint) {
            return Ok(Some(row.clone()));
        }
        if let Some(row) = self.cache_previous.get(outpoint) {
            return Ok(Some(row.clone()));
        }
        Ok(self.store.utxo(outpoint)?)
    }

    /// Flip an outpoint to spent, emitting the replacement row. Returns
    /// the pre-spend row so the indexer can attribute the value.
    pub fn spend_utxo(
        &mut self,
        outpoint: &OutPoint,
        spending_txid: &str,
        spend_height: u32,
        spend_time: i64,
        track_summary: bool,
    ) -> Result<UtxoRow, LoaderError> {
        let produced = self
            .resolve_outpoint(outpoint)?
            .ok_or_else(|| LoaderError::UnknownOutpoint(outpoint.clone()))?;

        let mut spent_row = produced.clone();
        spent_row.spent = true;
        spent_row.spent_txid = Some(spending_txid.to_string());
        spent_row.spent_height = Some(spend_height);
        spent_row.spent_time = Some(spend_time);
        spent_row.version = self.next_version(spend_height);

        self.cache_current
            .insert(outpoint.clone(), spent_row.clone());
        // The buffer keeps the highest-versioned row per outpoint; a spend
        // after a same-batch create replaces the create row entirely.
        self.utxo_rows.insert(outpoint.clone(), spent_row);

        if track_summary && crate::block_index::is_real_address(&produced.address) {
            let delta = self
                .summary_deltas
                .entry(produced.address.clone())
                .or_default();
            delta.balance -= produced.value;
            delta.sent += produced.value;
            delta.unspent -= 1;
            delta.touch(spend_height);
        }

        Ok(produced)
    }

    /// One (address, txid) history row; also counts toward the summary
    /// transaction counter.
    pub fn add_address_tx(
        &mut self,
        row: &AddressTxRow,
        track_summary: bool,
    ) -> Result<(), LoaderError> {
        self.pending_ops.push(ops::put_address_tx(row)?);
        if track_summary && crate::block_index::is_real_address(&row.address) {
            let delta = self.summary_deltas.entry(row.address.clone()).or_default();
            delta.tx_count += 1;
            delta.touch(row.height);
        }
        Ok(())
    }

    pub fn add_participants(&mut self, row: &TxParticipantsRow) -> Result<(), LoaderError> {
        self.pending_ops.push(ops::put_participants(row)?);
        Ok(())
    }

    pub fn add_fluxnode_tx(&mut self, row: &FluxNodeTxRow) -> Result<(), LoaderError> {
        self.pending_ops.extend(ops::put_fluxnode_tx(row)?);
        Ok(())
    }

    pub fn add_producer(&mut self, producer: &str, reward: i64, height: u32) {
        let delta = self.producer_deltas.entry(producer.to_string()).or_default();
        delta.blocks += 1;
        delta.reward += reward;
        delta.first_height = Some(delta.first_height.map_or(height, |h| h.min(height)));
        delta.last_height = Some(delta.last_height.map_or(height, |h| h.max(height)));
    }

    /// Record a supply checkpoint. `transparent_delta` is this block's
    /// Σ outputs − Σ resolved spends; pool values are daemon absolutes.
    pub fn add_supply(
        &mut self,
        height: u32,
        transparent_delta: i64,
        sapling: i64,
        sprout: i64,
    ) -> Result<(), LoaderError> {
        self.transparent_supply += transparent_delta;
        let row = SupplyStatsRow {
            height,
            transparent: self.transparent_supply,
            sapling,
            sprout,
        };
        self.pending_ops.push(ops::put_supply(&row)?);
        Ok(())
    }

    // -- lifecycle ----------------------------------------------------------

    /// Spill buffered row ops mid-batch once the threshold is crossed.
    /// Summary and producer deltas always wait for `flush()`.
    pub async fn maybe_spill(&mut self) -> Result<(), LoaderError> {
        if self.pending_ops.len() >= SPILL_THRESHOLD {
            let ops = std::mem::take(&mut self.pending_ops);
            debug!(ops = ops.len(), "spilling row batch to inserter");
            self.sink.submit(ops).await?;
        }
        Ok(())
    }

    fn drain_utxo_ops(&mut self) -> Result<(usize, Vec<WriteOp>), LoaderError> {
        let rows = std::mem::take(&mut self.utxo_rows);
        let count = rows.len();
        let mut batch = Vec::with_capacity(count * 3);
        for row in rows.values() {
            batch.extend(ops::put_utxo(row)?);
        }
        Ok((count, batch))
    }

    fn summary_ops(&mut self) -> Result<Vec<WriteOp>, LoaderError> {
        let deltas = std::mem::take(&mut self.summary_deltas);
        let mut batch = Vec::with_capacity(deltas.len());
        for (address, delta) in deltas {
            let mut row = self
                .store
                .address_summary(&address)?
                .unwrap_or(AddressSummaryRow {
                    address: address.clone(),
                    balance: 0,
                    tx_count: 0,
                    total_received: 0,
                    total_sent: 0,
                    unspent_count: 0,
                    first_seen_height: u32::MAX,
                    last_activity_height: 0,
                });
            row.balance += delta.balance;
            row.total_received += delta.received;
            row.total_sent += delta.sent;
            row.unspent_count = (row.unspent_count as i64 + delta.unspent).max(0) as u64;
            row.tx_count += delta.tx_count;
            if let Some(first) = delta.first_height {
                row.first_seen_height = row.first_seen_height.min(first);
            }
            if let Some(last) = delta.last_height {
                row.last_activity_height = row.last_activity_height.max(last);
            }
            batch.push(ops::put_address_summary(&row)?);
        }
        Ok(batch)
    }

    fn producer_ops(&mut self) -> Result<Vec<WriteOp>, LoaderError> {
        let deltas = std::mem::take(&mut self.producer_deltas);
        let mut batch = Vec::with_capacity(deltas.len());
        for (producer, delta) in deltas {
            let mut row = self.store.producer(&producer)?.unwrap_or(ProducerRow {
                producer: producer.clone(),
                blocks_produced: 0,
                total_reward: 0,
                first_height: u32::MAX,
                last_height: 0,
            });
            row.blocks_produced += delta.blocks;
            row.total_reward += delta.reward;
            if let Some(first) = delta.first_height {
                row.first_height = row.first_height.min(first);
            }
            if let Some(last) = delta.last_height {
                row.last_height = row.last_height.max(last);
            }
            batch.push(ops::put_producer(&row)?);
        }
        Ok(batch)
    }

    /// Batch boundary: submit everything buffered, apply deltas, then
    /// drain the inserter so the rows are durable before SyncState moves.
    /// Rotates the UTXO cache generations on success.
    pub async fn flush(&mut self) -> Result<FlushStats, LoaderError> {
        let mut stats = FlushStats::default();

        let row_ops = std::mem::take(&mut self.pending_ops);
        stats.ops += row_ops.len();
        self.sink.submit(row_ops).await?;

        let (utxo_count, utxo_ops) = self.drain_utxo_ops()?;
        stats.utxo_rows = utxo_count;
        stats.ops += utxo_ops.len();
        self.sink.submit(utxo_ops).await?;

        let summary_ops = self.summary_ops()?;
        stats.addresses_touched = summary_ops.len();
        stats.ops += summary_ops.len();
        self.sink.submit(summary_ops).await?;

        let producer_ops = self.producer_ops()?;
        stats.ops += producer_ops.len();
        self.sink.submit(producer_ops).await?;

        self.sink.drain().await?;

        self.cache_previous = std::mem::take(&mut self.cache_current);
        Ok(stats)
    }

    /// Drop everything buffered for the current batch (batch retry path)
    /// and re-seed the supply total from the store.
    pub fn abort_batch(&mut self) -> Result<(), LoaderError> {
        self.pending_ops.clear();
        self.utxo_rows.clear();
        self.summary_deltas.clear();
        self.producer_deltas.clear();
        self.cache_current.clear();
        self.transparent_supply = self
            .store
            .latest_supply()?
            .map(|s| s.transparent)
            .unwrap_or(0);
        Ok(())
    }

    /// Re-seed after a reorg rollback invalidated cached state.
    pub fn reset_after_reorg(&mut self) -> Result<(), LoaderError> {
        self.cache_previous.clear();
        self.abort_batch()
    }

    /// Drain the inserter without flushing buffers; the unknown-outpoint
    /// retry path waits on this before its second lookup.
    pub async fn drain_inserter(&self) -> Result<(), LoaderError> {
        Ok(self.sink.drain().await?)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}
