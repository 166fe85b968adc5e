/// The analytical store: embedded RocksDB, one column family per
/// materialized table plus narrow index families.
///
/// Write path: callers build `WriteOp` lists and hand them to the
/// `BulkSink`, a background inserter that commits each batch as a single
/// atomic WriteBatch. "Accepted into the queue" is success; `drain()` is
/// the barrier the sync engine takes before advancing SyncState.
///
/// Height keys are big-endian so iterator order is height order. Row
/// payloads are bincode.

use byteorder::{BigEndian, ByteOrder};
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{error, info};

use crate::types::{
    AddressSummaryRow, AddressTxRow, BlockRow, FluxNodeRow, FluxNodeTxRow, OutPoint, ProducerRow,
    ReorgEventRow, SupplyStatsRow, SyncStateRow, TxParticipantsRow, TxRow, UtxoRow,
};

pub const CF_BLOCKS: &str = "blocks";
pub const CF_BLOCK_HASH_INDEX: &str = "block_hash_index";
pub const CF_BLOCK_TXIDS: &str = "block_txids";
pub const CF_TRANSACTIONS: &str = "transactions";
pub const CF_UTXOS: &str = "utxos";
pub const CF_UTXOS_BY_HEIGHT: &str = "utxos_by_height";
pub const CF_SPENT_BY_HEIGHT: &str = "spent_by_height";
pub const CF_ADDRESS_UTXOS: &str = "address_utxos";
pub const CF_ADDRESS_TXS: &str = "address_txs";
pub const CF_ADDRESS_SUMMARY: &str = "address_summary";
pub const CF_TX_PARTICIPANTS: &str = "tx_participants";
pub const CF_FLUXNODE_TXS: &str = "fluxnode_txs";
pub const CF_FLUXNODE_TXS_BY_HEIGHT: &str = "fluxnode_txs_by_height";
pub const CF_PRODUCERS: &str = "producers";
pub const CF_SUPPLY: &str = "supply";
pub const CF_FLUXNODES: &str = "fluxnodes";
pub const CF_REORG_EVENTS: &str = "reorg_events";
pub const CF_STATE: &str = "state";

const COLUMN_FAMILIES: [&str; 18] = [
    CF_BLOCKS,
    CF_BLOCK_HASH_INDEX,
    CF_BLOCK_TXIDS,
    CF_TRANSACTIONS,
    CF_UTXOS,
    CF_UTXOS_BY_HEIGHT,
    CF_SPENT_BY_HEIGHT,
    CF_ADDRESS_UTXOS,
    CF_ADDRESS_TXS,
    CF_ADDRESS_SUMMARY,
    CF_TX_PARTICIPANTS,
    CF_FLUXNODE_TXS,
    CF_FLUXNODE_TXS_BY_HEIGHT,
    CF_PRODUCERS,
    CF_SUPPLY,
    CF_FLUXNODES,
    CF_REORG_EVENTS,
    CF_STATE,
];

const KEY_SYNC_STATE: &[u8] = b"sync_state";
const KEY_MIGRATIONS: &[u8] = b"schema_migrations";

/// Applied in order on first start; recorded in the state CF.
const SCHEMA_VERSIONS: [u32; 1] = [1];

#[derive(Debug)]
pub enum StoreError {
    Rocks(String),
    Codec(String),
    MissingCf(&'static str),
    Closed,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Rocks(e) => write!(f, "store error: {}", e),
            StoreError::Codec(e) => write!(f, "row codec error: {}", e),
            StoreError::MissingCf(cf) => write!(f, "column family not found: {}", cf),
            StoreError::Closed => write!(f, "bulk sink is closed"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Rocks(e.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for StoreError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        StoreError::Codec(e.to_string())
    }
}

fn enc<T: Serialize>(row: &T) -> Result<Vec<u8>, StoreError> {
    Ok(bincode::serialize(row)?)
}

fn dec<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(bincode::deserialize(bytes)?)
}

// ---------------------------------------------------------------------------
// Key encodings
// ---------------------------------------------------------------------------

pub fn height_key(height: u32) -> [u8; 4] {
    let mut key = [0u8; 4];
    BigEndian::write_u32(&mut key, height);
    key
}

pub fn decode_height_key(key: &[u8]) -> u32 {
    BigEndian::read_u32(&key[..4])
}

pub fn txid_key(txid: &str) -> Vec<u8> {
    hex::decode(txid).unwrap_or_else(|_| txid.as_bytes().to_vec())
}

pub fn outpoint_key(outpoint: &OutPoint) -> Vec<u8> {
    let mut key = txid_key(&outpoint.txid);
    key.extend_from_slice(&height_key(outpoint.vout));
    key
}

fn height_outpoint_key(height: u32, outpoint: &OutPoint) -> Vec<u8> {
    let mut key = height_key(height).to_vec();
    key.extend_from_slice(&outpoint_key(outpoint));
    key
}

fn addr_prefix(address: &str) -> Vec<u8> {
    let mut key = address.as_bytes().to_vec();
    key.push(0);
    key
}

fn addr_utxo_key(address: &str, outpoint: &OutPoint) -> Vec<u8> {
    let mut key = addr_prefix(address);
    key.extend_from_slice(&outpoint_key(outpoint));
    key
}

fn addr_tx_key(address: &str, height: u32, txid: &str) -> Vec<u8> {
    let mut key = addr_prefix(address);
    key.extend_from_slice(&height_key(height));
    key.extend_from_slice(&txid_key(txid));
    key
}

fn block_txid_key(height: u32, index: u32) -> Vec<u8> {
    let mut key = height_key(height).to_vec();
    key.extend_from_slice(&height_key(index));
    key
}

// ---------------------------------------------------------------------------
// Write operations
// ---------------------------------------------------------------------------

/// One store mutation; batches of these commit atomically.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put {
        cf: &'static str,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: &'static str,
        key: Vec<u8>,
    },
}

impl WriteOp {
    pub fn put<T: Serialize>(cf: &'static str, key: Vec<u8>, row: &T) -> Result<Self, StoreError> {
        Ok(WriteOp::Put {
            cf,
            key,
            value: enc(row)?,
        })
    }

    pub fn mark(cf: &'static str, key: Vec<u8>) -> Self {
        WriteOp::Put {
            cf,
            key,
            value: Vec::new(),
        }
    }
}

/// Op builders keep the key discipline in one file.
pub mod ops {
    use super::*;

    pub fn put_block(block: &BlockRow) -> Result<Vec<WriteOp>, StoreError> {
        Ok(vec![
            WriteOp::put(CF_BLOCKS, height_key(block.height).to_vec(), block)?,
            WriteOp::Put {
                cf: CF_BLOCK_HASH_INDEX,
                key: txid_key(&block.hash),
                value: height_key(block.height).to_vec(),
            },
        ])
    }

    pub fn put_tx(index_in_block: u32, tx: &TxRow) -> Result<Vec<WriteOp>, StoreError> {
        Ok(vec![
            WriteOp::put(CF_TRANSACTIONS, txid_key(&tx.txid), tx)?,
            WriteOp::Put {
                cf: CF_BLOCK_TXIDS,
                key: block_txid_key(tx.height, index_in_block),
                value: tx.txid.as_bytes().to_vec(),
            },
        ])
    }

    /// A UTXO replacement row plus its index entries. Creates and spend
    /// flips both come through here; the spent-height index entry is only
    /// added for spent rows.
    pub fn put_utxo(row: &UtxoRow) -> Result<Vec<WriteOp>, StoreError> {
        let outpoint = OutPoint::new(row.txid.clone(), row.vout);
        let mut batch = vec![
            WriteOp::put(CF_UTXOS, outpoint_key(&outpoint), row)?,
            WriteOp::mark(CF_ADDRESS_UTXOS, addr_utxo_key(&row.address, &outpoint)),
            WriteOp::mark(
                CF_UTXOS_BY_HEIGHT,
                height_outpoint_key(row.height, &outpoint),
            ),
        ];
        if let Some(spent_height) = row.spent_height {
            batch.push(WriteOp::mark(
                CF_SPENT_BY_HEIGHT,
                height_outpoint_key(spent_height, &outpoint),
            ));
        }
        Ok(batch)
    }

    /// Remove a UTXO row and every index entry that references it.
    pub fn delete_utxo(row: &UtxoRow) -> Vec<WriteOp> {
        let outpoint = OutPoint::new(row.txid.clone(), row.vout);
        let mut batch = vec![
            WriteOp::Delete {
                cf: CF_UTXOS,
                key: outpoint_key(&outpoint),
            },
            WriteOp::Delete {
                cf: CF_ADDRESS_UTXOS,
                key: addr_utxo_key(&row.address, &outpoint),
            },
            WriteOp::Delete {
                cf: CF_UTXOS_BY_HEIGHT,
                key: height_outpoint_key(row.height, &outpoint),
            },
        ];
        if let Some(spent_height) = row.spent_height {
            batch.push(WriteOp::Delete {
                cf: CF_SPENT_BY_HEIGHT,
                key: height_outpoint_key(spent_height, &outpoint),
            });
        }
        batch
    }

    pub fn put_address_tx(row: &AddressTxRow) -> Result<WriteOp, StoreError> {
        WriteOp::put(
            CF_ADDRESS_TXS,
            addr_tx_key(&row.address, row.height, &row.txid),
            row,
        )
    }

    pub fn put_address_summary(row: &AddressSummaryRow) -> Result<WriteOp, StoreError> {
        WriteOp::put(CF_ADDRESS_SUMMARY, row.address.as_bytes().to_vec(), row)
    }

    pub fn delete_address_summary(address: &str) -> WriteOp {
        WriteOp::Delete {
            cf: CF_ADDRESS_SUMMARY,
            key: address.as_bytes().to_vec(),
        }
    }

    pub fn put_participants(row: &TxParticipantsRow) -> Result<WriteOp, StoreError> {
        WriteOp::put(CF_TX_PARTICIPANTS, txid_key(&row.txid), row)
    }

    pub fn put_fluxnode_tx(row: &FluxNodeTxRow) -> Result<Vec<WriteOp>, StoreError> {
        Ok(vec![
            WriteOp::put(CF_FLUXNODE_TXS, txid_key(&row.txid), row)?,
            WriteOp::Put {
                cf: CF_FLUXNODE_TXS_BY_HEIGHT,
                key: {
                    let mut key = height_key(row.height).to_vec();
                    key.extend_from_slice(&txid_key(&row.txid));
                    key
                },
                value: row.txid.as_bytes().to_vec(),
            },
        ])
    }

    pub fn put_producer(row: &ProducerRow) -> Result<WriteOp, StoreError> {
        WriteOp::put(CF_PRODUCERS, row.producer.as_bytes().to_vec(), row)
    }

    pub fn put_supply(row: &SupplyStatsRow) -> Result<WriteOp, StoreError> {
        WriteOp::put(CF_SUPPLY, height_key(row.height).to_vec(), row)
    }

    pub fn put_fluxnode(row: &FluxNodeRow) -> Result<WriteOp, StoreError> {
        WriteOp::put(CF_FLUXNODES, row.ip.as_bytes().to_vec(), row)
    }

    pub fn put_sync_state(row: &SyncStateRow) -> Result<WriteOp, StoreError> {
        WriteOp::put(CF_STATE, KEY_SYNC_STATE.to_vec(), row)
    }

    pub fn put_reorg_event(row: &ReorgEventRow) -> Result<WriteOp, StoreError> {
        let mut key = [0u8; 8];
        BigEndian::write_u64(&mut key, row.id);
        WriteOp::put(CF_REORG_EVENTS, key.to_vec(), row)
    }

    pub fn delete_block(height: u32, hash: &str) -> Vec<WriteOp> {
        vec![
            WriteOp::Delete {
                cf: CF_BLOCKS,
                key: height_key(height).to_vec(),
            },
            WriteOp::Delete {
                cf: CF_BLOCK_HASH_INDEX,
                key: txid_key(hash),
            },
        ]
    }

    pub fn delete_tx(txid: &str) -> Vec<WriteOp> {
        vec![
            WriteOp::Delete {
                cf: CF_TRANSACTIONS,
                key: txid_key(txid),
            },
            WriteOp::Delete {
                cf: CF_TX_PARTICIPANTS,
                key: txid_key(txid),
            },
        ]
    }

    pub fn delete_fluxnode_tx(height: u32, txid: &str) -> Vec<WriteOp> {
        let mut by_height = height_key(height).to_vec();
        by_height.extend_from_slice(&txid_key(txid));
        vec![
            WriteOp::Delete {
                cf: CF_FLUXNODE_TXS,
                key: txid_key(txid),
            },
            WriteOp::Delete {
                cf: CF_FLUXNODE_TXS_BY_HEIGHT,
                key: by_height,
            },
        ]
    }

    pub fn delete_supply(height: u32) -> WriteOp {
        WriteOp::Delete {
            cf: CF_SUPPLY,
            key: height_key(height).to_vec(),
        }
    }

    pub fn delete_producer(id: &str) -> WriteOp {
        WriteOp::Delete {
            cf: CF_PRODUCERS,
            key: id.as_bytes().to_vec(),
        }
    }

    pub fn delete_address_tx_key(key: Vec<u8>) -> WriteOp {
        WriteOp::Delete {
            cf: CF_ADDRESS_TXS,
            key,
        }
    }

    pub fn delete_spent_index(spent_height: u32, outpoint: &OutPoint) -> WriteOp {
        WriteOp::Delete {
            cf: CF_SPENT_BY_HEIGHT,
            key: height_outpoint_key(spent_height, outpoint),
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Store {
    db: Arc<DB>,
}

impl Store {
    /// Open (creating if missing) and apply pending schema versions.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut db_options = Options::default();
        db_options.create_if_missing(true);
        db_options.create_missing_column_families(true);
        db_options.set_write_buffer_size(256 * 1024 * 1024);
        db_options.set_max_write_buffer_number(4);
        db_options.set_target_file_size_base(256 * 1024 * 1024);
        db_options.set_max_background_jobs(8);
        db_options.set_compression_type(rocksdb::DBCompressionType::Lz4);
        db_options.increase_parallelism(8);

        let mut cf_descriptors =
            vec![ColumnFamilyDescriptor::new("default", Options::default())];
        for cf in COLUMN_FAMILIES.iter() {
            cf_descriptors.push(ColumnFamilyDescriptor::new(cf.to_string(), Options::default()));
        }

        let db = DB::open_cf_descriptors(&db_options, path, cf_descriptors)?;
        let store = Self { db: Arc::new(db) };
        store.apply_migrations()?;
        Ok(store)
    }

    fn apply_migrations(&self) -> Result<(), StoreError> {
        let mut applied: Vec<u32> = match self.raw_get(CF_STATE, KEY_MIGRATIONS)? {
            Some(bytes) => dec(&bytes)?,
            None => Vec::new(),
        };
        let mut changed = false;
        for version in SCHEMA_VERSIONS {
            if !applied.contains(&version) {
                info!(version, "applying store schema version");
                applied.push(version);
                changed = true;
            }
        }
        if changed {
            self.raw_put(CF_STATE, KEY_MIGRATIONS, &enc(&applied)?)?;
        }
        Ok(())
    }

    pub fn applied_migrations(&self) -> Result<Vec<u32>, StoreError> {
        match self.raw_get(CF_STATE, KEY_MIGRATIONS)? {
            Some(bytes) => dec(&bytes),
            None => Ok(Vec::new()),
        }
    }

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db.cf_handle(name).ok_or(StoreError::MissingCf(name))
    }

    fn raw_get(&self, cf: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get_cf(self.cf(cf)?, key)?)
    }

    fn raw_put(&self, cf: &'static str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        Ok(self.db.put_cf(self.cf(cf)?, key, value)?)
    }

    fn get_row<T: DeserializeOwned>(
        &self,
        cf: &'static str,
        key: &[u8],
    ) -> Result<Option<T>, StoreError> {
        match self.raw_get(cf, key)? {
            Some(bytes) => Ok(Some(dec(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Commit a batch of ops atomically, synchronously. The bulk loader
    /// goes through the sink instead; this is for the reorg controller's
    /// single unit of work and for small control writes.
    pub fn commit(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        for op in &ops {
            match op {
                WriteOp::Put { cf, key, value } => batch.put_cf(self.cf(cf)?, key, value),
                WriteOp::Delete { cf, key } => batch.delete_cf(self.cf(cf)?, key),
            }
        }
        Ok(self.db.write(batch)?)
    }

    // -- sync state ---------------------------------------------------------

    pub fn sync_state(&self) -> Result<SyncStateRow, StoreError> {
        Ok(self
            .get_row(CF_STATE, KEY_SYNC_STATE)?
            .unwrap_or_default())
    }

    pub fn put_sync_state(&self, state: &SyncStateRow) -> Result<(), StoreError> {
        self.raw_put(CF_STATE, KEY_SYNC_STATE, &enc(state)?)
    }

    // -- blocks -------------------------------------------------------------

    pub fn block_by_height(&self, height: u32) -> Result<Option<BlockRow>, StoreError> {
        self.get_row(CF_BLOCKS, &height_key(height))
    }

    pub fn block_hash_at(&self, height: u32) -> Result<Option<String>, StoreError> {
        Ok(self.block_by_height(height)?.map(|b| b.hash))
    }

    pub fn block_height_by_hash(&self, hash: &str) -> Result<Option<u32>, StoreError> {
        Ok(self
            .raw_get(CF_BLOCK_HASH_INDEX, &txid_key(hash))?
            .map(|bytes| decode_height_key(&bytes)))
    }

    pub fn block_by_hash(&self, hash: &str) -> Result<Option<BlockRow>, StoreError> {
        match self.block_height_by_hash(hash)? {
            Some(height) => self.block_by_height(height),
            None => Ok(None),
        }
    }

    /// Most recent blocks, newest first, optionally starting below a height.
    pub fn latest_blocks(
        &self,
        limit: usize,
        before: Option<u32>,
    ) -> Result<Vec<BlockRow>, StoreError> {
        let cf = self.cf(CF_BLOCKS)?;
        let iter = match before {
            Some(height) if height > 0 => {
                let key = height_key(height - 1);
                self.db
                    .iterator_cf(cf, IteratorMode::From(&key, Direction::Reverse))
            }
            Some(_) => return Ok(Vec::new()),
            None => self.db.iterator_cf(cf, IteratorMode::End),
        };
        let mut blocks = Vec::with_capacity(limit);
        for item in iter.take(limit) {
            let (_, value) = item?;
            blocks.push(dec(&value)?);
        }
        Ok(blocks)
    }

    /// Blocks strictly above a height, ascending. Bounded by reorg depth
    /// in practice.
    pub fn blocks_above(&self, height: u32) -> Result<Vec<BlockRow>, StoreError> {
        let cf = self.cf(CF_BLOCKS)?;
        let start = height_key(height.saturating_add(1));
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        let mut blocks = Vec::new();
        for item in iter {
            let (_, value) = item?;
            blocks.push(dec(&value)?);
        }
        Ok(blocks)
    }

    pub fn block_txids(&self, height: u32) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_BLOCK_TXIDS)?;
        let prefix = height_key(height);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        let mut txids = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            txids.push(String::from_utf8_lossy(&value).into_owned());
        }
        Ok(txids)
    }

    /// Raw index keys of the per-block txid list (rollback cleanup).
    pub fn block_txid_index_keys(&self, height: u32) -> Result<Vec<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_BLOCK_TXIDS)?;
        let prefix = height_key(height);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        let mut keys = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    // -- transactions -------------------------------------------------------

    pub fn transaction(&self, txid: &str) -> Result<Option<TxRow>, StoreError> {
        self.get_row(CF_TRANSACTIONS, &txid_key(txid))
    }

    pub fn participants(&self, txid: &str) -> Result<Option<TxParticipantsRow>, StoreError> {
        self.get_row(CF_TX_PARTICIPANTS, &txid_key(txid))
    }

    pub fn fluxnode_tx(&self, txid: &str) -> Result<Option<FluxNodeTxRow>, StoreError> {
        self.get_row(CF_FLUXNODE_TXS, &txid_key(txid))
    }

    pub fn fluxnode_txids_above(&self, height: u32) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_FLUXNODE_TXS_BY_HEIGHT)?;
        let start = height_key(height.saturating_add(1));
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        let mut txids = Vec::new();
        for item in iter {
            let (_, value) = item?;
            txids.push(String::from_utf8_lossy(&value).into_owned());
        }
        Ok(txids)
    }

    // -- UTXOs --------------------------------------------------------------

    pub fn utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoRow>, StoreError> {
        self.get_row(CF_UTXOS, &outpoint_key(outpoint))
    }

    /// UTXO rows created above a height (ascending by creating height).
    pub fn utxos_created_above(&self, height: u32) -> Result<Vec<UtxoRow>, StoreError> {
        let cf = self.cf(CF_UTXOS_BY_HEIGHT)?;
        let start = height_key(height.saturating_add(1));
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        let mut rows = Vec::new();
        for item in iter {
            let (key, _) = item?;
            // key = height(4) | txid(32) | vout(4)
            let outpoint_bytes = &key[4..];
            if let Some(row) = self.get_row::<UtxoRow>(CF_UTXOS, outpoint_bytes)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// UTXO rows whose spend happened above a height.
    pub fn utxos_spent_above(&self, height: u32) -> Result<Vec<UtxoRow>, StoreError> {
        let cf = self.cf(CF_SPENT_BY_HEIGHT)?;
        let start = height_key(height.saturating_add(1));
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        let mut rows = Vec::new();
        for item in iter {
            let (key, _) = item?;
            let outpoint_bytes = &key[4..];
            if let Some(row) = self.get_row::<UtxoRow>(CF_UTXOS, outpoint_bytes)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    pub fn address_utxos(
        &self,
        address: &str,
        only_unspent: bool,
    ) -> Result<Vec<UtxoRow>, StoreError> {
        let cf = self.cf(CF_ADDRESS_UTXOS)?;
        let prefix = addr_prefix(address);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        let mut rows = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let outpoint_bytes = &key[prefix.len()..];
            if let Some(row) = self.get_row::<UtxoRow>(CF_UTXOS, outpoint_bytes)? {
                if !only_unspent || !row.spent {
                    rows.push(row);
                }
            }
        }
        Ok(rows)
    }

    // -- address history ----------------------------------------------------

    /// One page of an address's transactions, newest first. `before`
    /// resumes below a (height, txid) cursor.
    pub fn address_txs_page(
        &self,
        address: &str,
        before: Option<(u32, &str)>,
        limit: usize,
    ) -> Result<Vec<AddressTxRow>, StoreError> {
        let cf = self.cf(CF_ADDRESS_TXS)?;
        let prefix = addr_prefix(address);
        let iter = match before {
            Some((height, txid)) => {
                let key = addr_tx_key(address, height, txid);
                self.db
                    .iterator_cf(cf, IteratorMode::From(&key, Direction::Reverse))
            }
            None => {
                // Reverse-iterate from just past this address's key range:
                // the prefix terminator 0x00 bumped to 0x01.
                let mut upper = prefix.clone();
                if let Some(last) = upper.last_mut() {
                    *last = 1;
                }
                self.db
                    .iterator_cf(cf, IteratorMode::From(&upper, Direction::Reverse))
            }
        };

        let mut rows = Vec::with_capacity(limit);
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            // The cursor key itself was already served.
            if let Some((height, txid)) = before {
                if key.as_ref() == addr_tx_key(address, height, txid).as_slice() {
                    continue;
                }
            }
            rows.push(dec(&value)?);
            if rows.len() >= limit {
                break;
            }
        }
        Ok(rows)
    }

    /// All of an address's history rows above a height (reorg cleanup).
    pub fn address_tx_keys_above(
        &self,
        address: &str,
        height: u32,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_ADDRESS_TXS)?;
        let mut start = addr_prefix(address);
        start.extend_from_slice(&height_key(height.saturating_add(1)));
        let prefix = addr_prefix(address);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        let mut keys = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    pub fn address_summary(&self, address: &str) -> Result<Option<AddressSummaryRow>, StoreError> {
        self.get_row(CF_ADDRESS_SUMMARY, address.as_bytes())
    }

    /// Count of an address's history rows at or below a height.
    pub fn address_tx_count_through(
        &self,
        address: &str,
        height: u32,
    ) -> Result<u64, StoreError> {
        let cf = self.cf(CF_ADDRESS_TXS)?;
        let prefix = addr_prefix(address);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        let mut count = 0u64;
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let row_height = decode_height_key(&key[prefix.len()..]);
            if row_height > height {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Top balances. Full scan; callers cache the result.
    pub fn richlist(&self, limit: usize) -> Result<Vec<AddressSummaryRow>, StoreError> {
        let cf = self.cf(CF_ADDRESS_SUMMARY)?;
        let mut rows: Vec<AddressSummaryRow> = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            rows.push(dec(&value)?);
        }
        rows.sort_by(|a, b| b.balance.cmp(&a.balance));
        rows.truncate(limit);
        Ok(rows)
    }

    pub fn all_address_summaries(&self) -> Result<Vec<AddressSummaryRow>, StoreError> {
        let cf = self.cf(CF_ADDRESS_SUMMARY)?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            rows.push(dec(&value)?);
        }
        Ok(rows)
    }

    // -- producers / supply / nodes ----------------------------------------

    pub fn producer(&self, id: &str) -> Result<Option<ProducerRow>, StoreError> {
        self.get_row(CF_PRODUCERS, id.as_bytes())
    }

    pub fn producers(&self) -> Result<Vec<ProducerRow>, StoreError> {
        let cf = self.cf(CF_PRODUCERS)?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            rows.push(dec(&value)?);
        }
        Ok(rows)
    }

    /// Latest supply checkpoint at or below a height.
    pub fn supply_at_or_below(&self, height: u32) -> Result<Option<SupplyStatsRow>, StoreError> {
        let cf = self.cf(CF_SUPPLY)?;
        let key = height_key(height);
        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&key, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (_, value) = item?;
                Ok(Some(dec(&value)?))
            }
            None => Ok(None),
        }
    }

    pub fn latest_supply(&self) -> Result<Option<SupplyStatsRow>, StoreError> {
        let cf = self.cf(CF_SUPPLY)?;
        let mut iter = self.db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (_, value) = item?;
                Ok(Some(dec(&value)?))
            }
            None => Ok(None),
        }
    }

    pub fn supply_heights_above(&self, height: u32) -> Result<Vec<u32>, StoreError> {
        let cf = self.cf(CF_SUPPLY)?;
        let start = height_key(height.saturating_add(1));
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        let mut heights = Vec::new();
        for item in iter {
            let (key, _) = item?;
            heights.push(decode_height_key(&key));
        }
        Ok(heights)
    }

    pub fn fluxnode(&self, ip: &str) -> Result<Option<FluxNodeRow>, StoreError> {
        self.get_row(CF_FLUXNODES, ip.as_bytes())
    }

    pub fn fluxnodes(&self) -> Result<Vec<FluxNodeRow>, StoreError> {
        let cf = self.cf(CF_FLUXNODES)?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            rows.push(dec(&value)?);
        }
        Ok(rows)
    }

    pub fn clear_fluxnodes(&self) -> Result<Vec<WriteOp>, StoreError> {
        let cf = self.cf(CF_FLUXNODES)?;
        let mut ops = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            ops.push(WriteOp::Delete {
                cf: CF_FLUXNODES,
                key: key.to_vec(),
            });
        }
        Ok(ops)
    }

    /// Stream every (address, UTXO) pair in address order. Used by the
    /// bulk summary rebuild so memory stays flat.
    pub fn scan_address_utxos<F>(&self, mut f: F) -> Result<(), StoreError>
    where
        F: FnMut(&str, &UtxoRow) -> Result<(), StoreError>,
    {
        let cf = self.cf(CF_ADDRESS_UTXOS)?;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let Some(sep) = key.iter().position(|b| *b == 0) else {
                continue;
            };
            let address = String::from_utf8_lossy(&key[..sep]).into_owned();
            let outpoint_bytes = &key[sep + 1..];
            if let Some(row) = self.get_row::<UtxoRow>(CF_UTXOS, outpoint_bytes)? {
                f(&address, &row)?;
            }
        }
        Ok(())
    }

    /// Stream every UTXO row in (txid, vout) key order, so a transaction's
    /// outputs arrive as one contiguous group.
    pub fn scan_utxos<F>(&self, mut f: F) -> Result<(), StoreError>
    where
        F: FnMut(&UtxoRow) -> Result<(), StoreError>,
    {
        let cf = self.cf(CF_UTXOS)?;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let row: UtxoRow = dec(&value)?;
            f(&row)?;
        }
        Ok(())
    }

    // -- reorg events -------------------------------------------------------

    pub fn reorg_events(&self) -> Result<Vec<ReorgEventRow>, StoreError> {
        let cf = self.cf(CF_REORG_EVENTS)?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            rows.push(dec(&value)?);
        }
        Ok(rows)
    }

    pub fn next_reorg_id(&self) -> Result<u64, StoreError> {
        let cf = self.cf(CF_REORG_EVENTS)?;
        let mut iter = self.db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(BigEndian::read_u64(&key) + 1)
            }
            None => Ok(0),
        }
    }

    // -- diagnostics --------------------------------------------------------

    pub fn estimate_keys(&self, cf: &'static str) -> u64 {
        self.cf(cf)
            .ok()
            .and_then(|cf| {
                self.db
                    .property_int_value_cf(cf, "rocksdb.estimate-num-keys")
                    .ok()
                    .flatten()
            })
            .unwrap_or(0)
    }

    // -- bulk insert path ---------------------------------------------------

    /// Spawn the background inserter. Commits arrive as atomic WriteBatches
    /// in submission order; `drain` acknowledges once everything queued
    /// before it is durable.
    pub fn spawn_sink(&self) -> BulkSink {
        let (tx, mut rx) = mpsc::channel::<SinkMsg>(64);
        let store = self.clone();

        tokio::spawn(async move {
            let mut deferred_error: Option<StoreError> = None;
            while let Some(msg) = rx.recv().await {
                match msg {
                    SinkMsg::Commit(ops) => {
                        let store = store.clone();
                        let result =
                            tokio::task::spawn_blocking(move || store.commit(ops)).await;
                        match result {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                error!(error = %e, "async insert commit failed");
                                deferred_error.get_or_insert(e);
                            }
                            Err(e) => {
                                error!(error = %e, "async insert task failed");
                                deferred_error
                                    .get_or_insert(StoreError::Rocks(e.to_string()));
                            }
                        }
                    }
                    SinkMsg::Drain(ack) => {
                        let outcome = match deferred_error.take() {
                            Some(e) => Err(e),
                            None => Ok(()),
                        };
                        let _ = ack.send(outcome);
                    }
                }
            }
        });

        BulkSink {
            tx: Arc::new(Mutex::new(tx)),
        }
    }
}

enum SinkMsg {
    Commit(Vec<WriteOp>),
    Drain(oneshot::Sender<Result<(), StoreError>>),
}

/// Handle to the background inserter.
#[derive(Clone)]
pub struct BulkSink {
    tx: Arc<Mutex<mpsc::Sender<SinkMsg>>>,
}

impl BulkSink {
    /// Queue a batch; returns once accepted, not once durable.
    pub async fn submit(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        let tx = self.tx.lock().await;
        tx.send(SinkMsg::Commit(ops))
            .await
            .map_err(|_| StoreError::Closed)
    }

    /// Barrier: resolves once every previously queued batch is committed.
    /// Surfaces the first deferred commit error, if any.
    pub async fn drain(&self) -> Result<(), StoreError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let tx = self.tx.lock().await;
            tx.send(SinkMsg::Drain(ack_tx))
                .await
                .map_err(|_| StoreError::Closed)?;
        }
        ack_rx.await.map_err(|_| StoreError::Closed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_test_store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (store, dir)
    }

    fn utxo(txid: &str, vout: u32, address: &str, value: i64, height: u32) -> UtxoRow {
        UtxoRow {
            txid: txid.to_string(),
            vout,
            address: address.to_string(),
            value,
            script_type: "pubkeyhash".to_string(),
            height,
            time: 1_700_000_000,
            spent: false,
            spent_txid: None,
            spent_height: None,
            spent_time: None,
            version: (height as u64) << 24,
        }
    }

    #[test]
    fn migrations_recorded_once() {
        let (store, _dir) = open_test_store();
        assert_eq!(store.applied_migrations().unwrap(), vec![1]);
        store.apply_migrations().unwrap();
        assert_eq!(store.applied_migrations().unwrap(), vec![1]);
    }

    #[test]
    fn sync_state_defaults_then_roundtrips() {
        let (store, _dir) = open_test_store();
        let state = store.sync_state().unwrap();
        assert_eq!(state.current_height, -1);

        let mut state = SyncStateRow::default();
        state.current_height = 42;
        state.last_block_hash = "ff".repeat(32);
        store.put_sync_state(&state).unwrap();
        assert_eq!(store.sync_state().unwrap().current_height, 42);
    }

    #[test]
    fn utxo_index_scans() {
        let (store, _dir) = open_test_store();
        let a = utxo(&"aa".repeat(32), 0, "t1alpha", 100, 5);
        let mut b = utxo(&"bb".repeat(32), 1, "t1alpha", 250, 9);
        b.spent = true;
        b.spent_height = Some(12);
        b.spent_txid = Some("cc".repeat(32));

        let mut ops = ops::put_utxo(&a).unwrap();
        ops.extend(ops::put_utxo(&b).unwrap());
        store.commit(ops).unwrap();

        let unspent = store.address_utxos("t1alpha", true).unwrap();
        assert_eq!(unspent.len(), 1);
        assert_eq!(unspent[0].value, 100);

        let all = store.address_utxos("t1alpha", false).unwrap();
        assert_eq!(all.len(), 2);

        assert_eq!(store.utxos_created_above(5).unwrap().len(), 1);
        assert_eq!(store.utxos_created_above(4).unwrap().len(), 2);
        assert_eq!(store.utxos_spent_above(11).unwrap().len(), 1);
        assert_eq!(store.utxos_spent_above(12).unwrap().len(), 0);
    }

    #[test]
    fn address_txs_paginate_newest_first() {
        let (store, _dir) = open_test_store();
        let mut ops = Vec::new();
        for height in 1u32..=5 {
            let row = AddressTxRow {
                address: "t1page".to_string(),
                txid: format!("{:02x}", height).repeat(32),
                height,
                time: 1_700_000_000 + height as i64,
                block_hash: "00".repeat(32),
                direction: crate::types::Direction::Received,
                received: 10,
                sent: 0,
            };
            ops.push(ops::put_address_tx(&row).unwrap());
        }
        store.commit(ops).unwrap();

        let first = store.address_txs_page("t1page", None, 2).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].height, 5);
        assert_eq!(first[1].height, 4);

        let cursor = (first[1].height, first[1].txid.as_str());
        let second = store.address_txs_page("t1page", Some(cursor), 2).unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].height, 3);
        assert_eq!(second[1].height, 2);
    }

    #[tokio::test]
    async fn sink_drain_is_a_barrier() {
        let (store, _dir) = open_test_store();
        let sink = store.spawn_sink();

        let block = BlockRow {
            height: 1,
            hash: "11".repeat(32),
            prev_hash: None,
            time: 1_700_000_000,
            size: 300,
            version: 4,
            merkle_root: "22".repeat(32),
            difficulty: 1.0,
            tx_count: 1,
            producer: None,
            reward_mining: 0,
            reward_foundation: 0,
            reward_cumulus: 0,
            reward_nimbus: 0,
            reward_stratus: 0,
            coinbase_outputs: vec![],
        };
        sink.submit(ops::put_block(&block).unwrap()).await.unwrap();
        sink.drain().await.unwrap();

        assert_eq!(
            store.block_by_height(1).unwrap().unwrap().hash,
            "11".repeat(32)
        );
        assert_eq!(store.block_height_by_hash(&"11".repeat(32)).unwrap(), Some(1));
    }

    #[test]
    fn reorg_event_ids_increment() {
        let (store, _dir) = open_test_store();
        assert_eq!(store.next_reorg_id().unwrap(), 0);
        let event = ReorgEventRow {
            id: 0,
            from_height: 100,
            to_height: 98,
            common_ancestor: 98,
            old_hash: "aa".repeat(32),
            new_hash: "bb".repeat(32),
            blocks_affected: 2,
            occurred_at: 1_700_000_000,
        };
        store
            .commit(vec![ops::put_reorg_event(&event).unwrap()])
            .unwrap();
        assert_eq!(store.next_reorg_id().unwrap(), 1);
        assert_eq!(store.reorg_events().unwrap().len(), 1);
    }
}
