/// Chain reorganization handling.
///
/// When the stored tip hash disagrees with the daemon, walk back to the
/// common ancestor within a bounded depth and rewind every materialized
/// view to it under one atomic unit of work. Exceeding the bound is fatal
/// for the process; the operator must inspect and resync.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use crate::block_index::is_real_address;
use crate::rpc::{ChainRpc, RpcError};
use crate::store::{ops, Store, StoreError, WriteOp};
use crate::types::{AddressSummaryRow, OutPoint, ReorgEventRow, UtxoRow};

#[derive(Debug)]
pub enum ReorgError {
    /// No common ancestor within the configured depth.
    DepthExceeded { searched: u32 },
    /// A rollback was needed but INDEXER_ENABLE_REORG is off.
    Disabled,
    Rpc(RpcError),
    Store(StoreError),
}

impl fmt::Display for ReorgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReorgError::DepthExceeded { searched } => {
                write!(
                    f,
                    "no common ancestor within {} blocks; manual intervention required",
                    searched
                )
            }
            ReorgError::Disabled => {
                write!(f, "tip mismatch detected but reorg handling is disabled")
            }
            ReorgError::Rpc(e) => write!(f, "{}", e),
            ReorgError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ReorgError {}

impl From<RpcError> for ReorgError {
    fn from(e: RpcError) -> Self {
        ReorgError::Rpc(e)
    }
}

impl From<StoreError> for ReorgError {
    fn from(e: StoreError) -> Self {
        ReorgError::Store(e)
    }
}

pub struct ReorgController {
    store: Store,
    max_depth: u32,
}

impl ReorgController {
    pub fn new(store: Store, max_depth: u32) -> Self {
        Self { store, max_depth }
    }

    /// Walk back from `from_height` until stored and daemon hashes agree.
    pub async fn find_common_ancestor<R: ChainRpc>(
        &self,
        rpc: &R,
        from_height: u32,
    ) -> Result<u32, ReorgError> {
        for depth in 1..=self.max_depth {
            let Some(height) = from_height.checked_sub(depth) else {
                // Walked past genesis; treat height 0 agreement as final.
                break;
            };
            let stored = self.store.block_hash_at(height)?;
            // Heights the daemon no longer has (its chain shrank) read as
            // a mismatch and the walk continues deeper.
            let daemon = match rpc.get_block_hash(height).await {
                Ok(hash) => Some(hash),
                Err(RpcError::Rpc { .. }) => None,
                Err(e) => return Err(e.into()),
            };
            if stored.is_some() && stored == daemon {
                return Ok(height);
            }
        }
        Err(ReorgError::DepthExceeded {
            searched: self.max_depth,
        })
    }

    /// Rewind every materialized view to the common ancestor. The whole
    /// rollback commits as a single atomic WriteBatch; afterwards the sync
    /// engine resumes from ancestor + 1.
    pub async fn handle<R: ChainRpc>(
        &self,
        rpc: &R,
        old_tip_height: u32,
        new_tip_hash: &str,
    ) -> Result<ReorgEventRow, ReorgError> {
        let ancestor = self.find_common_ancestor(rpc, old_tip_height).await?;
        let old_tip_hash = self
            .store
            .block_hash_at(old_tip_height)?
            .unwrap_or_default();

        warn!(
            old_tip = old_tip_height,
            ancestor,
            depth = old_tip_height - ancestor,
            "reorg detected, rewinding"
        );

        let mut batch: Vec<WriteOp> = Vec::new();

        // Addresses that produced or consumed any UTXO above the ancestor;
        // their summaries are rebuilt from the post-rollback UTXO set.
        let mut affected: HashSet<String> = HashSet::new();

        // Revert spends recorded above the ancestor on UTXOs that survive
        // the rollback. UTXOs created above it are deleted wholesale below,
        // so their spends need no separate revert.
        let reverted: Vec<UtxoRow> = self
            .store
            .utxos_spent_above(ancestor)?
            .into_iter()
            .filter(|row| row.height <= ancestor)
            .collect();
        for row in &reverted {
            affected.insert(row.address.clone());
            let outpoint = OutPoint::new(row.txid.clone(), row.vout);
            if let Some(spent_height) = row.spent_height {
                batch.push(ops::delete_spent_index(spent_height, &outpoint));
            }
            let mut unspent = row.clone();
            unspent.spent = false;
            unspent.spent_txid = None;
            unspent.spent_height = None;
            unspent.spent_time = None;
            unspent.version = (unspent.height as u64) << 24;
            batch.extend(ops::put_utxo(&unspent)?);
        }

        let deleted_utxos = self.store.utxos_created_above(ancestor)?;
        for row in &deleted_utxos {
            affected.insert(row.address.clone());
            batch.extend(ops::delete_utxo(row));
        }

        // Blocks, transactions and per-block projections above the ancestor.
        let orphaned_blocks = self.store.blocks_above(ancestor)?;
        let mut producer_rollback: HashMap<String, (u64, i64)> = HashMap::new();
        for block in &orphaned_blocks {
            for txid in self.store.block_txids(block.height)? {
                batch.extend(ops::delete_tx(&txid));
            }
            for key in self.store.block_txid_index_keys(block.height)? {
                batch.push(WriteOp::Delete {
                    cf: crate::store::CF_BLOCK_TXIDS,
                    key,
                });
            }
            batch.extend(ops::delete_block(block.height, &block.hash));
            if let Some(ref producer) = block.producer {
                let entry = producer_rollback.entry(producer.clone()).or_insert((0, 0));
                entry.0 += 1;
                entry.1 += block.reward_mining;
            }
        }

        for txid in self.store.fluxnode_txids_above(ancestor)? {
            if let Some(row) = self.store.fluxnode_tx(&txid)? {
                batch.extend(ops::delete_fluxnode_tx(row.height, &txid));
            }
        }

        for height in self.store.supply_heights_above(ancestor)? {
            batch.push(ops::delete_supply(height));
        }

        for (producer, (blocks, reward)) in producer_rollback {
            if let Some(mut row) = self.store.producer(&producer)? {
                if row.blocks_produced <= blocks {
                    batch.push(ops::delete_producer(&producer));
                } else {
                    row.blocks_produced -= blocks;
                    row.total_reward -= reward;
                    row.last_height = row.last_height.min(ancestor);
                    batch.push(ops::put_producer(&row)?);
                }
            }
        }

        // Address history rows above the ancestor, then summary rebuild
        // from the now-authoritative UTXO set.
        for address in &affected {
            if !is_real_address(address) {
                continue;
            }
            for key in self.store.address_tx_keys_above(address, ancestor)? {
                batch.push(ops::delete_address_tx_key(key));
            }
            batch.push(self.rebuild_summary_op(address, ancestor)?);
        }

        // Audit record, then the cursor reset.
        let event = ReorgEventRow {
            id: self.store.next_reorg_id()?,
            from_height: old_tip_height,
            to_height: ancestor,
            common_ancestor: ancestor,
            old_hash: old_tip_hash,
            new_hash: new_tip_hash.to_string(),
            blocks_affected: old_tip_height - ancestor,
            occurred_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
        };
        batch.push(ops::put_reorg_event(&event)?);

        let mut state = self.store.sync_state()?;
        state.current_height = ancestor as i64;
        state.last_block_hash = self.store.block_hash_at(ancestor)?.unwrap_or_default();
        batch.push(ops::put_sync_state(&state)?);

        self.store.commit(batch)?;

        info!(
            ancestor,
            blocks_affected = event.blocks_affected,
            addresses = affected.len(),
            "reorg rollback committed"
        );
        Ok(event)
    }

    /// Recompute one address's summary from its UTXOs as they will stand
    /// after the rollback batch commits.
    fn rebuild_summary_op(&self, address: &str, ancestor: u32) -> Result<WriteOp, ReorgError> {
        let mut balance = 0i64;
        let mut received = 0i64;
        let mut sent = 0i64;
        let mut unspent = 0u64;
        let mut first_seen = u32::MAX;
        let mut last_activity = 0u32;
        let mut any = false;

        for row in self.store.address_utxos(address, false)? {
            if row.height > ancestor {
                continue; // deleted by this rollback
            }
            any = true;
            let spent = matches!(row.spent_height, Some(h) if h <= ancestor);
            received += row.value;
            first_seen = first_seen.min(row.height);
            last_activity = last_activity.max(row.height);
            if spent {
                sent += row.value;
                last_activity = last_activity.max(row.spent_height.unwrap_or(0));
            } else {
                balance += row.value;
                unspent += 1;
            }
        }

        if !any {
            return Ok(ops::delete_address_summary(address));
        }

        let tx_count = self.store.address_tx_count_through(address, ancestor)?;
        Ok(ops::put_address_summary(&AddressSummaryRow {
            address: address.to_string(),
            balance,
            tx_count,
            total_received: received,
            total_sent: sent,
            unspent_count: unspent,
            first_seen_height: first_seen,
            last_activity_height: last_activity,
        })?)
    }
}
