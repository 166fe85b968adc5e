/// Sync engine: the top-level loop that turns RPC-fetched blocks into a
/// durable, consistent materialization of chain state.
///
/// Idle -> Fetching -> Indexing -> Persisting -> Verifying -> (Idle | Reorging)
///
/// Blocks apply strictly in ascending height. A batch only advances
/// SyncState after the bulk loader's drain barrier, and only if the
/// stored tip hash still matches the daemon; a mismatch hands control to
/// the reorg controller. Far behind the tip, fast-sync mode suppresses
/// derived-view maintenance and rebuilds it in bulk once caught up.

use std::fmt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::block_index::{BlockIndexer, IndexError};
use crate::bulk_loader::{BulkLoader, LoaderError};
use crate::config::IndexerConfig;
use crate::metrics;
use crate::rebuild;
use crate::reorg::{ReorgController, ReorgError};
use crate::rpc::{ChainRpc, RpcError};
use crate::store::{Store, StoreError};
use crate::supply;
use crate::telemetry::truncate_hex;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum SyncError {
    Rpc(RpcError),
    Store(StoreError),
    Loader(LoaderError),
    Index(IndexError),
    Reorg(ReorgError),
}

impl SyncError {
    /// Only a reorg beyond the configured bound kills the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Reorg(ReorgError::DepthExceeded { .. }))
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Rpc(e) => write!(f, "{}", e),
            SyncError::Store(e) => write!(f, "{}", e),
            SyncError::Loader(e) => write!(f, "{}", e),
            SyncError::Index(e) => write!(f, "{}", e),
            SyncError::Reorg(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<RpcError> for SyncError {
    fn from(e: RpcError) -> Self {
        SyncError::Rpc(e)
    }
}
impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Store(e)
    }
}
impl From<LoaderError> for SyncError {
    fn from(e: LoaderError) -> Self {
        SyncError::Loader(e)
    }
}
impl From<IndexError> for SyncError {
    fn from(e: IndexError) -> Self {
        SyncError::Index(e)
    }
}
impl From<ReorgError> for SyncError {
    fn from(e: ReorgError) -> Self {
        SyncError::Reorg(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Indexed a batch; immediately schedule the next one.
    Advanced,
    /// At target; sleep for the polling interval.
    CaughtUp,
    /// A rollback ran; resume from the ancestor on the next pass.
    Reorged,
}

pub struct SyncEngine<R: ChainRpc> {
    rpc: R,
    store: Store,
    loader: BulkLoader,
    indexer: BlockIndexer,
    reorg: ReorgController,
    config: IndexerConfig,
    shutdown: CancellationToken,
    last_supply_check: u32,
}

impl<R: ChainRpc> SyncEngine<R> {
    pub fn new(
        rpc: R,
        store: Store,
        loader: BulkLoader,
        config: IndexerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let reorg = ReorgController::new(store.clone(), config.indexer_max_reorg_depth);
        Self {
            rpc,
            store,
            loader,
            indexer: BlockIndexer::new(),
            reorg,
            config,
            shutdown,
            last_supply_check: 0,
        }
    }

    /// Main loop. Returns Ok on clean shutdown, Err only on fatal errors.
    pub async fn run(&mut self) -> Result<(), SyncError> {
        self.recover_tip().await?;

        let mut backoff_attempts: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.sync_once().await {
                Ok(SyncOutcome::Advanced) | Ok(SyncOutcome::Reorged) => {
                    backoff_attempts = 0;
                }
                Ok(SyncOutcome::CaughtUp) => {
                    backoff_attempts = 0;
                    self.sleep(Duration::from_millis(self.config.indexer_polling_interval))
                        .await;
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "fatal sync error");
                    return Err(e);
                }
                Err(e) => {
                    // Retry the whole batch after backoff without advancing
                    // SyncState. Buffered rows from the failed batch are
                    // dropped.
                    metrics::RPC_ERRORS.inc();
                    if let Err(abort_err) = self.loader.abort_batch() {
                        warn!(error = %abort_err, "failed to reset loader after batch error");
                    }
                    let delay = backoff_delay(backoff_attempts);
                    backoff_attempts = backoff_attempts.saturating_add(1);
                    warn!(error = %e, retry_in_secs = delay.as_secs(), "batch failed, backing off");
                    self.sleep(delay).await;
                }
            }
        }

        // Finish cleanly: nothing buffered may outlive the process without
        // the drain barrier.
        self.loader.drain_inserter().await?;
        let mut state = self.store.sync_state()?;
        state.is_syncing = false;
        self.store.put_sync_state(&state)?;
        info!("sync engine stopped");
        Ok(())
    }

    /// Abrupt-shutdown recovery: if the stored tip no longer matches the
    /// daemon, run the normal reorg path before ingesting anything.
    async fn recover_tip(&mut self) -> Result<(), SyncError> {
        let state = self.store.sync_state()?;
        if state.current_height < 0 {
            return Ok(());
        }
        let height = state.current_height as u32;
        let daemon_hash = match self.rpc.get_block_hash(height).await {
            Ok(hash) => hash,
            Err(RpcError::Rpc { .. }) => String::new(),
            Err(e) => return Err(e.into()),
        };
        let stored_hash = self.store.block_hash_at(height)?.unwrap_or_default();
        if stored_hash != daemon_hash {
            warn!(
                height,
                stored = %truncate_hex(&stored_hash, 16),
                daemon = %truncate_hex(&daemon_hash, 16),
                "tip mismatch at startup, running reorg recovery"
            );
            self.run_reorg(height, &daemon_hash).await?;
        }
        Ok(())
    }

    /// One pass of the state machine. Exposed so a harness can drive the
    /// engine step by step.
    pub async fn sync_once(&mut self) -> Result<SyncOutcome, SyncError> {
        // Idle: read both cursors.
        let mut state = self.store.sync_state()?;
        let info = self.rpc.get_blockchain_info().await?;

        let chain_height = info.headers;
        let daemon_blocks = info.blocks;
        metrics::CHAIN_HEIGHT.set(chain_height);

        let mut current = state.current_height;
        if current < 0 && self.config.indexer_start_height > 0 {
            current = self.config.indexer_start_height as i64 - 1;
        }

        // Safety buffer: while the daemon itself is catching up, stay a
        // configurable distance below its header tip to avoid chasing deep
        // reorgs.
        let buffer = self.config.indexer_safety_buffer as i64;
        let target = if daemon_blocks < chain_height && current < chain_height - buffer {
            chain_height - buffer
        } else {
            chain_height
        }
        // The daemon cannot serve blocks it has not validated yet.
        .min(daemon_blocks);

        if target < 0 || current >= target {
            if state.is_syncing {
                state.is_syncing = false;
                state.chain_height = chain_height;
                self.store.put_sync_state(&state)?;
            }
            self.maybe_exit_fast_sync(&mut state, 0).await?;
            return Ok(SyncOutcome::CaughtUp);
        }

        // Fast-sync policy: far behind target, trade view freshness for
        // throughput.
        let behind = (target - current) as u32;
        if behind > self.config.indexer_fast_sync_threshold {
            if !self.indexer.skip_summaries() {
                info!(behind, "entering fast-sync mode");
                self.indexer.set_skip_summaries(true);
                state.fast_sync = true;
                self.store.put_sync_state(&state)?;
            }
        } else {
            self.maybe_exit_fast_sync(&mut state, behind).await?;
        }

        // Fetching.
        let start = (current + 1) as u32;
        let end = std::cmp::min(current + self.config.indexer_batch_size as i64, target) as u32;
        let heights: Vec<u32> = (start..=end).collect();
        debug!(start, end, "fetching batch");
        let fetch_started = Instant::now();
        let blocks = self.rpc.batch_get_blocks(&heights).await?;
        if blocks.len() != heights.len() {
            return Err(SyncError::Rpc(RpcError::Malformed {
                method: "getblock".to_string(),
                detail: format!("asked for {} blocks, got {}", heights.len(), blocks.len()),
            }));
        }

        // The daemon may have replaced our suffix and extended past it, in
        // which case the tip check below would never fire: the first new
        // block must chain onto our stored parent.
        if let Some(first) = blocks.first() {
            if first.height > 0 {
                let parent_height = first.height - 1;
                if let (Some(stored_parent), Some(prev)) = (
                    self.store.block_hash_at(parent_height)?,
                    first.previousblockhash.as_ref(),
                ) {
                    if prev != &stored_parent {
                        warn!(
                            height = first.height,
                            stored_parent = %truncate_hex(&stored_parent, 16),
                            daemon_parent = %truncate_hex(prev, 16),
                            "new block does not chain onto stored parent"
                        );
                        let daemon_hash = self.rpc.get_block_hash(parent_height).await?;
                        self.run_reorg(parent_height, &daemon_hash).await?;
                        return Ok(SyncOutcome::Reorged);
                    }
                }
            }
        }

        // Indexing, strictly in height order.
        for block in &blocks {
            self.indexer
                .index_block(block, &self.rpc, &mut self.loader)
                .await?;
        }

        // Persisting: barrier before SyncState may move.
        let flush_started = Instant::now();
        let stats = self.loader.flush().await?;
        metrics::FLUSH_SECONDS.observe(flush_started.elapsed().as_secs_f64());
        metrics::UTXO_ROWS_WRITTEN.inc_by(stats.utxo_rows as u64);

        // Verifying: the stored tip must still be the daemon's view.
        let tip_hash = blocks.last().map(|b| b.hash.clone()).unwrap_or_default();
        let daemon_hash = self.rpc.get_block_hash(end).await?;
        if tip_hash != daemon_hash {
            warn!(
                height = end,
                ours = %truncate_hex(&tip_hash, 16),
                daemon = %truncate_hex(&daemon_hash, 16),
                "tip hash mismatch after batch"
            );
            self.run_reorg(end, &daemon_hash).await?;
            return Ok(SyncOutcome::Reorged);
        }

        // Advance the cursor.
        state.current_height = end as i64;
        state.last_block_hash = tip_hash;
        state.chain_height = chain_height;
        state.is_syncing = true;
        state.last_sync_time = unix_now();
        self.store.put_sync_state(&state)?;
        metrics::SYNC_HEIGHT.set(end as i64);
        metrics::BLOCKS_INDEXED.inc_by(blocks.len() as u64);

        info!(
            height = end,
            target,
            behind = target - end as i64,
            blocks = blocks.len(),
            utxo_rows = stats.utxo_rows,
            elapsed_ms = fetch_started.elapsed().as_millis() as u64,
            "batch indexed"
        );

        // Diagnostic cadence.
        if end - self.last_supply_check >= self.config.indexer_supply_check_interval {
            self.last_supply_check = end;
            supply::verify_supply(&self.store, &self.rpc, end).await;
        }

        Ok(SyncOutcome::Advanced)
    }

    async fn maybe_exit_fast_sync(
        &mut self,
        state: &mut crate::types::SyncStateRow,
        behind: u32,
    ) -> Result<(), SyncError> {
        if !self.indexer.skip_summaries() && !state.fast_sync {
            return Ok(());
        }
        info!(behind, "leaving fast-sync mode, rebuilding derived views");
        self.indexer.set_skip_summaries(false);

        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            rebuild::rebuild_address_summaries(&store)?;
            rebuild::rebuild_participants(&store)?;
            Ok(())
        })
        .await
        .map_err(|e| SyncError::Store(StoreError::Rocks(e.to_string())))??;

        state.fast_sync = false;
        self.store.put_sync_state(state)?;
        Ok(())
    }

    async fn run_reorg(&mut self, from_height: u32, new_hash: &str) -> Result<u32, SyncError> {
        if !self.config.indexer_enable_reorg {
            error!(
                height = from_height,
                "reorg detected but INDEXER_ENABLE_REORG is off; refusing to rewind"
            );
            return Err(SyncError::Reorg(ReorgError::Disabled));
        }
        let event = self.reorg.handle(&self.rpc, from_height, new_hash).await?;
        metrics::REORGS.inc();
        self.loader.reset_after_reorg()?;
        metrics::SYNC_HEIGHT.set(event.common_ancestor as i64);
        Ok(event.common_ancestor)
    }

    /// Cancellable sleep.
    async fn sleep(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }
}

fn backoff_delay(attempts: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << attempts.min(6));
    exp.min(BACKOFF_CAP)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(5), Duration::from_secs(32));
        assert_eq!(backoff_delay(6), Duration::from_secs(60));
        assert_eq!(backoff_delay(60), Duration::from_secs(60));
    }
}
