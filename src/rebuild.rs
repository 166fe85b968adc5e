/// Bulk rebuild of derived projections.
///
/// Fast-sync suppresses AddressSummary and TransactionParticipants
/// maintenance for throughput; once the indexer is back within the
/// threshold these are recomputed from the authoritative UTXO and
/// address-history tables. Both passes stream in key order so memory
/// stays flat regardless of address count.

use std::collections::HashMap;
use tracing::info;

use crate::block_index::is_real_address;
use crate::store::{ops, Store, StoreError, WriteOp};
use crate::types::{AddressSummaryRow, TxParticipantsRow};

/// Ops per commit while rebuilding.
const COMMIT_CHUNK: usize = 10_000;

/// Pending input-side merges buffered before a read-modify-write pass.
const SPENDER_FLUSH: usize = 50_000;

fn commit_remaining(store: &Store, batch: &mut Vec<WriteOp>) -> Result<(), StoreError> {
    if !batch.is_empty() {
        store.commit(std::mem::take(batch))?;
    }
    Ok(())
}

/// Recompute every address summary from the UTXO set.
pub fn rebuild_address_summaries(store: &Store) -> Result<u64, StoreError> {
    let mut batch: Vec<WriteOp> = Vec::new();
    let mut rebuilt = 0u64;

    let mut current: Option<AddressSummaryRow> = None;

    let finish =
        |row: Option<AddressSummaryRow>, batch: &mut Vec<WriteOp>| -> Result<(), StoreError> {
            if let Some(mut row) = row {
                row.tx_count = store.address_tx_count_through(&row.address, u32::MAX)?;
                batch.push(ops::put_address_summary(&row)?);
            }
            Ok(())
        };

    store.scan_address_utxos(|address, utxo| {
        if !is_real_address(address) {
            return Ok(());
        }
        let switch = current
            .as_ref()
            .map(|row| row.address != address)
            .unwrap_or(true);
        if switch {
            finish(current.take(), &mut batch)?;
            if batch.len() >= COMMIT_CHUNK {
                store.commit(std::mem::take(&mut batch))?;
            }
            rebuilt += 1;
            current = Some(AddressSummaryRow {
                address: address.to_string(),
                balance: 0,
                tx_count: 0,
                total_received: 0,
                total_sent: 0,
                unspent_count: 0,
                first_seen_height: u32::MAX,
                last_activity_height: 0,
            });
        }
        let row = current.as_mut().expect("current summary set above");
        row.total_received += utxo.value;
        row.first_seen_height = row.first_seen_height.min(utxo.height);
        row.last_activity_height = row.last_activity_height.max(utxo.height);
        if utxo.spent {
            row.total_sent += utxo.value;
            if let Some(h) = utxo.spent_height {
                row.last_activity_height = row.last_activity_height.max(h);
            }
        } else {
            row.balance += utxo.value;
            row.unspent_count += 1;
        }
        Ok(())
    })?;
    finish(current.take(), &mut batch)?;
    commit_remaining(store, &mut batch)?;

    info!(addresses = rebuilt, "address summaries rebuilt");
    Ok(rebuilt)
}

/// Recompute TransactionParticipants from the UTXO set: outputs come from
/// a transaction's own UTXOs (pass one, streamed in txid order), inputs
/// from the rows it spent (pass two, merged read-modify-write in bounded
/// rounds).
pub fn rebuild_participants(store: &Store) -> Result<u64, StoreError> {
    let mut batch: Vec<WriteOp> = Vec::new();
    let mut rebuilt = 0u64;

    // Pass one: output side. Each txid group appears once, so plain
    // overwrites are safe.
    let mut current_txid: Option<String> = None;
    let mut outputs: Vec<String> = Vec::new();

    let flush_outputs = |txid: Option<String>,
                             outputs: &mut Vec<String>,
                             batch: &mut Vec<WriteOp>|
     -> Result<(), StoreError> {
        if let Some(txid) = txid {
            let row = TxParticipantsRow {
                txid,
                input_addresses: Vec::new(),
                output_count: outputs.len() as u32,
                input_count: 0,
                output_addresses: std::mem::take(outputs),
            };
            batch.push(ops::put_participants(&row)?);
        }
        Ok(())
    };

    store.scan_utxos(|utxo| {
        let switch = current_txid
            .as_ref()
            .map(|txid| txid != &utxo.txid)
            .unwrap_or(true);
        if switch {
            flush_outputs(current_txid.take(), &mut outputs, &mut batch)?;
            if batch.len() >= COMMIT_CHUNK {
                store.commit(std::mem::take(&mut batch))?;
            }
            rebuilt += 1;
            current_txid = Some(utxo.txid.clone());
        }
        if is_real_address(&utxo.address) && !outputs.contains(&utxo.address) {
            outputs.push(utxo.address.clone());
        }
        Ok(())
    })?;
    flush_outputs(current_txid.take(), &mut outputs, &mut batch)?;
    commit_remaining(store, &mut batch)?;

    // Pass two: input side, merged into the now-durable output rows.
    // The spender map drains every SPENDER_FLUSH entries so memory stays
    // bounded; merges are idempotent across rounds.
    let mut spender_inputs: HashMap<String, Vec<String>> = HashMap::new();

    let flush_spenders = |store: &Store,
                          spenders: &mut HashMap<String, Vec<String>>|
     -> Result<(), StoreError> {
        let mut round: Vec<WriteOp> = Vec::with_capacity(spenders.len());
        for (spender, addresses) in spenders.drain() {
            let mut row = store.participants(&spender)?.unwrap_or(TxParticipantsRow {
                txid: spender.clone(),
                input_addresses: Vec::new(),
                output_addresses: Vec::new(),
                input_count: 0,
                output_count: 0,
            });
            for address in addresses {
                if !row.input_addresses.contains(&address) {
                    row.input_addresses.push(address);
                }
            }
            row.input_count = row.input_addresses.len() as u32;
            round.push(ops::put_participants(&row)?);
        }
        store.commit(round)
    };

    store.scan_utxos(|utxo| {
        if let Some(ref spender) = utxo.spent_txid {
            if is_real_address(&utxo.address) {
                spender_inputs
                    .entry(spender.clone())
                    .or_default()
                    .push(utxo.address.clone());
            }
        }
        if spender_inputs.len() >= SPENDER_FLUSH {
            flush_spenders(store, &mut spender_inputs)?;
        }
        Ok(())
    })?;
    flush_spenders(store, &mut spender_inputs)?;

    info!(transactions = rebuilt, "transaction participants rebuilt");
    Ok(rebuilt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_index::BlockIndexer;
    use crate::bulk_loader::BulkLoader;
    use crate::testutil::{coinbase_tx, make_block, spend_tx, FixtureRpc};
    use crate::types::COIN;
    use tempfile::TempDir;

    #[tokio::test]
    async fn rebuild_matches_incremental_path() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let sink = store.spawn_sink();
        let mut loader = BulkLoader::new(store.clone(), sink).unwrap();
        let rpc = FixtureRpc::new();

        // Ingest with summaries suppressed, as fast-sync would.
        let mut indexer = BlockIndexer::new();
        indexer.set_skip_summaries(true);

        let cb1 = coinbase_tx(1, "t1one", 100 * COIN, &[]);
        let cb1_txid = cb1.txid.clone();
        indexer
            .index_block(&make_block(1, vec![cb1], None), &rpc, &mut loader)
            .await
            .unwrap();

        let cb2 = coinbase_tx(2, "t1two", 100 * COIN, &[]);
        let spend = spend_tx(&cb1_txid, 0, &[("t1three", 100 * COIN)]);
        let spend_txid = spend.txid.clone();
        indexer
            .index_block(&make_block(2, vec![cb2, spend], None), &rpc, &mut loader)
            .await
            .unwrap();
        loader.flush().await.unwrap();

        assert!(store.address_summary("t1one").unwrap().is_none());

        rebuild_address_summaries(&store).unwrap();
        rebuild_participants(&store).unwrap();

        let one = store.address_summary("t1one").unwrap().unwrap();
        assert_eq!(one.balance, 0);
        assert_eq!(one.total_received, 100 * COIN);
        assert_eq!(one.total_sent, 100 * COIN);
        assert_eq!(one.tx_count, 2);

        let three = store.address_summary("t1three").unwrap().unwrap();
        assert_eq!(three.balance, 100 * COIN);
        assert_eq!(three.unspent_count, 1);
        assert_eq!(three.tx_count, 1);

        let participants = store.participants(&spend_txid).unwrap().unwrap();
        assert_eq!(participants.input_addresses, vec!["t1one".to_string()]);
        assert_eq!(participants.output_addresses, vec!["t1three".to_string()]);
    }
}
