//! End-to-end sync scenarios against a scripted daemon and a throwaway
//! store: fresh sync, spends, reorgs, batch fallback, fast-sync rebuild,
//! replay idempotence.

use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::bulk_loader::BulkLoader;
use crate::config::IndexerConfig;
use crate::store::Store;
use crate::sync::{SyncEngine, SyncOutcome};
use crate::testutil::{
    block_hash, coinbase_tx, make_block_linked, make_block_with, spend_tx, FixtureRpc,
};
use crate::types::{OutPoint, COIN};

fn test_config() -> IndexerConfig {
    IndexerConfig {
        flux_rpc_url: "http://127.0.0.1:0".to_string(),
        flux_rpc_user: String::new(),
        flux_rpc_password: String::new(),
        flux_rpc_timeout: 1_000,
        store_path: String::new(),
        indexer_batch_size: 3,
        indexer_polling_interval: 10,
        indexer_start_height: 0,
        indexer_enable_reorg: true,
        indexer_max_reorg_depth: 100,
        indexer_fast_sync_threshold: 1_000,
        indexer_supply_check_interval: 10_000,
        indexer_safety_buffer: 1_000,
        indexer_node_refresh_interval: 60_000,
        api_port: 0,
        api_host: "127.0.0.1".to_string(),
        api_cors_enabled: false,
        log_level: "warn".to_string(),
        log_format: "pretty".to_string(),
        log_file: None,
    }
}

fn new_engine(
    rpc: Arc<FixtureRpc>,
    config: IndexerConfig,
) -> (SyncEngine<Arc<FixtureRpc>>, Store, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let sink = store.spawn_sink();
    let loader = BulkLoader::new(store.clone(), sink).unwrap();
    let engine = SyncEngine::new(rpc, store.clone(), loader, config, CancellationToken::new());
    (engine, store, dir)
}

/// Drive sync_once until the engine reports itself caught up.
async fn sync_to_tip(engine: &mut SyncEngine<Arc<FixtureRpc>>) {
    for _ in 0..1_000 {
        match engine.sync_once().await.unwrap() {
            SyncOutcome::CaughtUp => return,
            SyncOutcome::Advanced | SyncOutcome::Reorged => {}
        }
    }
    panic!("engine did not catch up within 1000 passes");
}

/// Simple chain: height 0 pays only the genesis recipient; later blocks
/// pay the given producer plus optional extra outputs per height.
fn seed_chain(rpc: &FixtureRpc, to_height: u32, extra: &dyn Fn(u32) -> Vec<(String, i64)>) {
    for height in 0..=to_height {
        let txs = if height == 0 {
            vec![coinbase_tx(0, "t1genesis", 150 * COIN, &[])]
        } else {
            let extras = extra(height);
            let extra_refs: Vec<(&str, i64)> =
                extras.iter().map(|(a, v)| (a.as_str(), *v)).collect();
            vec![coinbase_tx(height, "t1miner", 75 * COIN, &extra_refs)]
        };
        rpc.add_block(make_block_with(height, 0, txs, false));
    }
}

#[tokio::test]
async fn s1_fresh_sync_from_genesis() {
    let rpc = Arc::new(FixtureRpc::new());
    // Blocks 1..=5 each pay the recipient a stratus-sized output.
    seed_chain(&rpc, 5, &|_h| vec![("t1recipient".to_string(), 45 * COIN)]);

    let (mut engine, store, _dir) = new_engine(rpc.clone(), test_config());
    sync_to_tip(&mut engine).await;

    let state = store.sync_state().unwrap();
    assert_eq!(state.current_height, 5);
    assert_eq!(state.last_block_hash, block_hash(5, 0));
    assert!(!state.is_syncing);

    let blocks = store.latest_blocks(100, None).unwrap();
    assert_eq!(blocks.len(), 6);

    // The genesis coinbase is the only coinbase with a single output.
    let single_output: Vec<u32> = blocks
        .iter()
        .filter(|b| b.coinbase_outputs.len() == 1)
        .map(|b| b.height)
        .collect();
    assert_eq!(single_output, vec![0]);

    // Recipient balance equals the sum of its block-1..5 outputs.
    let summary = store.address_summary("t1recipient").unwrap().unwrap();
    assert_eq!(summary.balance, 5 * 45 * COIN);
    assert_eq!(summary.unspent_count, 5);
    assert_eq!(summary.tx_count, 5);
    assert_eq!(summary.first_seen_height, 1);
    assert_eq!(summary.last_activity_height, 5);

    // Producer rollup covers blocks 1..=5.
    let producer = store.producer("t1miner").unwrap().unwrap();
    assert_eq!(producer.blocks_produced, 5);
    assert_eq!(producer.total_reward, 5 * 75 * COIN);
}

#[tokio::test]
async fn s2_simple_spend() {
    let rpc = Arc::new(FixtureRpc::new());
    seed_chain(&rpc, 9, &|_h| vec![]);

    // Block 10 pays 100 to A; block 12 spends it entirely to B.
    let cb10 = coinbase_tx(10, "t1miner", 75 * COIN, &[("t1aaa", 100 * COIN)]);
    let u1 = OutPoint::new(cb10.txid.clone(), 1);
    rpc.add_block(make_block_with(10, 0, vec![cb10], false));
    rpc.add_block(make_block_with(
        11,
        0,
        vec![coinbase_tx(11, "t1miner", 75 * COIN, &[])],
        false,
    ));
    let spend = spend_tx(&u1.txid, u1.vout, &[("t1bbb", 100 * COIN)]);
    let spend_txid = spend.txid.clone();
    rpc.add_block(make_block_with(
        12,
        0,
        vec![coinbase_tx(12, "t1miner", 75 * COIN, &[]), spend],
        false,
    ));

    let (mut engine, store, _dir) = new_engine(rpc.clone(), test_config());
    sync_to_tip(&mut engine).await;

    let a = store.address_summary("t1aaa").unwrap().unwrap();
    assert_eq!(a.balance, 0);
    assert_eq!(a.tx_count, 2);
    assert_eq!(a.total_sent, 100 * COIN);

    let b = store.address_summary("t1bbb").unwrap().unwrap();
    assert_eq!(b.balance, 100 * COIN);
    assert_eq!(b.unspent_count, 1);

    let utxo = store.utxo(&u1).unwrap().unwrap();
    assert!(utxo.spent);
    assert_eq!(utxo.spent_txid.as_deref(), Some(spend_txid.as_str()));
    assert_eq!(utxo.spent_height, Some(12));

    // Invariant: the spender exists and its height matches.
    let spender = store.transaction(&spend_txid).unwrap().unwrap();
    assert_eq!(Some(spender.height), utxo.spent_height);
}

#[tokio::test]
async fn s3_reorg_depth_two() {
    let rpc = Arc::new(FixtureRpc::new());
    // Old chain pays A on heights 99 and 100.
    seed_chain(&rpc, 98, &|_h| vec![]);
    for height in 99..=100 {
        rpc.add_block(make_block_with(
            height,
            0,
            vec![coinbase_tx(height, "t1old", 75 * COIN, &[("t1aaa", 45 * COIN)])],
            false,
        ));
    }

    let (mut engine, store, _dir) = new_engine(rpc.clone(), test_config());
    sync_to_tip(&mut engine).await;
    assert_eq!(store.sync_state().unwrap().current_height, 100);
    let old_99_txid = store.block_txids(99).unwrap()[0].clone();

    // The daemon replaces 99..100 and extends to 101 on a fork paying B.
    rpc.rewind_to(98);
    rpc.add_block(make_block_linked(
        99,
        1,
        Some(block_hash(98, 0)),
        vec![coinbase_tx(99, "t1new", 75 * COIN, &[("t1bbb", 45 * COIN)])],
        false,
    ));
    for height in 100..=101 {
        rpc.add_block(make_block_linked(
            height,
            1,
            Some(block_hash(height - 1, 1)),
            vec![coinbase_tx(height, "t1new", 75 * COIN, &[("t1bbb", 45 * COIN)])],
            false,
        ));
    }

    sync_to_tip(&mut engine).await;

    // Audit trail records the depth-2 rollback.
    let events = store.reorg_events().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].common_ancestor, 98);
    assert_eq!(events[0].blocks_affected, 2);

    let state = store.sync_state().unwrap();
    assert_eq!(state.current_height, 101);
    assert_eq!(state.last_block_hash, block_hash(101, 1));
    assert_eq!(
        store.block_hash_at(101).unwrap().unwrap(),
        block_hash(101, 1)
    );

    // Old-branch transactions are gone; invariant 7 holds.
    assert!(store.transaction(&old_99_txid).unwrap().is_none());
    assert!(store.blocks_above(101).unwrap().is_empty());

    // Balances reflect only the new branch.
    assert!(store.address_summary("t1aaa").unwrap().is_none());
    let b = store.address_summary("t1bbb").unwrap().unwrap();
    assert_eq!(b.balance, 3 * 45 * COIN);
    assert_eq!(b.unspent_count, 3);

    // Producer rollups follow the branch switch.
    assert!(store.producer("t1old").unwrap().is_none());
    assert_eq!(
        store.producer("t1new").unwrap().unwrap().blocks_produced,
        3
    );
}

#[tokio::test]
async fn s3_reorg_reverts_spends_onto_surviving_utxos() {
    let rpc = Arc::new(FixtureRpc::new());
    seed_chain(&rpc, 8, &|_h| vec![]);
    // Height 9 funds A on the common part of the chain.
    let cb9 = coinbase_tx(9, "t1miner", 75 * COIN, &[("t1fund", 100 * COIN)]);
    let funded = OutPoint::new(cb9.txid.clone(), 1);
    rpc.add_block(make_block_with(9, 0, vec![cb9], false));
    // Height 10 (to be orphaned) spends it.
    let spend = spend_tx(&funded.txid, funded.vout, &[("t1gone", 100 * COIN)]);
    rpc.add_block(make_block_with(
        10,
        0,
        vec![coinbase_tx(10, "t1miner", 75 * COIN, &[]), spend],
        false,
    ));

    let (mut engine, store, _dir) = new_engine(rpc.clone(), test_config());
    sync_to_tip(&mut engine).await;
    assert!(store.utxo(&funded).unwrap().unwrap().spent);

    // Fork away the spending block.
    rpc.rewind_to(9);
    rpc.add_block(make_block_linked(
        10,
        1,
        Some(block_hash(9, 0)),
        vec![coinbase_tx(10, "t1other", 75 * COIN, &[])],
        false,
    ));
    rpc.add_block(make_block_linked(
        11,
        1,
        Some(block_hash(10, 1)),
        vec![coinbase_tx(11, "t1other", 75 * COIN, &[])],
        false,
    ));
    sync_to_tip(&mut engine).await;

    // The funded UTXO is unspent again and the balance restored.
    let utxo = store.utxo(&funded).unwrap().unwrap();
    assert!(!utxo.spent);
    assert_eq!(utxo.spent_txid, None);
    let fund = store.address_summary("t1fund").unwrap().unwrap();
    assert_eq!(fund.balance, 100 * COIN);
    assert_eq!(fund.unspent_count, 1);
    assert!(store.address_summary("t1gone").unwrap().is_none());
}

#[tokio::test]
async fn reorg_beyond_depth_bound_is_fatal() {
    let rpc = Arc::new(FixtureRpc::new());
    seed_chain(&rpc, 10, &|_h| vec![]);

    let mut config = test_config();
    config.indexer_max_reorg_depth = 2;
    let (mut engine, _store, _dir) = new_engine(rpc.clone(), config);
    sync_to_tip(&mut engine).await;

    // Replace a five-block suffix: deeper than the bound.
    rpc.rewind_to(5);
    rpc.add_block(make_block_linked(
        6,
        1,
        Some(block_hash(5, 0)),
        vec![coinbase_tx(6, "t1fork", 75 * COIN, &[])],
        false,
    ));
    for height in 7..=11 {
        rpc.add_block(make_block_linked(
            height,
            1,
            Some(block_hash(height - 1, 1)),
            vec![coinbase_tx(height, "t1fork", 75 * COIN, &[])],
            false,
        ));
    }

    let err = engine.sync_once().await.unwrap_err();
    assert!(err.is_fatal());
}

#[tokio::test]
async fn s6_batch_fallback_to_thin_block() {
    let rpc = Arc::new(FixtureRpc::new());
    seed_chain(&rpc, 7, &|_h| vec![("t1thin".to_string(), 45 * COIN)]);
    // One block in the middle only serves at verbosity 1; its
    // transactions must be refetched individually.
    rpc.serve_thin(4);

    let (mut engine, store, _dir) = new_engine(rpc.clone(), test_config());
    sync_to_tip(&mut engine).await;

    assert_eq!(store.sync_state().unwrap().current_height, 7);
    let block4 = store.block_by_height(4).unwrap().unwrap();
    assert_eq!(block4.tx_count, 1);
    assert_eq!(block4.producer.as_deref(), Some("t1miner"));
    // The thin block's outputs landed like any other block's.
    let summary = store.address_summary("t1thin").unwrap().unwrap();
    assert_eq!(summary.unspent_count, 7);
}

#[tokio::test]
async fn fast_sync_rebuilds_summaries_on_exit() {
    let rpc = Arc::new(FixtureRpc::new());
    seed_chain(&rpc, 20, &|_h| vec![("t1deep".to_string(), 45 * COIN)]);

    let mut config = test_config();
    config.indexer_fast_sync_threshold = 5;
    config.indexer_batch_size = 10;
    let (mut engine, store, _dir) = new_engine(rpc.clone(), config);
    sync_to_tip(&mut engine).await;

    let state = store.sync_state().unwrap();
    assert_eq!(state.current_height, 20);
    assert!(!state.fast_sync);

    // Summaries exist despite most blocks having been ingested with
    // summary maintenance suppressed.
    let summary = store.address_summary("t1deep").unwrap().unwrap();
    assert_eq!(summary.balance, 20 * 45 * COIN);
    assert_eq!(summary.unspent_count, 20);
    assert_eq!(summary.tx_count, 20);
}

#[tokio::test]
async fn safety_buffer_holds_below_headers_while_daemon_syncs() {
    let rpc = Arc::new(FixtureRpc::new());
    seed_chain(&rpc, 28, &|_h| vec![]);
    // Daemon still syncing: 30 headers known, 25 blocks validated.
    rpc.set_headers(30);
    rpc.set_daemon_blocks(25);

    let mut config = test_config();
    config.indexer_batch_size = 10;
    config.indexer_safety_buffer = 10;
    let (mut engine, store, _dir) = new_engine(rpc.clone(), config);

    // While more than `buffer` behind headers, the target is clamped to
    // headers - buffer = 20 even though the daemon has more blocks.
    for _ in 0..3 {
        engine.sync_once().await.unwrap();
    }
    assert_eq!(store.sync_state().unwrap().current_height, 20);

    // Within the buffer the clamp lifts, bounded by the daemon's
    // validated blocks.
    sync_to_tip(&mut engine).await;
    let state = store.sync_state().unwrap();
    assert_eq!(state.current_height, 25);
    assert!(!state.is_syncing);
}

#[tokio::test]
async fn batch_failure_does_not_advance_state() {
    let rpc = Arc::new(FixtureRpc::new());
    seed_chain(&rpc, 5, &|_h| vec![]);
    rpc.break_height(4);

    let (mut engine, store, _dir) = new_engine(rpc.clone(), test_config());
    // First batch (0..=2) lands.
    assert_eq!(engine.sync_once().await.unwrap(), SyncOutcome::Advanced);
    assert_eq!(store.sync_state().unwrap().current_height, 2);
    // Second batch (3..=5) fails on the broken block and state stays put.
    assert!(engine.sync_once().await.is_err());
    assert_eq!(store.sync_state().unwrap().current_height, 2);
}

#[tokio::test]
async fn replaying_the_chain_yields_identical_projections() {
    let rpc = Arc::new(FixtureRpc::new());
    seed_chain(&rpc, 8, &|h| {
        if h % 2 == 0 {
            vec![("t1even".to_string(), 45 * COIN)]
        } else {
            vec![("t1odd".to_string(), 11 * COIN + COIN / 4)]
        }
    });

    let (mut first_engine, first_store, _dir1) = new_engine(rpc.clone(), test_config());
    sync_to_tip(&mut first_engine).await;
    let (mut second_engine, second_store, _dir2) = new_engine(rpc.clone(), test_config());
    sync_to_tip(&mut second_engine).await;

    // Byte-for-byte equality of the materialized projections.
    for summary in first_store.all_address_summaries().unwrap() {
        let other = second_store
            .address_summary(&summary.address)
            .unwrap()
            .unwrap();
        assert_eq!(
            bincode::serialize(&summary).unwrap(),
            bincode::serialize(&other).unwrap()
        );
    }
    for height in 0..=8u32 {
        let a = first_store.block_by_height(height).unwrap().unwrap();
        let b = second_store.block_by_height(height).unwrap().unwrap();
        assert_eq!(
            bincode::serialize(&a).unwrap(),
            bincode::serialize(&b).unwrap()
        );
        for txid in first_store.block_txids(height).unwrap() {
            let ta = first_store.transaction(&txid).unwrap().unwrap();
            let tb = second_store.transaction(&txid).unwrap().unwrap();
            assert_eq!(
                bincode::serialize(&ta).unwrap(),
                bincode::serialize(&tb).unwrap()
            );
        }
    }
    // UTXO rows, including their merge versions, are identical.
    for utxo in first_store.utxos_created_above(0).unwrap() {
        let other = second_store
            .utxo(&OutPoint::new(utxo.txid.clone(), utxo.vout))
            .unwrap()
            .unwrap();
        assert_eq!(utxo.version, other.version);
        assert_eq!(
            bincode::serialize(&utxo).unwrap(),
            bincode::serialize(&other).unwrap()
        );
    }

    let a = first_store.latest_supply().unwrap().unwrap();
    let b = second_store.latest_supply().unwrap().unwrap();
    assert_eq!(a.transparent, b.transparent);
}

#[tokio::test]
async fn sync_state_matches_max_block_after_every_batch() {
    let rpc = Arc::new(FixtureRpc::new());
    seed_chain(&rpc, 10, &|_h| vec![]);

    let (mut engine, store, _dir) = new_engine(rpc.clone(), test_config());
    loop {
        let outcome = engine.sync_once().await.unwrap();
        let state = store.sync_state().unwrap();
        if state.current_height >= 0 {
            let height = state.current_height as u32;
            // Invariants 5 and 6 at every batch boundary.
            assert_eq!(
                store.block_hash_at(height).unwrap().unwrap(),
                state.last_block_hash
            );
            assert!(store.blocks_above(height).unwrap().is_empty());
        }
        if outcome == SyncOutcome::CaughtUp {
            break;
        }
    }
}
