/// Secondary sync: the live FluxNode ledger.
///
/// Block ingestion captures node start/confirm transactions; this loop
/// complements them with the daemon's own view of currently registered
/// nodes (tier, confirmation heights, rank) on its own cadence. The
/// ledger is replaced wholesale on every refresh.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::rpc::{ChainRpc, FluxNodeEntry};
use crate::store::{ops, Store, StoreError, WriteOp};
use crate::types::{FluxNodeRow, Tier};

fn tier_from_str(tier: &str) -> Option<Tier> {
    match tier.to_ascii_uppercase().as_str() {
        "CUMULUS" | "BASIC" => Some(Tier::Cumulus),
        "NIMBUS" | "SUPER" => Some(Tier::Nimbus),
        "STRATUS" | "BAMF" => Some(Tier::Stratus),
        _ => None,
    }
}

fn to_row(entry: &FluxNodeEntry) -> FluxNodeRow {
    FluxNodeRow {
        ip: entry.ip.clone(),
        tier: entry.tier.as_deref().and_then(tier_from_str),
        payment_address: entry.payment_address.clone(),
        txid: entry.txhash.clone(),
        vout: entry.outidx,
        added_height: entry.added_height,
        confirmed_height: entry.confirmed_height,
        last_confirmed_height: entry.last_confirmed_height,
        last_paid_height: entry.last_paid_height,
        rank: entry.rank,
    }
}

/// One refresh pass: fetch the node list and replace the ledger.
pub async fn refresh_nodes<R: ChainRpc>(rpc: &R, store: &Store) -> Result<usize, StoreError> {
    let entries = match rpc.list_flux_nodes().await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "fluxnode list refresh failed");
            return Ok(0);
        }
    };

    let mut batch: Vec<WriteOp> = store.clear_fluxnodes()?;
    let mut kept = 0usize;
    for entry in &entries {
        if entry.ip.is_empty() {
            continue;
        }
        batch.push(ops::put_fluxnode(&to_row(entry))?);
        kept += 1;
    }
    store.commit(batch)?;
    debug!(nodes = kept, "fluxnode ledger refreshed");
    Ok(kept)
}

/// Long-running refresh loop; exits on shutdown.
pub async fn run_fluxnode_sync<R: ChainRpc>(
    rpc: R,
    store: Store,
    interval_ms: u64,
    shutdown: CancellationToken,
) {
    let interval = Duration::from_millis(interval_ms.max(1_000));
    loop {
        if let Err(e) = refresh_nodes(&rpc, &store).await {
            warn!(error = %e, "fluxnode ledger refresh errored");
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FixtureRpc;
    use tempfile::TempDir;

    fn entry(ip: &str, tier: &str, rank: Option<u32>) -> FluxNodeEntry {
        FluxNodeEntry {
            collateral: None,
            txhash: "ab".repeat(32),
            outidx: 0,
            ip: ip.to_string(),
            tier: Some(tier.to_string()),
            payment_address: "t1pay".to_string(),
            added_height: 100,
            confirmed_height: 101,
            last_confirmed_height: 230,
            last_paid_height: 200,
            rank,
        }
    }

    #[tokio::test]
    async fn refresh_replaces_ledger() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let rpc = FixtureRpc::new();

        rpc.set_nodes(vec![
            entry("203.0.113.1:16125", "CUMULUS", Some(4)),
            entry("203.0.113.2:16125", "STRATUS", None),
        ]);
        assert_eq!(refresh_nodes(&rpc, &store).await.unwrap(), 2);
        assert_eq!(store.fluxnodes().unwrap().len(), 2);

        let node = store.fluxnode("203.0.113.1:16125").unwrap().unwrap();
        assert_eq!(node.tier, Some(Tier::Cumulus));
        assert_eq!(node.rank, Some(4));

        // A shrunk list fully replaces the previous ledger.
        rpc.set_nodes(vec![entry("203.0.113.2:16125", "NIMBUS", Some(1))]);
        assert_eq!(refresh_nodes(&rpc, &store).await.unwrap(), 1);
        let nodes = store.fluxnodes().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].tier, Some(Tier::Nimbus));
    }

    #[test]
    fn tier_aliases() {
        assert_eq!(tier_from_str("cumulus"), Some(Tier::Cumulus));
        assert_eq!(tier_from_str("BAMF"), Some(Tier::Stratus));
        assert_eq!(tier_from_str("unknown"), None);
    }
}
