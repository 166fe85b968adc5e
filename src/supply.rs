/// Supply-verification diagnostic.
///
/// Compares the stored cumulative transparent supply against the daemon's
/// valuePools report. A discrepancy above one coin is logged at high
/// severity but is never fatal; it points at a missed spend or a reward
/// mislabel worth investigating.

use tracing::{info, warn};

use crate::rpc::ChainRpc;
use crate::store::Store;
use crate::types::COIN;

#[derive(Debug, Clone, Copy)]
pub struct SupplyCheck {
    pub height: u32,
    pub stored_transparent: i64,
    pub daemon_transparent: i64,
    pub discrepancy: i64,
}

impl SupplyCheck {
    pub fn within_tolerance(&self) -> bool {
        self.discrepancy.abs() <= COIN
    }
}

/// Run the diagnostic at a height. Returns None when either side has no
/// data yet; RPC or store failures are logged and swallowed (the check is
/// advisory).
pub async fn verify_supply<R: ChainRpc>(
    store: &Store,
    rpc: &R,
    height: u32,
) -> Option<SupplyCheck> {
    let stored = match store.supply_at_or_below(height) {
        Ok(Some(row)) => row,
        Ok(None) => return None,
        Err(e) => {
            warn!(error = %e, "supply check could not read stored supply");
            return None;
        }
    };

    let info = match rpc.get_blockchain_info().await {
        Ok(info) => info,
        Err(e) => {
            warn!(error = %e, "supply check could not reach daemon");
            return None;
        }
    };
    let daemon_transparent = info.pool_value("transparent")?;

    let check = SupplyCheck {
        height,
        stored_transparent: stored.transparent,
        daemon_transparent,
        discrepancy: stored.transparent - daemon_transparent,
    };

    if check.within_tolerance() {
        info!(
            height,
            transparent = check.stored_transparent,
            "supply verification passed"
        );
    } else {
        warn!(
            height,
            stored = check.stored_transparent,
            daemon = check.daemon_transparent,
            discrepancy = check.discrepancy,
            "SUPPLY DISCREPANCY exceeds one coin"
        );
    }
    Some(check)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::ValuePool;
    use crate::store::{ops, Store};
    use crate::testutil::FixtureRpc;
    use crate::types::SupplyStatsRow;
    use tempfile::TempDir;

    #[tokio::test]
    async fn flags_discrepancy_above_one_coin() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store
            .commit(vec![ops::put_supply(&SupplyStatsRow {
                height: 50,
                transparent: 1_000 * COIN,
                sapling: 0,
                sprout: 0,
            })
            .unwrap()])
            .unwrap();

        let rpc = FixtureRpc::new();
        rpc.set_pools(vec![ValuePool {
            id: "transparent".to_string(),
            chain_value: 0.0,
            chain_value_zat: Some(998 * COIN),
        }]);

        let check = verify_supply(&store, &rpc, 50).await.unwrap();
        assert_eq!(check.discrepancy, 2 * COIN);
        assert!(!check.within_tolerance());

        // Within one coin: passes.
        rpc.set_pools(vec![ValuePool {
            id: "transparent".to_string(),
            chain_value: 0.0,
            chain_value_zat: Some(1_000 * COIN - COIN / 2),
        }]);
        let check = verify_supply(&store, &rpc, 50).await.unwrap();
        assert!(check.within_tolerance());
    }

    #[tokio::test]
    async fn missing_data_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let rpc = FixtureRpc::new();
        assert!(verify_supply(&store, &rpc, 10).await.is_none());
    }
}
