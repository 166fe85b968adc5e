use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use fluxblox::api::{self, ApiState};
use fluxblox::bulk_loader::BulkLoader;
use fluxblox::cache::ApiCache;
use fluxblox::config::init_global_config;
use fluxblox::fluxnode::run_fluxnode_sync;
use fluxblox::rpc::RpcClient;
use fluxblox::store::Store;
use fluxblox::sync::SyncEngine;
use fluxblox::telemetry::init_tracing;

/// Exit code for a reorg beyond the configured depth; the operator must
/// inspect and resync from a safe height.
const EXIT_REORG_DEPTH: i32 = 2;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = init_global_config()?;
    init_tracing(config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        store = %config.store_path,
        rpc = %config.flux_rpc_url,
        "fluxblox starting"
    );

    let store = Store::open(&config.store_path)?;
    let rpc = RpcClient::new(
        config.flux_rpc_url.clone(),
        config.flux_rpc_user.clone(),
        config.flux_rpc_password.clone(),
        Duration::from_millis(config.flux_rpc_timeout),
    );

    let sink = store.spawn_sink();
    let loader = BulkLoader::new(store.clone(), sink)?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    // Read-only API on the same runtime.
    let api_state = ApiState {
        store: store.clone(),
        rpc: rpc.clone(),
        cache: Arc::new(ApiCache::default()),
    };
    let api_config = config.clone();
    tokio::spawn(async move {
        if let Err(e) = api::serve(api_state, &api_config).await {
            error!(error = %e, "api server failed");
        }
    });

    // Secondary sync: FluxNode ledger refresh.
    tokio::spawn(run_fluxnode_sync(
        rpc.clone(),
        store.clone(),
        config.indexer_node_refresh_interval,
        shutdown.clone(),
    ));

    // The sync engine owns the write path and runs until shutdown.
    let mut engine = SyncEngine::new(
        rpc,
        store,
        loader,
        config.clone(),
        shutdown.clone(),
    );
    match engine.run().await {
        Ok(()) => {
            info!("clean shutdown");
            Ok(())
        }
        Err(e) if e.is_fatal() => {
            error!(error = %e, "exiting on fatal sync error");
            std::process::exit(EXIT_REORG_DEPTH);
        }
        Err(e) => Err(Box::new(e) as Box<dyn std::error::Error>),
    }
}

/// First signal: finish the in-flight batch and drain. Second signal:
/// terminate abruptly; the next start runs reorg-aware recovery.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("shutdown requested, finishing in-flight batch");
        shutdown.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second signal, terminating now");
            std::process::exit(1);
        }
    });
}
