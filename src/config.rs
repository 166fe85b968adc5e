/// Environment-driven configuration.
///
/// Every knob has a default and can be overridden through the process
/// environment (FLUX_RPC_URL, INDEXER_BATCH_SIZE, API_PORT, ...). The
/// typed `IndexerConfig` is built once at startup; the sync core receives
/// owned copies and never reads process globals. The `OnceCell` accessor
/// exists for the API layer and standalone entry points only.

use config::{Config, Environment};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::error::Error;

static GLOBAL_CONFIG: OnceCell<IndexerConfig> = OnceCell::new();

#[derive(Debug, Clone, Deserialize)]
pub struct IndexerConfig {
    pub flux_rpc_url: String,
    pub flux_rpc_user: String,
    pub flux_rpc_password: String,
    /// Per-call RPC timeout in milliseconds.
    pub flux_rpc_timeout: u64,

    /// RocksDB directory for the analytical store.
    pub store_path: String,

    pub indexer_batch_size: u32,
    /// Poll interval in milliseconds once near tip.
    pub indexer_polling_interval: u64,
    pub indexer_start_height: u32,
    pub indexer_enable_reorg: bool,
    pub indexer_max_reorg_depth: u32,
    /// Blocks-behind-target above which fast-sync mode engages.
    pub indexer_fast_sync_threshold: u32,
    /// Supply verification cadence, in blocks.
    pub indexer_supply_check_interval: u32,
    /// Safety buffer held below the header tip while the daemon syncs.
    pub indexer_safety_buffer: u32,
    /// Secondary FluxNode-ledger refresh interval in milliseconds.
    pub indexer_node_refresh_interval: u64,

    pub api_port: u16,
    pub api_host: String,
    pub api_cors_enabled: bool,

    pub log_level: String,
    pub log_format: String,
    pub log_file: Option<String>,
}

impl IndexerConfig {
    /// Build from environment variables over baked-in defaults.
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        let cfg = Config::builder()
            .set_default("flux_rpc_url", "http://127.0.0.1:16124")?
            .set_default("flux_rpc_user", "")?
            .set_default("flux_rpc_password", "")?
            .set_default("flux_rpc_timeout", 30_000i64)?
            .set_default("store_path", "./fluxblox-data")?
            .set_default("indexer_batch_size", 200i64)?
            .set_default("indexer_polling_interval", 5_000i64)?
            .set_default("indexer_start_height", 0i64)?
            .set_default("indexer_enable_reorg", true)?
            .set_default("indexer_max_reorg_depth", 100i64)?
            .set_default("indexer_fast_sync_threshold", 1_000i64)?
            .set_default("indexer_supply_check_interval", 10_000i64)?
            .set_default("indexer_safety_buffer", 1_000i64)?
            .set_default("indexer_node_refresh_interval", 120_000i64)?
            .set_default("api_port", 42_067i64)?
            .set_default("api_host", "0.0.0.0")?
            .set_default("api_cors_enabled", true)?
            .set_default("log_level", "info")?
            .set_default("log_format", "pretty")?
            .add_source(Environment::default())
            .build()?;

        let mut parsed: IndexerConfig = cfg.try_deserialize()?;
        if parsed.indexer_batch_size == 0 {
            return Err("INDEXER_BATCH_SIZE must be at least 1".into());
        }
        if parsed.indexer_max_reorg_depth == 0 {
            parsed.indexer_enable_reorg = false;
        }
        Ok(parsed)
    }
}

pub fn init_global_config() -> Result<&'static IndexerConfig, Box<dyn Error>> {
    let config = IndexerConfig::from_env()?;
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| "Config already set")?;
    Ok(get_global_config())
}

pub fn get_global_config() -> &'static IndexerConfig {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: Config not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let cfg = IndexerConfig::from_env().unwrap();
        assert_eq!(cfg.api_port, 42_067);
        assert_eq!(cfg.indexer_polling_interval, 5_000);
        assert_eq!(cfg.indexer_max_reorg_depth, 100);
        assert!(cfg.indexer_enable_reorg);
    }
}
