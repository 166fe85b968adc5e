/// Prometheus instruments for the sync engine and API, exposed at
/// GET /metrics.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static SYNC_HEIGHT: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("fluxblox_sync_height", "Current indexed height").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).ok();
    gauge
});

pub static CHAIN_HEIGHT: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("fluxblox_chain_height", "Daemon header height").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).ok();
    gauge
});

pub static BLOCKS_INDEXED: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("fluxblox_blocks_indexed_total", "Blocks indexed").unwrap();
    REGISTRY.register(Box::new(counter.clone())).ok();
    counter
});

pub static UTXO_ROWS_WRITTEN: Lazy<IntCounter> = Lazy::new(|| {
    let counter =
        IntCounter::new("fluxblox_utxo_rows_written_total", "UTXO rows written").unwrap();
    REGISTRY.register(Box::new(counter.clone())).ok();
    counter
});

pub static RPC_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("fluxblox_rpc_errors_total", "Daemon RPC failures").unwrap();
    REGISTRY.register(Box::new(counter.clone())).ok();
    counter
});

pub static REORGS: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("fluxblox_reorgs_total", "Reorg rollbacks executed").unwrap();
    REGISTRY.register(Box::new(counter.clone())).ok();
    counter
});

pub static FLUSH_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new("fluxblox_flush_seconds", "Bulk loader flush duration")
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0]),
    )
    .unwrap();
    REGISTRY.register(Box::new(histogram.clone())).ok();
    histogram
});

/// Render the registry in the Prometheus text format.
pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .is_err()
    {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruments_register_and_render() {
        SYNC_HEIGHT.set(123);
        BLOCKS_INDEXED.inc();
        let out = render();
        assert!(out.contains("fluxblox_sync_height"));
        assert!(out.contains("fluxblox_blocks_indexed_total"));
    }
}
