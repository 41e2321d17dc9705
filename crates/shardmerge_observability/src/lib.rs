//! Observability setup: structured logging, metrics (Prometheus).

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,shardmerge=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Initialize the Prometheus metrics exporter on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

/// Record one finished merge.
pub fn record_merge(strategy: &str, rows_emitted: u64, duration_us: u64, success: bool) {
    metrics::counter!(
        "shardmerge_merges_total",
        "strategy" => strategy.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
    metrics::counter!("shardmerge_rows_emitted_total", "strategy" => strategy.to_string())
        .increment(rows_emitted);
    metrics::histogram!("shardmerge_merge_duration_us", "strategy" => strategy.to_string())
        .record(duration_us as f64);
}

/// Record the memory strategy's map phase (scan + local accumulation).
pub fn record_map_phase(shards: usize, buffered: usize, duration_us: u64) {
    metrics::histogram!("shardmerge_map_phase_duration_us").record(duration_us as f64);
    metrics::gauge!("shardmerge_map_phase_shards").set(shards as f64);
    metrics::gauge!("shardmerge_map_phase_buffered").set(buffered as f64);
}

/// Record a shard cursor failure observed by the engine.
pub fn record_shard_failure(phase: &str) {
    metrics::counter!("shardmerge_shard_failures_total", "phase" => phase.to_string())
        .increment(1);
}
