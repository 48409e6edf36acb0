//! Observability setup: structured logging, Prometheus metrics and the
//! recording helpers the engine calls on its hot paths.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,shardwise=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    // A second call (tests, embedding binaries) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

/// Initialize the Prometheus exporter with an HTTP listener on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

/// Record one `submit` call. `outcome` is `"ok"`, `"partial"` or an error label.
pub fn record_query_metrics(duration_us: u64, pattern: &str, outcome: &str) {
    metrics::counter!(
        "shardwise_queries_total",
        "pattern" => pattern.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    metrics::histogram!("shardwise_query_duration_us", "pattern" => pattern.to_string())
        .record(duration_us as f64);
}

/// Record one per-shard sub-request.
pub fn record_shard_call(index: &str, latency_us: u64, success: bool) {
    metrics::counter!(
        "shardwise_shard_calls_total",
        "index" => index.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
    metrics::histogram!("shardwise_shard_latency_us", "index" => index.to_string())
        .record(latency_us as f64);
}

/// Record a topology refresh attempt and the resulting snapshot shape.
pub fn record_topology_refresh(success: bool, shard_copies: usize, health: &str) {
    metrics::counter!("shardwise_topology_refresh_total", "success" => success.to_string())
        .increment(1);
    if success {
        metrics::gauge!("shardwise_topology_shard_copies").set(shard_copies as f64);
        metrics::gauge!("shardwise_topology_degraded").set(if health == "green" { 0.0 } else { 1.0 });
    }
}

/// Record the current moving averages of one feedback pattern.
pub fn record_feedback_pattern(
    pattern: &str,
    latency_ewma_ms: f64,
    failure_ewma: f64,
    samples: u64,
) {
    metrics::gauge!("shardwise_feedback_latency_ewma_ms", "pattern" => pattern.to_string())
        .set(latency_ewma_ms);
    metrics::gauge!("shardwise_feedback_failure_ewma", "pattern" => pattern.to_string())
        .set(failure_ewma);
    metrics::gauge!("shardwise_feedback_samples", "pattern" => pattern.to_string())
        .set(samples as f64);
}
