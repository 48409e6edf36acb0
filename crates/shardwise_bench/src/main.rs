//! Shardwise workload harness.
//!
//! Builds a simulated cluster, drives a mix of full fan-out, tenant-scoped
//! and time-range queries through `SearchEngine::submit`, and reports
//! latency percentiles, coverage and the per-pattern feedback averages.
//!
//! Usage:
//!   cargo run -p shardwise_bench -- --queries 5000 --shards 8 --tenant-pct 40
//!   cargo run -p shardwise_bench -- --fail-shard 2 --allow-partial
//!   cargo run -p shardwise_bench -- --print-default-config > shardwise.toml

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tokio::task::JoinSet;

use shardwise_cluster::{SearchEngine, ShardSearcher, SimulatedCluster, TopologySource};
use shardwise_cluster::simulated::{SHARD_TIME_SPAN_MS, TENANTS};
use shardwise_common::config::EngineConfig;
use shardwise_common::error::ShardError;
use shardwise_common::search::{SearchOptions, SearchQuery};
use shardwise_common::types::ShardId;

const INDEX: &str = "bench";

/// Shardwise workload benchmark.
#[derive(Parser, Debug)]
#[command(name = "shardwise-bench", about = "Workload harness for the Shardwise query engine")]
struct Args {
    /// Path to a TOML engine config. Missing file means defaults.
    #[arg(short, long, default_value = "shardwise.toml")]
    config: String,

    /// Total number of queries to submit.
    #[arg(long, default_value_t = 2000)]
    queries: u64,

    /// Queries in flight at once.
    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// Number of primary shards.
    #[arg(long, default_value_t = 6)]
    shards: u32,

    /// Replicas per shard.
    #[arg(long, default_value_t = 1)]
    replicas: u32,

    /// Documents generated per shard.
    #[arg(long, default_value_t = 500)]
    docs_per_shard: usize,

    /// Percentage of tenant-scoped queries (0-100).
    #[arg(long, default_value_t = 30)]
    tenant_pct: u8,

    /// Percentage of time-range queries (0-100), taken from the non-tenant share.
    #[arg(long, default_value_t = 20)]
    time_pct: u8,

    /// Make every call to this shard fail.
    #[arg(long)]
    fail_shard: Option<u32>,

    /// Delay every shard call by this many milliseconds.
    #[arg(long, default_value_t = 0)]
    slow_shard_ms: u64,

    /// Accept partial results instead of failing on shard errors.
    #[arg(long, default_value_t = false)]
    allow_partial: bool,

    /// Prometheus exporter address, e.g. 0.0.0.0:9464.
    #[arg(long)]
    metrics_addr: Option<String>,

    /// Print the default config as TOML and exit.
    #[arg(long)]
    print_default_config: bool,
}

/// Simple deterministic pseudo-random (xorshift64).
struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Self(if seed == 0 { 1 } else { seed })
    }
    fn next_u64(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
    fn next_pct(&mut self) -> u8 {
        (self.next_u64() % 100) as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum QueryKind {
    FanOut,
    Tenant,
    TimeRange,
}

impl QueryKind {
    fn label(self) -> &'static str {
        match self {
            QueryKind::FanOut => "fan-out",
            QueryKind::Tenant => "tenant",
            QueryKind::TimeRange => "time-range",
        }
    }
}

fn make_query(rng: &mut Rng, args: &Args) -> (QueryKind, SearchQuery) {
    let roll = rng.next_pct();
    if roll < args.tenant_pct {
        let tenant = format!("tenant-{}", rng.next_u64() % TENANTS as u64);
        let body = json!({"query": {"term": {"tenant_id": tenant}}, "size": 10});
        (QueryKind::Tenant, SearchQuery::new(INDEX, body))
    } else if roll < args.tenant_pct.saturating_add(args.time_pct) {
        let span = i64::from(args.shards.max(1)) * SHARD_TIME_SPAN_MS;
        let from = (rng.next_u64() % span as u64) as i64;
        let to = (from + SHARD_TIME_SPAN_MS).min(span - 1);
        let body = json!({
            "query": {"bool": {"filter": [{"range": {"@timestamp": {"gte": from, "lte": to}}}]}},
            "size": 20
        });
        (QueryKind::TimeRange, SearchQuery::new(INDEX, body))
    } else {
        let body = json!({
            "size": 10,
            "aggs": {"hosts": {"terms": {"field": "host", "size": 3}}}
        });
        (QueryKind::FanOut, SearchQuery::new(INDEX, body))
    }
}

fn load_config(path: &str) -> EngineConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => match EngineConfig::from_toml_str(&content) {
            Ok(config) => {
                tracing::info!("Loaded config from {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("Failed to load config {}: {}, using defaults", path, e);
                EngineConfig::default()
            }
        },
        Err(_) => {
            tracing::info!("Config file {} not found, using defaults", path);
            EngineConfig::default()
        }
    }
}

#[derive(Debug, Default)]
struct KindStats {
    latencies_us: Vec<u64>,
    partial: u64,
    errors: BTreeMap<&'static str, u64>,
}

fn percentile(sorted: &[u64], q: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

fn print_report(stats: &BTreeMap<QueryKind, KindStats>, elapsed: Duration, engine: &SearchEngine) {
    let total: usize = stats.values().map(|s| s.latencies_us.len()).sum();
    let failed: u64 = stats.values().flat_map(|s| s.errors.values()).sum();
    println!("═══════════════════════════════════════════════");
    println!("  Shardwise workload");
    println!("═══════════════════════════════════════════════");
    println!("  Queries:           {}", total as u64 + failed);
    println!("  Succeeded:         {}", total);
    println!("  Failed:            {}", failed);
    println!("  Elapsed:           {} ms", elapsed.as_millis());
    println!(
        "  QPS:               {:.1}",
        (total as u64 + failed) as f64 / elapsed.as_secs_f64().max(1e-9)
    );
    println!("  ─── Latency (µs) ───");
    for (kind, s) in stats {
        let mut sorted = s.latencies_us.clone();
        sorted.sort_unstable();
        println!(
            "  {:<11} p50={:>7}  p95={:>7}  p99={:>7}  (n={}, partial={})",
            kind.label(),
            percentile(&sorted, 0.50),
            percentile(&sorted, 0.95),
            percentile(&sorted, 0.99),
            sorted.len(),
            s.partial,
        );
        for (label, count) in &s.errors {
            println!("  {:<11}   error {}: {}", "", label, count);
        }
    }

    println!("  ─── Feedback ───");
    let feedback = engine.feedback_snapshot();
    for p in &feedback.patterns {
        println!(
            "  {:<28} n={:>6}  latency_ewma={:>8.2}ms  cv={:.3}  failure_ewma={:.3}",
            p.pattern.to_string(),
            p.samples,
            p.latency_ewma_ms,
            p.latency_cv(),
            p.failure_ewma,
        );
    }
    for n in feedback.nodes.iter().filter(|n| n.failure_ewma > 0.0) {
        println!(
            "  {:<28} n={:>6}  failure_ewma={:.3}",
            n.node.to_string(),
            n.samples,
            n.failure_ewma
        );
    }

    let topo = engine.topology_stats();
    println!("  ─── Topology ───");
    println!(
        "  refreshes={}  failures={}  collapsed={}  health={}",
        topo.attempts,
        topo.failures,
        topo.collapsed,
        topo.health.map(|h| h.to_string()).unwrap_or_else(|| "-".into()),
    );
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_default_config {
        let toml_str = EngineConfig::default()
            .to_toml_string()
            .unwrap_or_else(|e| format!("# failed to serialize default config: {}", e));
        println!("{}", toml_str);
        return Ok(());
    }

    shardwise_observability::init_tracing();
    if let Some(addr) = &args.metrics_addr {
        shardwise_observability::init_metrics(addr)
            .map_err(|e| anyhow::anyhow!("Invalid metrics address '{}': {}", addr, e))?;
    }

    let mut config = load_config(&args.config);
    if args.allow_partial {
        config.execution.allow_partial = true;
    }

    let cluster = Arc::new(SimulatedCluster::uniform(
        INDEX,
        args.shards,
        args.replicas,
        args.docs_per_shard,
    ));
    if let Some(shard) = args.fail_shard {
        cluster
            .faults()
            .fail_shard(ShardId(shard), ShardError::Transport("injected failure".into()));
    }
    if args.slow_shard_ms > 0 {
        for s in 0..args.shards {
            cluster
                .faults()
                .delay_shard(ShardId(s), Duration::from_millis(args.slow_shard_ms));
        }
    }

    let engine = Arc::new(
        SearchEngine::new(
            config,
            Arc::clone(&cluster) as Arc<dyn TopologySource>,
            Arc::clone(&cluster) as Arc<dyn ShardSearcher>,
        )
        .map_err(|e| anyhow::anyhow!("{}", e))?
        .with_time_mapping(Arc::new(cluster.time_mapping())),
    );
    engine.start_refresher();
    tracing::info!(
        queries = args.queries,
        shards = args.shards,
        replicas = args.replicas,
        concurrency = args.concurrency,
        "starting workload"
    );

    let mut rng = Rng::new(0x5eed_cafe);
    let mut stats: BTreeMap<QueryKind, KindStats> = BTreeMap::new();
    let mut tasks = JoinSet::new();
    let started = Instant::now();
    let mut submitted = 0u64;

    while submitted < args.queries || !tasks.is_empty() {
        while submitted < args.queries && tasks.len() < args.concurrency.max(1) {
            let (kind, query) = make_query(&mut rng, &args);
            let engine = Arc::clone(&engine);
            tasks.spawn(async move {
                let t = Instant::now();
                let result = engine.submit(query, SearchOptions::default()).await;
                (kind, t.elapsed(), result)
            });
            submitted += 1;
        }
        let Some(joined) = tasks.join_next().await else {
            continue;
        };
        let (kind, latency, result) = joined?;
        let entry = stats.entry(kind).or_default();
        match result {
            Ok(merged) => {
                entry.latencies_us.push(latency.as_micros() as u64);
                if merged.is_partial() {
                    entry.partial += 1;
                }
            }
            Err(e) => {
                tracing::debug!(kind = kind.label(), error = %e, "query failed");
                *entry.errors.entry(e.label()).or_insert(0) += 1;
            }
        }
    }
    let elapsed = started.elapsed();

    engine.shutdown().await;
    print_report(&stats, elapsed, &engine);
    Ok(())
}
