//! `SearchEngine`: the entry point that wires the cache, analyzer, planner,
//! coordinator, merger and feedback together.
//!
//! ```text
//! submit(query, options)
//!   → ClusterStateCache::get_with      (snapshot)
//!   → QueryAnalyzer::analyze           (classification)
//!   → StrategyPlanner::plan            (+ AdaptiveFeedback advice)
//!   → ExecutionCoordinator::execute    (scatter)
//!   → ResultMerger::merge              (gather)
//!   → AdaptiveFeedback::record         (outcome)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use shardwise_common::config::EngineConfig;
use shardwise_common::error::{ShardwiseError, ShardwiseResult};
use shardwise_common::search::{MergedResult, SearchOptions, SearchQuery};
use shardwise_common::topology::ClusterSnapshot;
use shardwise_planner::analyzer::QueryAnalyzer;
use shardwise_planner::plan::QueryPlan;
use shardwise_planner::planner::StrategyPlanner;
use shardwise_planner::time_mapping::TimeShardMapping;

use crate::coordinator::{ExecutionCoordinator, ScatterMetrics};
use crate::feedback::{AdaptiveFeedback, FeedbackSnapshot, StrategyOutcome};
use crate::merge::ResultMerger;
use crate::topology_cache::{ClusterStateCache, RefreshStats, RefresherHandle};
use crate::transport::{ShardSearcher, TopologySource};

pub struct SearchEngine {
    config: EngineConfig,
    cache: Arc<ClusterStateCache>,
    analyzer: QueryAnalyzer,
    planner: StrategyPlanner,
    coordinator: ExecutionCoordinator,
    feedback: Arc<AdaptiveFeedback>,
    refresher: Mutex<Option<RefresherHandle>>,
    last_scatter_stats: Mutex<ScatterMetrics>,
}

impl SearchEngine {
    /// Validates `config` and builds every component. No call is made to
    /// the cluster until the first `submit` or `start_refresher`.
    pub fn new(
        config: EngineConfig,
        topology: Arc<dyn TopologySource>,
        searcher: Arc<dyn ShardSearcher>,
    ) -> ShardwiseResult<Self> {
        config.validate()?;
        Ok(Self {
            cache: Arc::new(ClusterStateCache::new(topology, config.topology.clone())),
            analyzer: QueryAnalyzer::new(&config.planner),
            planner: StrategyPlanner::new(&config),
            coordinator: ExecutionCoordinator::new(searcher, &config),
            feedback: Arc::new(AdaptiveFeedback::new(config.feedback.clone())),
            refresher: Mutex::new(None),
            last_scatter_stats: Mutex::new(ScatterMetrics::default()),
            config,
        })
    }

    /// Attach a time→shard mapping used to narrow time-series queries.
    pub fn with_time_mapping(mut self, mapping: Arc<dyn TimeShardMapping>) -> Self {
        self.planner = self.planner.with_time_mapping(mapping);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ClusterStateCache> {
        &self.cache
    }

    pub fn feedback(&self) -> &Arc<AdaptiveFeedback> {
        &self.feedback
    }

    pub fn feedback_snapshot(&self) -> FeedbackSnapshot {
        self.feedback.snapshot()
    }

    pub fn topology_stats(&self) -> RefreshStats {
        self.cache.stats()
    }

    /// Scatter metrics of the most recent successful fan-out.
    pub fn last_scatter_stats(&self) -> ScatterMetrics {
        self.last_scatter_stats.lock().clone()
    }

    /// Start periodic topology refresh. Must be called inside a tokio
    /// runtime; a second call is a no-op while the first task runs.
    pub fn start_refresher(&self) {
        let mut slot = self.refresher.lock();
        if slot.as_ref().is_some_and(|h| h.is_running()) {
            return;
        }
        *slot = Some(self.cache.spawn_refresher());
    }

    /// Stop the background refresher, if running, and wait for it to exit.
    pub async fn shutdown(&self) {
        let handle = self.refresher.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    /// The plan `submit` would execute, without issuing any shard call.
    pub async fn explain(
        &self,
        query: &SearchQuery,
        options: &SearchOptions,
    ) -> ShardwiseResult<QueryPlan> {
        let snapshot = self.snapshot_within(options).await?;
        let classification = self.analyzer.analyze(query)?;
        self.planner.plan(
            query,
            &classification,
            &snapshot,
            options,
            self.feedback.as_ref(),
        )
    }

    pub async fn submit(
        &self,
        query: SearchQuery,
        options: SearchOptions,
    ) -> ShardwiseResult<MergedResult> {
        let started = Instant::now();
        let result = self.submit_inner(&query, &options, started).await;
        let elapsed_us = started.elapsed().as_micros() as u64;
        match &result {
            Ok((plan, merged)) => {
                let outcome = if merged.is_partial() { "partial" } else { "ok" };
                shardwise_observability::record_query_metrics(
                    elapsed_us,
                    &plan.pattern.to_string(),
                    outcome,
                );
            }
            Err((plan, e)) => {
                let pattern = plan
                    .as_ref()
                    .map(|p| p.pattern.to_string())
                    .unwrap_or_else(|| "unplanned".to_string());
                shardwise_observability::record_query_metrics(
                    elapsed_us,
                    &pattern,
                    e.label(),
                );
            }
        }
        result.map(|(_, merged)| merged).map_err(|(_, e)| e)
    }

    /// Planning snapshot, waiting no longer than the caller's latency budget.
    async fn snapshot_within(&self, options: &SearchOptions) -> ShardwiseResult<Arc<ClusterSnapshot>> {
        let Some(budget) = options.max_latency else {
            return self.cache.get_with(options.freshness).await;
        };
        match tokio::time::timeout(budget, self.cache.get_with(options.freshness)).await {
            Ok(snapshot) => snapshot,
            Err(_elapsed) => {
                let age_ms = self.cache.current().map(|s| s.age().as_millis() as u64);
                let budget_ms = budget.as_millis() as u64;
                tracing::warn!(budget_ms, ?age_ms, "latency budget spent waiting for topology");
                Err(ShardwiseError::stale(
                    age_ms,
                    format!("no usable topology within the {}ms latency budget", budget_ms),
                ))
            }
        }
    }

    async fn submit_inner(
        &self,
        query: &SearchQuery,
        options: &SearchOptions,
        started: Instant,
    ) -> Result<(QueryPlan, MergedResult), (Option<QueryPlan>, ShardwiseError)> {
        let snapshot = self
            .snapshot_within(options)
            .await
            .map_err(|e| (None, e))?;
        // the topology wait is charged against the caller's budget
        let options = SearchOptions {
            max_latency: options
                .max_latency
                .map(|budget| budget.saturating_sub(started.elapsed())),
            ..options.clone()
        };
        let classification = self.analyzer.analyze(query).map_err(|e| (None, e))?;
        let plan = self
            .planner
            .plan(
                query,
                &classification,
                &snapshot,
                &options,
                self.feedback.as_ref(),
            )
            .map_err(|e| (None, e))?;

        let scatter = match self.coordinator.execute(&plan, &snapshot).await {
            Ok(scatter) => scatter,
            Err(e) => {
                self.feedback
                    .record(failure_outcome(&plan, &e, started.elapsed()));
                return Err((Some(plan), e));
            }
        };

        let merged = ResultMerger::merge(&plan, &scatter.results, started.elapsed());
        self.feedback.record(StrategyOutcome {
            pattern: plan.pattern,
            shards_queried: merged.shards_queried,
            shards_failed: merged.shards_failed,
            hit_count: merged.hits.len(),
            served_nodes: scatter.served_nodes().into_iter().collect(),
            failed_nodes: scatter.failed_nodes().into_iter().collect(),
            latency: merged.took,
            success: true,
        });
        *self.last_scatter_stats.lock() = scatter.metrics;

        tracing::debug!(
            index = %plan.index,
            pattern = %plan.pattern,
            hits = merged.hits.len(),
            total_hits = merged.total_hits.value,
            shards_failed = merged.shards_failed,
            took_us = merged.took.as_micros() as u64,
            "search completed"
        );
        Ok((plan, merged))
    }
}

/// Outcome recorded when execution fails after planning.
fn failure_outcome(plan: &QueryPlan, error: &ShardwiseError, latency: Duration) -> StrategyOutcome {
    let (shards_queried, shards_failed, failed_nodes) = match error {
        ShardwiseError::ShardUnavailable {
            shards_targeted,
            failed,
        } => (
            *shards_targeted,
            failed.len(),
            failed.iter().filter_map(|f| f.node.clone()).collect(),
        ),
        ShardwiseError::Timeout {
            shards_targeted,
            pending,
            ..
        } => (*shards_targeted, pending.len(), Vec::new()),
        _ => (plan.target_shards.len(), 0, Vec::new()),
    };
    StrategyOutcome {
        pattern: plan.pattern,
        shards_queried,
        shards_failed,
        hit_count: 0,
        served_nodes: Vec::new(),
        failed_nodes,
        latency,
        success: false,
    }
}
