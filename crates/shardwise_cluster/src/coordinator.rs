//! Scatter phase: fan a plan out to one copy of each target shard.
//!
//! Sub-requests run as tasks in a `JoinSet`, bounded by a semaphore of
//! `max_parallel_shards` permits. The plan's timeout is a deadline on the
//! whole collection loop; when it expires every outstanding task is aborted.
//! Each sub-request carries only the time left until that deadline.
//!
//! Failure policy:
//! - `allow_partial = false`: the first failed shard aborts the remaining
//!   tasks and fails the call with `ShardUnavailable`; a deadline expiry
//!   fails it with `Timeout`.
//! - `allow_partial = true`: failures and timeouts become error
//!   `ShardResult`s and the call succeeds as long as one shard answered.
//!
//! No shard is retried within a call.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use shardwise_common::config::EngineConfig;
use shardwise_common::error::{ShardError, ShardFailure, ShardwiseError, ShardwiseResult};
use shardwise_common::search::ShardResult;
use shardwise_common::topology::{ClusterSnapshot, ShardDescriptor};
use shardwise_common::types::{NodeId, ShardId};
use shardwise_planner::plan::{Preference, QueryPlan};

use crate::transport::{ShardSearchRequest, ShardSearcher};

/// Per-call scatter metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScatterMetrics {
    pub shards_targeted: usize,
    /// Shards that returned a result.
    pub shards_participated: usize,
    pub shards_failed: usize,
    pub max_shard_latency: Duration,
    pub per_shard_latency: Vec<(ShardId, Duration)>,
    pub total_latency: Duration,
}

/// Results of one fan-out, ordered by shard id.
#[derive(Debug, Clone)]
pub struct ScatterOutcome {
    pub results: Vec<ShardResult>,
    pub metrics: ScatterMetrics,
}

impl ScatterOutcome {
    pub fn failed_shards(&self) -> Vec<ShardId> {
        self.results
            .iter()
            .filter(|r| !r.is_ok())
            .map(|r| r.shard_id)
            .collect()
    }

    /// Nodes that served a successful sub-request.
    pub fn served_nodes(&self) -> BTreeSet<NodeId> {
        self.results
            .iter()
            .filter(|r| r.is_ok())
            .filter_map(|r| r.node.clone())
            .collect()
    }

    /// Nodes a failed sub-request was sent to.
    pub fn failed_nodes(&self) -> BTreeSet<NodeId> {
        self.results
            .iter()
            .filter(|r| !r.is_ok())
            .filter_map(|r| r.node.clone())
            .collect()
    }
}

type TaskOutput = (
    ShardId,
    NodeId,
    Duration,
    Result<crate::transport::ShardSearchResponse, ShardError>,
);

pub struct ExecutionCoordinator {
    searcher: Arc<dyn ShardSearcher>,
    max_parallel: usize,
    local_node: Option<NodeId>,
}

impl ExecutionCoordinator {
    pub fn new(searcher: Arc<dyn ShardSearcher>, config: &EngineConfig) -> Self {
        Self {
            searcher,
            max_parallel: config.execution.max_parallel_shards.max(1),
            local_node: config.planner.local_node.as_deref().map(NodeId::new),
        }
    }

    /// Searchable copies of `shard` in the order the plan's preference asks
    /// for, with copies on avoided nodes moved to the back.
    pub fn candidate_copies(
        &self,
        plan: &QueryPlan,
        snapshot: &ClusterSnapshot,
        shard: ShardId,
    ) -> Vec<NodeId> {
        let searchable: Vec<&ShardDescriptor> = snapshot
            .copies(&plan.index, shard)
            .filter(|d| d.is_searchable())
            .collect();
        let replicas_then_primary = || {
            let (primaries, replicas): (Vec<&ShardDescriptor>, Vec<&ShardDescriptor>) =
                searchable.iter().copied().partition(|d| d.is_primary());
            replicas.into_iter().chain(primaries).collect::<Vec<_>>()
        };

        let mut ordered: Vec<&ShardDescriptor> = match plan.preference {
            Preference::PrimaryOnly => searchable.iter().copied().filter(|d| d.is_primary()).collect(),
            Preference::PrimaryFirst => searchable.clone(),
            Preference::Any => replicas_then_primary(),
            Preference::LocalPreferred => {
                let mut copies = replicas_then_primary();
                if let Some(local) = &self.local_node {
                    copies.sort_by_key(|d| d.node.as_ref() != Some(local));
                }
                copies
            }
        };
        // stable: keeps the preference order within each group
        ordered.sort_by_key(|d| d.node.as_ref().is_some_and(|n| plan.avoid_nodes.contains(n)));
        ordered.into_iter().filter_map(|d| d.node.clone()).collect()
    }

    pub async fn execute(
        &self,
        plan: &QueryPlan,
        snapshot: &ClusterSnapshot,
    ) -> ShardwiseResult<ScatterOutcome> {
        let started = Instant::now();
        let shards: Vec<ShardId> = if plan.is_full_fanout() {
            snapshot.shard_ids(&plan.index).into_iter().collect()
        } else {
            plan.target_shards.iter().copied().collect()
        };
        if shards.is_empty() {
            return Err(ShardwiseError::internal_bug(
                "E-COORD-001",
                format!("plan for '{}' targets no shards", plan.index),
            ));
        }
        let shards_targeted = shards.len();
        let mut results: BTreeMap<ShardId, ShardResult> = BTreeMap::new();

        // Choose copies first so an unservable shard fails before any call.
        let mut assignments = Vec::with_capacity(shards.len());
        for shard in &shards {
            match self.candidate_copies(plan, snapshot, *shard).into_iter().next() {
                Some(node) => assignments.push((*shard, node)),
                None => {
                    tracing::warn!(index = %plan.index, shard_id = shard.0, "no searchable copy");
                    results.insert(
                        *shard,
                        ShardResult::failed(
                            plan.index.clone(),
                            *shard,
                            None,
                            Duration::ZERO,
                            ShardError::NoActiveCopy,
                        ),
                    );
                }
            }
        }
        if !plan.allow_partial && !results.is_empty() {
            return Err(shard_unavailable(shards_targeted, results.values()));
        }

        let body = plan.shard_body();
        let deadline = tokio::time::Instant::now() + plan.timeout;
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
        for (shard, node) in assignments {
            let searcher = Arc::clone(&self.searcher);
            let semaphore = Arc::clone(&semaphore);
            let mut request = ShardSearchRequest {
                index: plan.index.clone(),
                shard_id: shard,
                node: node.clone(),
                body: body.clone(),
                preference: plan.preference,
                routing: plan.routing.clone(),
                timeout: plan.timeout,
            };
            tasks.spawn(async move {
                // The semaphore is never closed, so acquire cannot fail.
                let _permit = semaphore.acquire_owned().await.ok();
                // time spent queued on the semaphore comes out of the shard's budget
                request.timeout = deadline.saturating_duration_since(tokio::time::Instant::now());
                let call_started = Instant::now();
                let response = searcher.search_shard(request).await;
                (shard, node, call_started.elapsed(), response)
            });
        }

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(None) => break,
                Ok(Some(Ok((shard, node, latency, response)))) => {
                    shardwise_observability::record_shard_call(
                        &plan.index,
                        latency.as_micros() as u64,
                        response.is_ok(),
                    );
                    let result = match response {
                        Ok(resp) => ShardResult {
                            index: plan.index.clone(),
                            shard_id: shard,
                            node: Some(node),
                            hits: resp.hits,
                            total_hits: resp.total_hits,
                            latency,
                            term_stats: resp.term_stats,
                            buckets: resp.buckets,
                            error: None,
                        },
                        Err(error) => {
                            tracing::warn!(
                                index = %plan.index,
                                shard_id = shard.0,
                                node = %node,
                                error = %error,
                                "shard search failed"
                            );
                            let failed = ShardResult::failed(
                                plan.index.clone(),
                                shard,
                                Some(node),
                                latency,
                                error,
                            );
                            if !plan.allow_partial {
                                tasks.abort_all();
                                return Err(shard_unavailable(shards_targeted, [&failed]));
                            }
                            failed
                        }
                    };
                    results.insert(shard, result);
                }
                Ok(Some(Err(join_error))) => {
                    tasks.abort_all();
                    return Err(ShardwiseError::internal_bug(
                        "E-COORD-002",
                        format!("shard task panicked during scatter: {}", join_error),
                    ));
                }
                Err(_elapsed) => {
                    tasks.abort_all();
                    let pending: Vec<ShardId> = shards
                        .iter()
                        .filter(|s| !results.contains_key(s))
                        .copied()
                        .collect();
                    let timeout_ms = plan.timeout.as_millis() as u64;
                    tracing::warn!(
                        index = %plan.index,
                        timeout_ms,
                        pending = ?pending,
                        allow_partial = plan.allow_partial,
                        "scatter deadline expired"
                    );
                    if !plan.allow_partial {
                        return Err(ShardwiseError::Timeout {
                            timeout_ms,
                            shards_targeted,
                            completed: results.len(),
                            pending,
                        });
                    }
                    for shard in pending {
                        results.insert(
                            shard,
                            ShardResult::failed(
                                plan.index.clone(),
                                shard,
                                None,
                                plan.timeout,
                                ShardError::Timeout(timeout_ms),
                            ),
                        );
                    }
                    break;
                }
            }
        }

        if results.values().all(|r| !r.is_ok()) {
            return Err(shard_unavailable(shards_targeted, results.values()));
        }

        let results: Vec<ShardResult> = results.into_values().collect();
        let per_shard_latency: Vec<(ShardId, Duration)> = results
            .iter()
            .filter(|r| r.is_ok())
            .map(|r| (r.shard_id, r.latency))
            .collect();
        let metrics = ScatterMetrics {
            shards_targeted,
            shards_participated: per_shard_latency.len(),
            shards_failed: results.len() - per_shard_latency.len(),
            max_shard_latency: per_shard_latency
                .iter()
                .map(|(_, l)| *l)
                .max()
                .unwrap_or_default(),
            per_shard_latency,
            total_latency: started.elapsed(),
        };
        tracing::debug!(
            index = %plan.index,
            shards = shards_targeted,
            failed = metrics.shards_failed,
            max_shard_latency_us = metrics.max_shard_latency.as_micros() as u64,
            "scatter complete"
        );
        Ok(ScatterOutcome { results, metrics })
    }
}

fn shard_unavailable<'a>(
    shards_targeted: usize,
    failed: impl IntoIterator<Item = &'a ShardResult>,
) -> ShardwiseError {
    ShardwiseError::ShardUnavailable {
        shards_targeted,
        failed: failed
            .into_iter()
            .filter_map(|r| {
                r.error.clone().map(|error| ShardFailure {
                    shard_id: r.shard_id,
                    node: r.node.clone(),
                    error,
                })
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardwise_common::search::{SearchOptions, SearchQuery};
    use shardwise_common::types::{ShardRole, ShardState};
    use shardwise_planner::analyzer::QueryAnalyzer;
    use shardwise_planner::hints::NoHints;
    use shardwise_planner::planner::StrategyPlanner;
    use serde_json::{json, Value};

    use crate::simulated::SimulatedCluster;
    use crate::transport::TopologySource;

    async fn setup(
        cluster: &Arc<SimulatedCluster>,
        config: &EngineConfig,
        body: Value,
        options: SearchOptions,
    ) -> (QueryPlan, ClusterSnapshot, ExecutionCoordinator) {
        let snapshot = cluster.get_shard_topology(None).await.unwrap();
        let query = SearchQuery::new("logs", body);
        let classification = QueryAnalyzer::new(&config.planner).analyze(&query).unwrap();
        let plan = StrategyPlanner::new(config)
            .plan(&query, &classification, &snapshot, &options, &NoHints)
            .unwrap();
        let coordinator = ExecutionCoordinator::new(cluster.clone(), config);
        (plan, snapshot, coordinator)
    }

    #[tokio::test]
    async fn test_full_fanout_requests_widened_window() {
        let cluster = Arc::new(SimulatedCluster::uniform("logs", 3, 1, 150));
        let config = EngineConfig::default();
        let (plan, snap, coord) = setup(&cluster, &config, json!({"size": 10}), SearchOptions::default()).await;
        let out = coord.execute(&plan, &snap).await.unwrap();
        assert_eq!(out.results.len(), 3);
        for r in &out.results {
            assert!(r.is_ok());
            assert_eq!(r.hits.len(), 100);
            assert_eq!(r.total_hits, 150);
        }
        assert_eq!(out.metrics.shards_participated, 3);
        assert_eq!(cluster.faults().total_shard_calls(), 3);
    }

    #[tokio::test]
    async fn test_strict_fails_on_first_error_without_retry() {
        let cluster = Arc::new(SimulatedCluster::uniform("logs", 3, 1, 20));
        cluster.faults().fail_shard(ShardId(1), ShardError::Transport("reset".into()));
        let config = EngineConfig::default();
        let (plan, snap, coord) = setup(&cluster, &config, json!({}), SearchOptions::default()).await;
        let err = coord.execute(&plan, &snap).await.unwrap_err();
        assert_eq!(err.failed_shards(), vec![ShardId(1)]);
        assert_eq!(cluster.faults().shard_calls(ShardId(1)), 1);
    }

    #[tokio::test]
    async fn test_partial_records_error_result() {
        let cluster = Arc::new(SimulatedCluster::uniform("logs", 3, 1, 20));
        cluster.faults().fail_shard(ShardId(0), ShardError::Rejected("busy".into()));
        let config = EngineConfig::default();
        let opts = SearchOptions::default().allow_partial(true);
        let (plan, snap, coord) = setup(&cluster, &config, json!({}), opts).await;
        let out = coord.execute(&plan, &snap).await.unwrap();
        assert_eq!(out.failed_shards(), vec![ShardId(0)]);
        assert_eq!(out.metrics.shards_failed, 1);
        assert_eq!(out.metrics.shards_participated, 2);
    }

    #[tokio::test]
    async fn test_timeout_strict_and_partial() {
        let cluster = Arc::new(SimulatedCluster::uniform("logs", 3, 0, 20));
        cluster.faults().delay_shard(ShardId(2), Duration::from_millis(500));
        let config = EngineConfig::default();

        let opts = SearchOptions::default().max_latency(Duration::from_millis(100));
        let (plan, snap, coord) = setup(&cluster, &config, json!({}), opts.clone()).await;
        let err = coord.execute(&plan, &snap).await.unwrap_err();
        match err {
            ShardwiseError::Timeout { pending, completed, .. } => {
                assert_eq!(pending, vec![ShardId(2)]);
                assert_eq!(completed, 2);
            }
            other => panic!("expected timeout, got {:?}", other),
        }

        let (plan, snap, coord) = setup(&cluster, &config, json!({}), opts.allow_partial(true)).await;
        let out = coord.execute(&plan, &snap).await.unwrap();
        let slow = &out.results[2];
        assert_eq!(slow.error, Some(ShardError::Timeout(100)));
        assert!(out.metrics.total_latency < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_all_failed_is_unavailable_even_when_partial() {
        let cluster = Arc::new(SimulatedCluster::uniform("logs", 2, 0, 5));
        for s in 0..2 {
            cluster.faults().fail_shard(ShardId(s), ShardError::Transport("down".into()));
        }
        let config = EngineConfig::default();
        let opts = SearchOptions::default().allow_partial(true);
        let (plan, snap, coord) = setup(&cluster, &config, json!({}), opts).await;
        let err = coord.execute(&plan, &snap).await.unwrap_err();
        assert!(matches!(err, ShardwiseError::ShardUnavailable { shards_targeted: 2, .. }));
    }

    #[tokio::test]
    async fn test_unservable_shard_fails_before_any_call() {
        let cluster = Arc::new(SimulatedCluster::uniform("logs", 3, 0, 5));
        cluster.set_copy_state("logs", ShardId(1), ShardRole::Primary, ShardState::Unassigned);
        let config = EngineConfig::default();
        let (mut plan, snap, coord) = setup(&cluster, &config, json!({}), SearchOptions::default()).await;
        assert!(plan.safety_override);
        // strict policy forced by hand to exercise the pre-call check
        plan.allow_partial = false;
        let err = coord.execute(&plan, &snap).await.unwrap_err();
        assert_eq!(err.failed_shards(), vec![ShardId(1)]);
        assert_eq!(cluster.faults().total_shard_calls(), 0);

        plan.allow_partial = true;
        let out = coord.execute(&plan, &snap).await.unwrap();
        assert_eq!(out.results[1].error, Some(ShardError::NoActiveCopy));
        assert_eq!(cluster.faults().total_shard_calls(), 2);
    }

    #[tokio::test]
    async fn test_copy_order_by_preference() {
        let cluster = Arc::new(SimulatedCluster::uniform("logs", 3, 2, 5));
        let mut config = EngineConfig::default();
        config.planner.local_node = Some("n2".into());
        let (mut plan, snap, coord) = setup(&cluster, &config, json!({}), SearchOptions::default()).await;
        // shard 0: primary n0, replicas n1, n2
        assert_eq!(plan.preference, Preference::LocalPreferred);
        let order = coord.candidate_copies(&plan, &snap, ShardId(0));
        assert_eq!(order[0], NodeId::new("n2"));

        plan.preference = Preference::PrimaryOnly;
        assert_eq!(coord.candidate_copies(&plan, &snap, ShardId(0)), vec![NodeId::new("n0")]);

        plan.preference = Preference::PrimaryFirst;
        assert_eq!(coord.candidate_copies(&plan, &snap, ShardId(0))[0], NodeId::new("n0"));

        plan.preference = Preference::Any;
        assert_eq!(
            coord.candidate_copies(&plan, &snap, ShardId(0)),
            vec![NodeId::new("n1"), NodeId::new("n2"), NodeId::new("n0")]
        );

        plan.avoid_nodes.insert(NodeId::new("n1"));
        assert_eq!(
            coord.candidate_copies(&plan, &snap, ShardId(0)),
            vec![NodeId::new("n2"), NodeId::new("n0"), NodeId::new("n1")]
        );
    }

    /// Records the timeout each sub-request was sent with.
    struct TimeoutRecorder {
        inner: Arc<SimulatedCluster>,
        seen: parking_lot::Mutex<Vec<(ShardId, Duration)>>,
    }

    #[async_trait::async_trait]
    impl ShardSearcher for TimeoutRecorder {
        async fn search_shard(
            &self,
            request: ShardSearchRequest,
        ) -> Result<crate::transport::ShardSearchResponse, ShardError> {
            self.seen.lock().push((request.shard_id, request.timeout));
            self.inner.search_shard(request).await
        }
    }

    #[tokio::test]
    async fn test_queued_requests_carry_remaining_time() {
        let cluster = Arc::new(SimulatedCluster::uniform("logs", 3, 0, 5));
        for s in 0..3 {
            cluster.faults().delay_shard(ShardId(s), Duration::from_millis(50));
        }
        let mut config = EngineConfig::default();
        config.execution.max_parallel_shards = 1;
        let opts = SearchOptions::default().max_latency(Duration::from_millis(1_000));
        let (plan, snap, _) = setup(&cluster, &config, json!({}), opts).await;
        let recorder = Arc::new(TimeoutRecorder {
            inner: cluster.clone(),
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        let coord = ExecutionCoordinator::new(recorder.clone(), &config);
        coord.execute(&plan, &snap).await.unwrap();

        let mut timeouts: Vec<Duration> = recorder.seen.lock().iter().map(|(_, t)| *t).collect();
        assert_eq!(timeouts.len(), 3);
        assert!(timeouts.iter().all(|t| *t <= plan.timeout));
        timeouts.sort();
        // the last request queued behind two 50ms calls
        assert!(
            timeouts[0] <= plan.timeout - Duration::from_millis(90),
            "{:?}",
            timeouts
        );
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let cluster = Arc::new(SimulatedCluster::uniform("logs", 4, 0, 5));
        for s in 0..4 {
            cluster.faults().delay_shard(ShardId(s), Duration::from_millis(60));
        }
        let mut config = EngineConfig::default();
        config.execution.max_parallel_shards = 1;
        let (plan, snap, coord) = setup(&cluster, &config, json!({}), SearchOptions::default()).await;
        let out = coord.execute(&plan, &snap).await.unwrap();
        assert!(out.metrics.total_latency >= Duration::from_millis(240));
    }
}
