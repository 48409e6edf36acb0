//! In-memory cluster implementing both downstream traits.
//!
//! Each shard holds a deterministic set of synthetic documents. Tenants are
//! placed on the shard their routing key hashes to, and shard `s` holds
//! timestamps in `[s * SHARD_TIME_SPAN_MS, (s + 1) * SHARD_TIME_SPAN_MS)`, so
//! routed and time-narrowed plans return exactly what a full fan-out would.
//! The bench harness and the integration tests both run against it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::json;

use shardwise_common::config::PlannerConfig;
use shardwise_common::error::{ShardError, TopologyError};
use shardwise_common::search::{Hit, SearchQuery, TermBucket, TermStats};
use shardwise_common::topology::{ClusterSnapshot, ShardDescriptor};
use shardwise_common::types::{ClusterHealth, NodeId, ShardId, ShardRole, ShardState};
use shardwise_planner::analyzer::QueryAnalyzer;
use shardwise_planner::routing::route_shard;
use shardwise_planner::time_mapping::RangeTableMapping;

use crate::fault_injection::FaultInjector;
use crate::transport::{ShardSearchRequest, ShardSearchResponse, ShardSearcher, TopologySource};

/// Width of the time span each simulated shard covers.
pub const SHARD_TIME_SPAN_MS: i64 = 1_000;
/// Distinct tenants generated per index.
pub const TENANTS: usize = 20;
const HOSTS: usize = 4;

#[derive(Debug, Clone)]
struct SimDoc {
    id: String,
    score: f64,
    tenant: Option<String>,
    timestamp_ms: i64,
    host: String,
}

pub struct SimulatedCluster {
    shards: RwLock<Vec<ShardDescriptor>>,
    reported_health: RwLock<ClusterHealth>,
    docs: RwLock<HashMap<(String, ShardId), Vec<SimDoc>>>,
    report_term_stats: AtomicBool,
    analyzer: QueryAnalyzer,
    faults: Arc<FaultInjector>,
}

impl Default for SimulatedCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCluster {
    pub fn new() -> Self {
        Self {
            shards: RwLock::new(Vec::new()),
            reported_health: RwLock::new(ClusterHealth::Green),
            docs: RwLock::new(HashMap::new()),
            report_term_stats: AtomicBool::new(true),
            analyzer: QueryAnalyzer::new(&PlannerConfig::default()),
            faults: Arc::new(FaultInjector::new()),
        }
    }

    /// One index with `shards` primaries and `replicas` replicas each.
    pub fn uniform(index: &str, shards: u32, replicas: u32, docs_per_shard: usize) -> Self {
        let cluster = Self::new();
        cluster.add_index(index, shards, replicas, docs_per_shard);
        cluster
    }

    /// Add an index. Copies of a shard always land on distinct nodes
    /// `n0..nK` where `K = max(shards, replicas + 1)`.
    pub fn add_index(&self, index: &str, shards: u32, replicas: u32, docs_per_shard: usize) {
        let nodes = shards.max(replicas + 1).max(1);
        let tenants_by_shard = tenants_by_shard(shards);
        let mut descriptors = Vec::new();
        let mut docs = self.docs.write();
        for s in 0..shards {
            descriptors.push(ShardDescriptor::started(
                index,
                s,
                ShardRole::Primary,
                format!("n{}", s % nodes),
            ));
            for r in 0..replicas {
                descriptors.push(ShardDescriptor::started(
                    index,
                    s,
                    ShardRole::Replica,
                    format!("n{}", (s + r + 1) % nodes),
                ));
            }
            let tenants = tenants_by_shard.get(&s).map(Vec::as_slice).unwrap_or(&[]);
            docs.insert(
                (index.to_string(), ShardId(s)),
                generate_docs(index, s, docs_per_shard, tenants),
            );
        }
        self.shards.write().extend(descriptors);
    }

    pub fn faults(&self) -> &Arc<FaultInjector> {
        &self.faults
    }

    /// Health the source reports, before reconciliation with shard states.
    pub fn set_reported_health(&self, health: ClusterHealth) {
        *self.reported_health.write() = health;
    }

    /// Change the state of one copy. Unassigning a copy removes its node.
    pub fn set_copy_state(&self, index: &str, shard: ShardId, role: ShardRole, state: ShardState) {
        for d in self.shards.write().iter_mut() {
            if d.index == index && d.shard == shard && d.role == role {
                *d = d.clone().with_state(state);
            }
        }
    }

    /// Report one more copy as-is. Placement is not checked, so this can
    /// produce a topology the cache refuses.
    pub fn add_copy(&self, copy: ShardDescriptor) {
        self.shards.write().push(copy);
    }

    /// Whether shards report term statistics for score normalization.
    pub fn set_report_term_stats(&self, enabled: bool) {
        self.report_term_stats.store(enabled, Ordering::Relaxed);
    }

    /// Mapping that matches where documents were placed by timestamp.
    pub fn time_mapping(&self) -> RangeTableMapping {
        let mut mapping = RangeTableMapping::new();
        for d in self.shards.read().iter().filter(|d| d.is_primary()) {
            let start = i64::from(d.shard.0) * SHARD_TIME_SPAN_MS;
            mapping.insert(d.index.clone(), d.shard.0, start, start + SHARD_TIME_SPAN_MS - 1);
        }
        mapping
    }

    /// Ids of every document matching a tenant, across all shards.
    pub fn tenant_doc_count(&self, index: &str, tenant: &str) -> usize {
        self.docs
            .read()
            .iter()
            .filter(|((i, _), _)| i == index)
            .flat_map(|(_, docs)| docs.iter())
            .filter(|d| d.tenant.as_deref() == Some(tenant))
            .count()
    }

    fn hosts_copy(&self, index: &str, shard: ShardId, node: &NodeId) -> bool {
        self.shards.read().iter().any(|d| {
            d.index == index && d.shard == shard && d.node.as_ref() == Some(node) && d.is_searchable()
        })
    }
}

/// Tenant names grouped by the shard they route to.
fn tenants_by_shard(shards: u32) -> BTreeMap<u32, Vec<String>> {
    let mut map: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    for k in 0..TENANTS {
        let tenant = format!("tenant-{}", k);
        if let Some(shard) = route_shard(&tenant, shards) {
            map.entry(shard.0).or_default().push(tenant);
        }
    }
    map
}

fn generate_docs(index: &str, shard: u32, count: usize, tenants: &[String]) -> Vec<SimDoc> {
    (0..count)
        .map(|i| {
            let spread = (u64::from(shard) * 7_919 + i as u64 * 104_729) % 1_000;
            SimDoc {
                id: format!("{}-{}-{}", index, shard, i),
                score: 1.0 + spread as f64 / 100.0,
                tenant: if tenants.is_empty() {
                    None
                } else {
                    Some(tenants[i % tenants.len()].clone())
                },
                timestamp_ms: i64::from(shard) * SHARD_TIME_SPAN_MS
                    + (i as i64 % SHARD_TIME_SPAN_MS),
                host: format!("host-{}", i % HOSTS),
            }
        })
        .collect()
}

#[async_trait::async_trait]
impl TopologySource for SimulatedCluster {
    async fn get_shard_topology(
        &self,
        index: Option<&str>,
    ) -> Result<ClusterSnapshot, TopologyError> {
        let (delay, down) = self.faults.on_topology_call();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if down {
            return Err(TopologyError::Unavailable("simulated outage".into()));
        }
        let shards: Vec<ShardDescriptor> = self
            .shards
            .read()
            .iter()
            .filter(|d| index.map_or(true, |i| d.index == i))
            .cloned()
            .collect();
        if let Some(i) = index {
            if shards.is_empty() {
                return Err(TopologyError::IndexNotFound(i.to_string()));
            }
        }
        Ok(ClusterSnapshot::new(shards, ClusterHealth::Green))
    }

    async fn get_cluster_health(&self) -> Result<ClusterHealth, TopologyError> {
        if self.faults.topology_outage_active() {
            return Err(TopologyError::Unavailable("simulated outage".into()));
        }
        Ok(*self.reported_health.read())
    }
}

#[async_trait::async_trait]
impl ShardSearcher for SimulatedCluster {
    async fn search_shard(
        &self,
        request: ShardSearchRequest,
    ) -> Result<ShardSearchResponse, ShardError> {
        let (delay, failure) = self.faults.on_shard_call(request.shard_id, &request.node);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = failure {
            return Err(error);
        }
        if !self.hosts_copy(&request.index, request.shard_id, &request.node) {
            return Err(ShardError::Rejected(format!(
                "{} holds no searchable copy of {}",
                request.node, request.shard_id
            )));
        }

        let query = SearchQuery::new(request.index.clone(), request.body.clone());
        let classification = self
            .analyzer
            .analyze(&query)
            .map_err(|e| ShardError::Rejected(e.to_string()))?;

        let docs = self.docs.read();
        let all = docs
            .get(&(request.index.clone(), request.shard_id))
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let mut matching: Vec<&SimDoc> = all
            .iter()
            .filter(|d| match &classification.tenant {
                Some(t) => d.tenant.as_deref() == Some(t.value.as_str()),
                None => true,
            })
            .filter(|d| match &classification.time_range {
                Some(r) => r.from_ms <= d.timestamp_ms && d.timestamp_ms <= r.to_ms,
                None => true,
            })
            .collect();
        matching.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));

        let buckets = match &classification.terms_agg {
            Some(agg) => {
                let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
                for d in &matching {
                    *counts.entry(d.host.as_str()).or_insert(0) += 1;
                }
                let mut buckets: Vec<TermBucket> = counts
                    .into_iter()
                    .map(|(key, doc_count)| TermBucket {
                        key: key.to_string(),
                        doc_count,
                    })
                    .collect();
                buckets.sort_by(|a, b| b.doc_count.cmp(&a.doc_count).then_with(|| a.key.cmp(&b.key)));
                buckets.truncate(agg.size);
                buckets
            }
            None => Vec::new(),
        };

        let term_stats = self.report_term_stats.load(Ordering::Relaxed).then(|| TermStats {
            doc_count: all.len() as u64,
            doc_freq: matching.len() as u64,
        });

        let hits = matching
            .iter()
            .skip(classification.from)
            .take(classification.size)
            .map(|d| Hit {
                index: request.index.clone(),
                id: d.id.clone(),
                score: d.score,
                payload: json!({
                    "tenant_id": d.tenant,
                    "@timestamp": d.timestamp_ms,
                    "host": d.host,
                }),
            })
            .collect();

        Ok(ShardSearchResponse {
            hits,
            total_hits: matching.len() as u64,
            term_stats,
            buckets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardwise_planner::plan::Preference;
    use std::time::Duration;

    fn request(cluster: &SimulatedCluster, shard: u32, body: serde_json::Value) -> ShardSearchRequest {
        let snap_node = cluster
            .shards
            .read()
            .iter()
            .find(|d| d.shard == ShardId(shard) && d.is_primary())
            .and_then(|d| d.node.clone())
            .unwrap();
        ShardSearchRequest {
            index: "logs".into(),
            shard_id: ShardId(shard),
            node: snap_node,
            body,
            preference: Preference::Any,
            routing: None,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_layout_puts_copies_on_distinct_nodes() {
        let c = SimulatedCluster::uniform("logs", 3, 2, 5);
        let shards = c.shards.read();
        assert_eq!(shards.len(), 9);
        for s in 0..3 {
            let nodes: std::collections::BTreeSet<_> = shards
                .iter()
                .filter(|d| d.shard == ShardId(s))
                .map(|d| d.node.clone())
                .collect();
            assert_eq!(nodes.len(), 3);
        }
    }

    #[test]
    fn test_tenants_live_on_routed_shard() {
        let c = SimulatedCluster::uniform("logs", 4, 0, 40);
        for (key, docs) in c.docs.read().iter() {
            for d in docs {
                if let Some(t) = &d.tenant {
                    assert_eq!(route_shard(t, 4), Some(key.1));
                }
            }
        }
    }

    #[tokio::test]
    async fn test_search_honours_size_and_totals() {
        let c = SimulatedCluster::uniform("logs", 2, 0, 30);
        let resp = c
            .search_shard(request(&c, 1, json!({"size": 5})))
            .await
            .unwrap();
        assert_eq!(resp.hits.len(), 5);
        assert_eq!(resp.total_hits, 30);
        assert!(resp.hits.windows(2).all(|w| w[0].score >= w[1].score));
        assert_eq!(resp.term_stats.unwrap().doc_count, 30);
    }

    #[tokio::test]
    async fn test_search_filters_time_range() {
        let c = SimulatedCluster::uniform("logs", 2, 0, 30);
        let body = json!({"size": 100, "query": {"range": {"@timestamp": {"gte": 1_000, "lte": 1_009}}}});
        let resp = c.search_shard(request(&c, 1, body)).await.unwrap();
        assert_eq!(resp.total_hits, 10);
    }

    #[tokio::test]
    async fn test_terms_buckets() {
        let c = SimulatedCluster::uniform("logs", 1, 0, 10);
        let body = json!({"size": 0, "aggs": {"hosts": {"terms": {"field": "host", "size": 2}}}});
        let resp = c.search_shard(request(&c, 0, body)).await.unwrap();
        assert!(resp.hits.is_empty());
        assert_eq!(
            resp.buckets,
            vec![
                TermBucket { key: "host-0".into(), doc_count: 3 },
                TermBucket { key: "host-1".into(), doc_count: 3 },
            ]
        );
    }

    #[tokio::test]
    async fn test_wrong_node_is_rejected() {
        let c = SimulatedCluster::uniform("logs", 2, 0, 3);
        let mut req = request(&c, 0, json!({}));
        req.node = NodeId::new("nowhere");
        assert!(matches!(c.search_shard(req).await, Err(ShardError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_topology_filters_by_index() {
        let c = SimulatedCluster::uniform("logs", 2, 1, 3);
        c.add_index("metrics", 1, 0, 3);
        let all = c.get_shard_topology(None).await.unwrap();
        assert_eq!(all.indices().len(), 2);
        let logs = c.get_shard_topology(Some("logs")).await.unwrap();
        assert_eq!(logs.shards().len(), 4);
        assert!(matches!(
            c.get_shard_topology(Some("nope")).await,
            Err(TopologyError::IndexNotFound(_))
        ));
    }
}
