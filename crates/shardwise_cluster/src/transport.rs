//! Downstream interfaces: the topology source and the per-shard search
//! primitive. Both are async so implementations can do real network I/O.

use std::time::Duration;

use serde_json::Value;

use shardwise_common::error::{ShardError, TopologyError};
use shardwise_common::search::{Hit, TermBucket, TermStats};
use shardwise_common::topology::ClusterSnapshot;
use shardwise_common::types::{ClusterHealth, NodeId, ShardId};
use shardwise_planner::plan::Preference;

/// Where shard placement and cluster health come from.
#[async_trait::async_trait]
pub trait TopologySource: Send + Sync {
    /// Placement of every copy of `index`, or of all indices for `None`.
    async fn get_shard_topology(&self, index: Option<&str>)
        -> Result<ClusterSnapshot, TopologyError>;

    async fn get_cluster_health(&self) -> Result<ClusterHealth, TopologyError>;
}

/// One sub-request addressed to a single copy of a single shard.
#[derive(Debug, Clone)]
pub struct ShardSearchRequest {
    pub index: String,
    pub shard_id: ShardId,
    /// Copy selected by the coordinator.
    pub node: NodeId,
    pub body: Value,
    pub preference: Preference,
    pub routing: Option<String>,
    pub timeout: Duration,
}

/// What a shard copy returns on success.
#[derive(Debug, Clone, Default)]
pub struct ShardSearchResponse {
    /// Ordered by the shard's own ranking.
    pub hits: Vec<Hit>,
    pub total_hits: u64,
    pub term_stats: Option<TermStats>,
    pub buckets: Vec<TermBucket>,
}

/// The black-box per-shard search primitive.
#[async_trait::async_trait]
pub trait ShardSearcher: Send + Sync {
    async fn search_shard(
        &self,
        request: ShardSearchRequest,
    ) -> Result<ShardSearchResponse, ShardError>;
}
