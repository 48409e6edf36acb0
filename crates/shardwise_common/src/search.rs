//! Request and result model shared by the planner, coordinator and merger.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ShardError;
use crate::types::{NodeId, ShardId};

/// A search against one index, with an OpenSearch-style JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub index: String,
    pub body: serde_json::Value,
}

impl SearchQuery {
    pub fn new(index: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            index: index.into(),
            body,
        }
    }
}

/// How fresh the topology used for planning must be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologyFreshness {
    /// Use the cached snapshot while it is within its maximum age.
    #[default]
    Cached,
    /// Refresh before planning; fall back to the cache if that fails.
    Fresh,
}

/// Per-call overrides accepted by `submit`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOptions {
    pub allow_partial: Option<bool>,
    /// Upper bound on end-to-end latency; tightens the configured timeout.
    pub max_latency: Option<Duration>,
    pub freshness: TopologyFreshness,
}

impl SearchOptions {
    pub fn allow_partial(mut self, allow: bool) -> Self {
        self.allow_partial = Some(allow);
        self
    }

    pub fn max_latency(mut self, budget: Duration) -> Self {
        self.max_latency = Some(budget);
        self
    }

    pub fn fresh_topology(mut self) -> Self {
        self.freshness = TopologyFreshness::Fresh;
        self
    }
}

/// One matching document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub index: String,
    pub id: String,
    pub score: f64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Hit {
    pub fn new(index: impl Into<String>, id: impl Into<String>, score: f64) -> Self {
        Self {
            index: index.into(),
            id: id.into(),
            score,
            payload: serde_json::Value::Null,
        }
    }
}

/// Collection statistics a shard reports for the query terms, used to
/// rescale scores into a common basis across shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermStats {
    /// Documents in the shard.
    pub doc_count: u64,
    /// Documents in the shard containing the query terms.
    pub doc_freq: u64,
}

/// One bucket of a terms aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermBucket {
    pub key: String,
    pub doc_count: u64,
}

/// What a shard returned (or why it did not).
#[derive(Debug, Clone)]
pub struct ShardResult {
    pub index: String,
    pub shard_id: ShardId,
    /// Copy that served (or was asked to serve) the request.
    pub node: Option<NodeId>,
    /// Ordered by the shard's own ranking.
    pub hits: Vec<Hit>,
    pub total_hits: u64,
    pub latency: Duration,
    pub term_stats: Option<TermStats>,
    pub buckets: Vec<TermBucket>,
    pub error: Option<ShardError>,
}

impl ShardResult {
    /// A failed sub-request: no hits, no totals.
    pub fn failed(
        index: impl Into<String>,
        shard_id: ShardId,
        node: Option<NodeId>,
        latency: Duration,
        error: ShardError,
    ) -> Self {
        Self {
            index: index.into(),
            shard_id,
            node,
            hits: Vec::new(),
            total_hits: 0,
            latency,
            term_stats: None,
            buckets: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Whether `total_hits.value` is exact or a lower bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TotalHitsRelation {
    #[serde(rename = "eq")]
    Exact,
    #[serde(rename = "gte")]
    LowerBound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalHits {
    pub value: u64,
    pub relation: TotalHitsRelation,
}

impl TotalHits {
    pub fn is_exact(&self) -> bool {
        self.relation == TotalHitsRelation::Exact
    }
}

/// Non-fatal degradation attached to a merged result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MergeWarning {
    /// Some targeted shards did not contribute.
    PartialResult {
        shards_queried: usize,
        shards_failed: usize,
        failed_shards: Vec<ShardId>,
    },
    /// Scores from different shards were merged without a common basis.
    ScoresNotNormalized,
    /// The same document came back from more than one shard.
    DuplicateHitsRemoved { count: usize },
    /// The plan was forced to primaries with partial results allowed
    /// because the topology was degraded.
    SafetyOverride,
}

impl fmt::Display for MergeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeWarning::PartialResult {
                shards_queried,
                shards_failed,
                ..
            } => write!(
                f,
                "partial result: {} of {} shards failed",
                shards_failed, shards_queried
            ),
            MergeWarning::ScoresNotNormalized => {
                write!(f, "scores merged without cross-shard normalization")
            }
            MergeWarning::DuplicateHitsRemoved { count } => {
                write!(f, "{} duplicate hits removed", count)
            }
            MergeWarning::SafetyOverride => {
                write!(f, "degraded topology: primaries only, partial results allowed")
            }
        }
    }
}

/// The single response assembled from all shard results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedResult {
    pub hits: Vec<Hit>,
    pub total_hits: TotalHits,
    pub buckets: Vec<TermBucket>,
    pub shards_queried: usize,
    pub shards_failed: usize,
    pub failed_shards: Vec<ShardId>,
    pub warnings: Vec<MergeWarning>,
    pub took: Duration,
}

impl MergedResult {
    pub fn is_partial(&self) -> bool {
        self.shards_failed > 0
    }

    pub fn has_warning(&self, pred: impl Fn(&MergeWarning) -> bool) -> bool {
        self.warnings.iter().any(pred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builders() {
        let opts = SearchOptions::default()
            .allow_partial(true)
            .max_latency(Duration::from_millis(250))
            .fresh_topology();
        assert_eq!(opts.allow_partial, Some(true));
        assert_eq!(opts.max_latency, Some(Duration::from_millis(250)));
        assert_eq!(opts.freshness, TopologyFreshness::Fresh);
    }

    #[test]
    fn test_warning_serializes_with_tag() {
        let w = MergeWarning::PartialResult {
            shards_queried: 3,
            shards_failed: 1,
            failed_shards: vec![ShardId(2)],
        };
        let json = serde_json::to_value(&w).unwrap();
        assert_eq!(json["type"], "partial_result");
        assert_eq!(json["shards_failed"], 1);
        assert_eq!(w.to_string(), "partial result: 1 of 3 shards failed");
    }

    #[test]
    fn test_total_hits_relation_serde() {
        let t = TotalHits {
            value: 7,
            relation: TotalHitsRelation::LowerBound,
        };
        let json = serde_json::to_value(t).unwrap();
        assert_eq!(json["relation"], "gte");
        assert!(!t.is_exact());
    }
}
