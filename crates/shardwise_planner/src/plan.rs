use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use shardwise_common::types::{NodeId, ShardId};

use crate::analyzer::TermsAggRequest;

/// Which copy of each shard should serve the sub-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Preference {
    /// Any searchable copy.
    Any,
    /// The primary only; a shard without a searchable primary fails.
    PrimaryOnly,
    /// The primary, falling back to replicas.
    PrimaryFirst,
    /// The copy on the local node, falling back to any copy.
    LocalPreferred,
}

impl fmt::Display for Preference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Preference::Any => write!(f, "ANY"),
            Preference::PrimaryOnly => write!(f, "PRIMARY_ONLY"),
            Preference::PrimaryFirst => write!(f, "PRIMARY_FIRST"),
            Preference::LocalPreferred => write!(f, "LOCAL_PREFERRED"),
        }
    }
}

/// Coarse shape of a plan's target shard set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardSetShape {
    /// Empty target set: every shard of the index.
    Full,
    Single,
    Subset,
}

impl ShardSetShape {
    pub fn of(targets: &BTreeSet<ShardId>) -> Self {
        match targets.len() {
            0 => ShardSetShape::Full,
            1 => ShardSetShape::Single,
            _ => ShardSetShape::Subset,
        }
    }
}

/// Plan signature that outcomes are aggregated under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatternKey {
    pub routed: bool,
    pub shape: ShardSetShape,
    pub preference: Preference,
}

impl fmt::Display for PatternKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = match self.shape {
            ShardSetShape::Full => "full",
            ShardSetShape::Single => "single",
            ShardSetShape::Subset => "subset",
        };
        write!(
            f,
            "{}/{}/{}",
            if self.routed { "routed" } else { "unrouted" },
            shape,
            self.preference
        )
    }
}

/// Concrete execution plan for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub index: String,
    /// Forwarded with every shard call when set.
    pub routing: Option<String>,
    pub preference: Preference,
    pub shard_size_multiplier: u32,
    /// Hits each shard is asked for.
    pub shard_hit_window: usize,
    /// Buckets each shard is asked for, when the query has a terms aggregation.
    pub agg_shard_size: Option<usize>,
    pub timeout: Duration,
    pub allow_partial: bool,
    /// Empty means every shard of the index.
    pub target_shards: BTreeSet<ShardId>,
    /// Nodes whose copies are tried last.
    pub avoid_nodes: BTreeSet<NodeId>,
    /// Degraded topology forced `PRIMARY_ONLY` and partial results.
    pub safety_override: bool,
    pub pattern: PatternKey,
    /// Requested offset and size of the merged response.
    pub from: usize,
    pub size: usize,
    pub terms_agg: Option<TermsAggRequest>,
    /// Body as submitted.
    pub body: Value,
}

impl QueryPlan {
    pub fn is_full_fanout(&self) -> bool {
        self.target_shards.is_empty()
    }

    /// Body sent to each shard: offset folded into the window and the terms
    /// aggregation widened to the shard size.
    pub fn shard_body(&self) -> Value {
        let mut body = self.body.clone();
        let Some(obj) = body.as_object_mut() else {
            return body;
        };
        obj.insert("from".into(), Value::from(0u64));
        obj.insert("size".into(), Value::from(self.shard_hit_window as u64));

        if let (Some(agg), Some(shard_size)) = (&self.terms_agg, self.agg_shard_size) {
            if let Some(terms) = locate_terms_mut(&mut body, &agg.path) {
                terms.insert("size".into(), Value::from(shard_size as u64));
            }
        }
        body
    }
}

fn locate_terms_mut<'a>(
    body: &'a mut Value,
    path: &[String],
) -> Option<&'a mut serde_json::Map<String, Value>> {
    let mut node = body;
    for name in path {
        let obj = node.as_object_mut()?;
        let key = if obj.contains_key("aggs") {
            "aggs"
        } else {
            "aggregations"
        };
        node = obj.get_mut(key)?.get_mut(name.as_str())?;
    }
    node.get_mut("terms")?.as_object_mut()
}
