//! Caller-supplied time → shard mapping for time-partitioned indices.

use std::collections::{BTreeSet, HashMap};

use shardwise_common::types::ShardId;

use crate::analyzer::TimeRange;

/// Resolves a time range to the shards that may hold matching documents.
pub trait TimeShardMapping: Send + Sync {
    /// `None` when the index is not time-partitioned under this mapping.
    fn shards_for_range(&self, index: &str, range: &TimeRange) -> Option<BTreeSet<ShardId>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ShardSpan {
    shard: ShardId,
    from_ms: i64,
    to_ms: i64,
}

/// Static table of inclusive `[from_ms, to_ms]` spans per shard.
#[derive(Debug, Clone, Default)]
pub struct RangeTableMapping {
    spans: HashMap<String, Vec<ShardSpan>>,
}

impl RangeTableMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `shard` of `index` holds documents in `[from_ms, to_ms]`.
    pub fn with_span(mut self, index: impl Into<String>, shard: u32, from_ms: i64, to_ms: i64) -> Self {
        self.insert(index, shard, from_ms, to_ms);
        self
    }

    pub fn insert(&mut self, index: impl Into<String>, shard: u32, from_ms: i64, to_ms: i64) {
        self.spans.entry(index.into()).or_default().push(ShardSpan {
            shard: ShardId(shard),
            from_ms,
            to_ms,
        });
    }
}

impl TimeShardMapping for RangeTableMapping {
    fn shards_for_range(&self, index: &str, range: &TimeRange) -> Option<BTreeSet<ShardId>> {
        let spans = self.spans.get(index)?;
        Some(
            spans
                .iter()
                .filter(|s| range.overlaps(s.from_ms, s.to_ms))
                .map(|s| s.shard)
                .collect(),
        )
    }
}
