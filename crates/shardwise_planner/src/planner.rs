//! Strategy planning: classification + snapshot + feedback → `QueryPlan`.
//!
//! Rules are applied in a fixed order:
//!
//! 1. tenant routing (routing key, `PRIMARY_FIRST`)
//! 2. time-range narrowing of the target set (unrouted plans only)
//! 3. global top-k widening of the per-shard window
//! 4. safety override on degraded topology (`PRIMARY_ONLY`, shorter timeout,
//!    partial results allowed)
//! 5. feedback advice (multiplier scale-down, node avoidance)
//!
//! Advice can only shrink the multiplier and reorder copies; it never undoes
//! rule 4. Planning is deterministic for a given snapshot, classification and
//! advice, and issues no network calls.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use shardwise_common::config::{EngineConfig, ExecutionConfig, PlannerConfig};
use shardwise_common::error::{ShardwiseError, ShardwiseResult};
use shardwise_common::search::{SearchOptions, SearchQuery};
use shardwise_common::topology::ClusterSnapshot;
use shardwise_common::types::ShardId;

use crate::analyzer::QueryClassification;
use crate::hints::PlanningHints;
use crate::plan::{PatternKey, Preference, QueryPlan, ShardSetShape};
use crate::routing::route_shard;
use crate::time_mapping::TimeShardMapping;

/// Per-shard hit window and aggregation size for a multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardWindows {
    pub hits: usize,
    pub agg: Option<usize>,
}

impl ShardWindows {
    /// Windows for `multiplier`; `topk = false` means no widening at all.
    pub fn compute(
        classification: &QueryClassification,
        multiplier: u32,
        topk: bool,
        ceiling: usize,
    ) -> Self {
        let window = classification.hit_window();
        let m = multiplier.max(1) as usize;
        if !topk {
            return Self {
                hits: window,
                agg: classification.agg_size(),
            };
        }
        Self {
            hits: window.max(window.saturating_mul(m).min(ceiling)),
            agg: classification
                .agg_size()
                .map(|b| b.saturating_mul(m).min(ceiling).max(b)),
        }
    }
}

pub struct StrategyPlanner {
    planner: PlannerConfig,
    execution: ExecutionConfig,
    time_mapping: Option<Arc<dyn TimeShardMapping>>,
}

impl StrategyPlanner {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            planner: config.planner.clone(),
            execution: config.execution.clone(),
            time_mapping: None,
        }
    }

    pub fn with_time_mapping(mut self, mapping: Arc<dyn TimeShardMapping>) -> Self {
        self.time_mapping = Some(mapping);
        self
    }

    fn default_preference(&self) -> Preference {
        if self.planner.local_node.is_some() {
            Preference::LocalPreferred
        } else {
            Preference::Any
        }
    }

    pub fn plan(
        &self,
        query: &SearchQuery,
        classification: &QueryClassification,
        snapshot: &ClusterSnapshot,
        options: &SearchOptions,
        hints: &dyn PlanningHints,
    ) -> ShardwiseResult<QueryPlan> {
        let index = query.index.as_str();
        if !snapshot.has_index(index) {
            return Err(ShardwiseError::planning(format!(
                "index '{}' is not present in the cluster topology",
                index
            )));
        }
        let all_shards = snapshot.shard_ids(index);

        // Rule 1: tenant routing.
        let mut routing = None;
        let mut preference = self.default_preference();
        let mut targets: BTreeSet<ShardId> = BTreeSet::new();
        if let Some(tenant) = &classification.tenant {
            let shard = route_shard(&tenant.value, snapshot.number_of_shards(index))
                .filter(|s| snapshot.is_assigned(index, *s))
                .ok_or_else(|| {
                    ShardwiseError::planning(format!(
                        "routing key {}={} maps to no assigned shard of '{}'",
                        tenant.field, tenant.value, index
                    ))
                })?;
            routing = Some(tenant.value.clone());
            preference = Preference::PrimaryFirst;
            targets.insert(shard);
        } else if let (Some(range), Some(mapping)) =
            (&classification.time_range, &self.time_mapping)
        {
            // Rule 2: time narrowing, kept only when it is a strict subset.
            if let Some(resolved) = mapping.shards_for_range(index, range) {
                let resolved: BTreeSet<ShardId> =
                    resolved.intersection(&all_shards).copied().collect();
                if !resolved.is_empty() && resolved.len() < all_shards.len() {
                    targets = resolved;
                }
            }
        }

        // Rule 3: global top-k.
        let topk = classification.needs_global_topk;
        let mut multiplier = if topk {
            self.planner.topk_multiplier.max(1)
        } else {
            1
        };
        let ceiling = self.planner.shard_size_ceiling;
        let mut windows = ShardWindows::compute(classification, multiplier, topk, ceiling);

        let mut timeout = self.execution.default_timeout();
        if let Some(budget) = options.max_latency {
            timeout = timeout.min(budget);
        }
        let mut allow_partial = options.allow_partial.unwrap_or(self.execution.allow_partial);

        // Rule 4: safety over locality.
        let effective = if targets.is_empty() {
            &all_shards
        } else {
            &targets
        };
        let unstable: Vec<ShardId> = effective
            .iter()
            .filter(|s| snapshot.is_unstable(index, **s))
            .copied()
            .collect();
        let safety_override = snapshot.health().is_degraded() || !unstable.is_empty();
        if safety_override {
            preference = Preference::PrimaryOnly;
            timeout = self.shortened_timeout(timeout);
            allow_partial = true;
            tracing::warn!(
                index = %index,
                health = %snapshot.health(),
                unstable_shards = ?unstable,
                timeout_ms = timeout.as_millis() as u64,
                "degraded topology: planning PRIMARY_ONLY with partial results"
            );
        }

        let pattern = PatternKey {
            routed: routing.is_some(),
            shape: ShardSetShape::of(&targets),
            preference,
        };

        // Rule 5: advisory feedback.
        let advice = hints.advise(&pattern);
        let scale = if advice.multiplier_scale.is_finite() {
            advice.multiplier_scale.clamp(f64::MIN_POSITIVE, 1.0)
        } else {
            1.0
        };
        if topk && scale < 1.0 {
            let scaled = ((multiplier as f64) * scale).floor().max(1.0) as u32;
            if scaled < multiplier {
                tracing::debug!(
                    pattern = %pattern,
                    from = multiplier,
                    to = scaled,
                    "feedback scaled down top-k multiplier"
                );
                multiplier = scaled;
                windows = ShardWindows::compute(classification, multiplier, topk, ceiling);
            }
        }
        let avoid_nodes = if safety_override {
            BTreeSet::new()
        } else {
            advice.avoid_nodes
        };

        let plan = QueryPlan {
            index: index.to_string(),
            routing,
            preference,
            shard_size_multiplier: multiplier,
            shard_hit_window: windows.hits,
            agg_shard_size: windows.agg,
            timeout,
            allow_partial,
            target_shards: targets,
            avoid_nodes,
            safety_override,
            pattern,
            from: classification.from,
            size: classification.size,
            terms_agg: classification.terms_agg.clone(),
            body: query.body.clone(),
        };
        tracing::debug!(
            index = %plan.index,
            pattern = %plan.pattern,
            targets = plan.target_shards.len(),
            shard_hit_window = plan.shard_hit_window,
            allow_partial = plan.allow_partial,
            "query planned"
        );
        Ok(plan)
    }

    /// Safety timeout: scaled by the configured factor, floored at the
    /// minimum, and never longer than the timeout it replaces.
    fn shortened_timeout(&self, timeout: Duration) -> Duration {
        let scaled = timeout.mul_f64(self.execution.safety_timeout_factor);
        scaled.max(self.execution.min_timeout()).min(timeout)
    }
}
