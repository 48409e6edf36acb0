//! Outcome feedback keyed by plan pattern.
//!
//! Every completed (or failed) search records a `StrategyOutcome`. Per
//! pattern we keep exponentially weighted averages of latency and failure
//! rate plus a bounded history (oldest evicted first). Per node we keep a
//! failure average fed from the copies that served or failed shards. The
//! planner reads advice through the `PlanningHints` trait.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

use shardwise_common::config::FeedbackConfig;
use shardwise_common::types::NodeId;
use shardwise_planner::hints::{Advice, PlanningHints};
use shardwise_planner::plan::PatternKey;

/// Summary of one `submit` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyOutcome {
    pub pattern: PatternKey,
    pub shards_queried: usize,
    pub shards_failed: usize,
    pub hit_count: usize,
    /// Nodes whose copy answered a shard call.
    pub served_nodes: Vec<NodeId>,
    /// Nodes whose copy failed or timed out.
    pub failed_nodes: Vec<NodeId>,
    pub latency: Duration,
    pub success: bool,
}

impl StrategyOutcome {
    /// Failure sample for the pattern average: 1.0 for a failed call,
    /// otherwise the fraction of shards that failed.
    pub fn failure_rate(&self) -> f64 {
        if !self.success {
            1.0
        } else if self.shards_queried == 0 {
            0.0
        } else {
            self.shards_failed as f64 / self.shards_queried as f64
        }
    }
}

/// Exponentially weighted mean and variance. The first sample seeds the mean.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Ewma {
    mean: f64,
    variance: f64,
    samples: u64,
}

impl Ewma {
    fn update(&mut self, value: f64, alpha: f64) {
        if self.samples == 0 {
            self.mean = value;
            self.variance = 0.0;
        } else {
            let diff = value - self.mean;
            let incr = alpha * diff;
            self.mean += incr;
            self.variance = (1.0 - alpha) * (self.variance + diff * incr);
        }
        self.samples += 1;
    }

    fn stddev(&self) -> f64 {
        self.variance.max(0.0).sqrt()
    }
}

#[derive(Debug, Default)]
struct PatternStats {
    latency_ms: Ewma,
    failure: Ewma,
    history: VecDeque<StrategyOutcome>,
}

#[derive(Debug, Default)]
struct Inner {
    patterns: BTreeMap<PatternKey, PatternStats>,
    nodes: BTreeMap<NodeId, Ewma>,
}

/// Read-only view of one pattern's averages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternSnapshot {
    pub pattern: PatternKey,
    pub samples: u64,
    pub latency_ewma_ms: f64,
    pub latency_stddev_ms: f64,
    pub failure_ewma: f64,
    pub history_len: usize,
}

impl PatternSnapshot {
    /// Coefficient of variation of latency; 0 when the mean is 0.
    pub fn latency_cv(&self) -> f64 {
        if self.latency_ewma_ms > 0.0 {
            self.latency_stddev_ms / self.latency_ewma_ms
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSnapshot {
    pub node: NodeId,
    pub samples: u64,
    pub failure_ewma: f64,
}

/// Consistent copy of all feedback state, taken under one read lock.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedbackSnapshot {
    pub patterns: Vec<PatternSnapshot>,
    pub nodes: Vec<NodeSnapshot>,
}

impl FeedbackSnapshot {
    pub fn pattern(&self, key: &PatternKey) -> Option<&PatternSnapshot> {
        self.patterns.iter().find(|p| &p.pattern == key)
    }

    pub fn node(&self, node: &NodeId) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|n| &n.node == node)
    }
}

pub struct AdaptiveFeedback {
    config: FeedbackConfig,
    inner: RwLock<Inner>,
}

impl AdaptiveFeedback {
    pub fn new(config: FeedbackConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn config(&self) -> &FeedbackConfig {
        &self.config
    }

    /// Append an outcome and fold it into the pattern and node averages.
    pub fn record(&self, outcome: StrategyOutcome) {
        let alpha = self.config.decay;
        let latency_ms = outcome.latency.as_secs_f64() * 1_000.0;
        let failure = outcome.failure_rate();
        let pattern = outcome.pattern;

        // A node counts once per outcome; any failure on it wins.
        let node_samples: Vec<(NodeId, f64)> = {
            let failed: BTreeSet<&NodeId> = outcome.failed_nodes.iter().collect();
            outcome
                .served_nodes
                .iter()
                .chain(outcome.failed_nodes.iter())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(|node| (node.clone(), if failed.contains(node) { 1.0 } else { 0.0 }))
                .collect()
        };

        let (samples, latency_ewma, failure_ewma) = {
            let mut inner = self.inner.write();
            for (node, sample) in node_samples {
                inner.nodes.entry(node).or_default().update(sample, alpha);
            }

            let stats = inner.patterns.entry(pattern).or_default();
            stats.latency_ms.update(latency_ms, alpha);
            stats.failure.update(failure, alpha);
            if stats.history.len() >= self.config.history_size {
                stats.history.pop_front();
            }
            stats.history.push_back(outcome);
            (
                stats.latency_ms.samples,
                stats.latency_ms.mean,
                stats.failure.mean,
            )
        };

        tracing::debug!(
            pattern = %pattern,
            latency_ms,
            failure,
            latency_ewma_ms = latency_ewma,
            failure_ewma,
            samples,
            "strategy outcome recorded"
        );
        shardwise_observability::record_feedback_pattern(
            &pattern.to_string(),
            latency_ewma,
            failure_ewma,
            samples,
        );
    }

    pub fn snapshot(&self) -> FeedbackSnapshot {
        let inner = self.inner.read();
        FeedbackSnapshot {
            patterns: inner
                .patterns
                .iter()
                .map(|(key, s)| PatternSnapshot {
                    pattern: *key,
                    samples: s.latency_ms.samples,
                    latency_ewma_ms: s.latency_ms.mean,
                    latency_stddev_ms: s.latency_ms.stddev(),
                    failure_ewma: s.failure.mean,
                    history_len: s.history.len(),
                })
                .collect(),
            nodes: inner
                .nodes
                .iter()
                .map(|(node, e)| NodeSnapshot {
                    node: node.clone(),
                    samples: e.samples,
                    failure_ewma: e.mean,
                })
                .collect(),
        }
    }

    /// Retained outcomes for one pattern, oldest first.
    pub fn history(&self, pattern: &PatternKey) -> Vec<StrategyOutcome> {
        self.inner
            .read()
            .patterns
            .get(pattern)
            .map(|s| s.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.patterns.clear();
        inner.nodes.clear();
    }

    fn advise_inner(&self, pattern: &PatternKey) -> Advice {
        let cfg = &self.config;
        let inner = self.inner.read();

        let multiplier_scale = match inner.patterns.get(pattern) {
            Some(s) if s.latency_ms.samples >= cfg.min_samples => {
                let cv = if s.latency_ms.mean > 0.0 {
                    s.latency_ms.stddev() / s.latency_ms.mean
                } else {
                    0.0
                };
                if s.failure.mean < cfg.max_failure_rate && cv < cfg.low_variance_cv {
                    cfg.multiplier_scale
                } else {
                    1.0
                }
            }
            _ => 1.0,
        };

        let avoid_nodes = inner
            .nodes
            .iter()
            .filter(|(_, e)| e.samples >= cfg.min_samples && e.mean >= cfg.node_avoid_failure_rate)
            .map(|(node, _)| node.clone())
            .collect();

        Advice {
            multiplier_scale,
            avoid_nodes,
        }
    }
}

impl PlanningHints for AdaptiveFeedback {
    fn advise(&self, pattern: &PatternKey) -> Advice {
        self.advise_inner(pattern)
    }
}
