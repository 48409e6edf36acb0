//! Advisory inputs the planner accepts from outcome feedback.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use shardwise_common::types::NodeId;

use crate::plan::PatternKey;

/// Tuning advice for one plan pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advice {
    /// Factor in (0, 1] applied to the top-k multiplier.
    pub multiplier_scale: f64,
    pub avoid_nodes: BTreeSet<NodeId>,
}

impl Advice {
    pub fn neutral() -> Self {
        Self {
            multiplier_scale: 1.0,
            avoid_nodes: BTreeSet::new(),
        }
    }

    pub fn is_neutral(&self) -> bool {
        self.multiplier_scale >= 1.0 && self.avoid_nodes.is_empty()
    }
}

impl Default for Advice {
    fn default() -> Self {
        Self::neutral()
    }
}

/// Source of advice consulted by `StrategyPlanner` after the fixed rules.
pub trait PlanningHints: Send + Sync {
    fn advise(&self, pattern: &PatternKey) -> Advice;
}

/// Gives neutral advice for every pattern.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHints;

impl PlanningHints for NoHints {
    fn advise(&self, _pattern: &PatternKey) -> Advice {
        Advice::neutral()
    }
}
