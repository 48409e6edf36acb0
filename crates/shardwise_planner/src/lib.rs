//! Query analysis and strategy planning.
//!
//! `QueryAnalyzer` turns a query into a `QueryClassification`;
//! `StrategyPlanner` combines it with a `ClusterSnapshot` and feedback
//! advice into a `QueryPlan`. Neither touches the network.

pub mod analyzer;
pub mod hints;
pub mod plan;
pub mod planner;
pub mod routing;
pub mod time_mapping;

pub use analyzer::{QueryAnalyzer, QueryClassification, TenantKey, TermsAggRequest, TimeRange};
pub use hints::{Advice, NoHints, PlanningHints};
pub use plan::{PatternKey, Preference, QueryPlan, ShardSetShape};
pub use planner::{ShardWindows, StrategyPlanner};
pub use routing::{route_shard, routing_hash};
pub use time_mapping::{RangeTableMapping, TimeShardMapping};
