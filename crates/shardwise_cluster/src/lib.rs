//! Runtime side of Shardwise: topology caching, shard fan-out, result
//! merging, outcome feedback and the `SearchEngine` facade.

pub mod coordinator;
pub mod engine;
pub mod fault_injection;
pub mod feedback;
pub mod merge;
pub mod simulated;
pub mod topology_cache;
pub mod transport;

pub use coordinator::{ExecutionCoordinator, ScatterMetrics, ScatterOutcome};
pub use engine::SearchEngine;
pub use fault_injection::FaultInjector;
pub use feedback::{
    AdaptiveFeedback, FeedbackSnapshot, NodeSnapshot, PatternSnapshot, StrategyOutcome,
};
pub use merge::{bm25_idf, compare_hits, ResultMerger};
pub use simulated::SimulatedCluster;
pub use topology_cache::{ClusterStateCache, RefreshStats, RefresherHandle};
pub use transport::{ShardSearchRequest, ShardSearchResponse, ShardSearcher, TopologySource};
