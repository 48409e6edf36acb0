//! Shared model for Shardwise: shard identifiers, topology snapshots,
//! search request/result types, the error taxonomy and engine configuration.

pub mod config;
pub mod error;
pub mod search;
pub mod topology;
pub mod types;

pub use config::{EngineConfig, ExecutionConfig, FeedbackConfig, PlannerConfig, TopologyConfig};
pub use error::{
    ConfigError, ErrorKind, ShardError, ShardFailure, ShardwiseError, ShardwiseResult,
    TopologyError,
};
pub use search::{
    Hit, MergeWarning, MergedResult, SearchOptions, SearchQuery, ShardResult, TermBucket,
    TermStats, TopologyFreshness, TotalHits, TotalHitsRelation,
};
pub use topology::{ClusterSnapshot, ShardDescriptor};
pub use types::{ClusterHealth, NodeId, ShardId, ShardRole, ShardState};
