use serde::{Deserialize, Serialize};
use std::fmt;

/// Shard number within an index (OpenSearch shard ordinal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub u32);

/// Identifier of a data node hosting shard copies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard:{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

/// Role of a shard copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardRole {
    Primary,
    Replica,
}

impl fmt::Display for ShardRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardRole::Primary => write!(f, "primary"),
            ShardRole::Replica => write!(f, "replica"),
        }
    }
}

/// Allocation state of a shard copy, as reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardState {
    Started,
    Relocating,
    Unassigned,
}

impl ShardState {
    /// A copy in this state can still serve searches.
    pub fn is_searchable(self) -> bool {
        matches!(self, ShardState::Started | ShardState::Relocating)
    }

    /// The copy is not in steady state (planner safety rule applies).
    pub fn is_unstable(self) -> bool {
        matches!(self, ShardState::Relocating | ShardState::Unassigned)
    }
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardState::Started => write!(f, "STARTED"),
            ShardState::Relocating => write!(f, "RELOCATING"),
            ShardState::Unassigned => write!(f, "UNASSIGNED"),
        }
    }
}

/// Overall cluster health. Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterHealth {
    Green,
    Yellow,
    Red,
}

impl ClusterHealth {
    pub fn is_degraded(self) -> bool {
        self != ClusterHealth::Green
    }
}

impl fmt::Display for ClusterHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterHealth::Green => write!(f, "green"),
            ClusterHealth::Yellow => write!(f, "yellow"),
            ClusterHealth::Red => write!(f, "red"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_ordering() {
        assert!(ClusterHealth::Green < ClusterHealth::Yellow);
        assert!(ClusterHealth::Yellow < ClusterHealth::Red);
        assert_eq!(ClusterHealth::Yellow.max(ClusterHealth::Red), ClusterHealth::Red);
        assert!(!ClusterHealth::Green.is_degraded());
    }

    #[test]
    fn test_shard_state_classes() {
        assert!(ShardState::Started.is_searchable());
        assert!(ShardState::Relocating.is_searchable());
        assert!(!ShardState::Unassigned.is_searchable());
        assert!(!ShardState::Started.is_unstable());
        assert!(ShardState::Relocating.is_unstable());
    }

    #[test]
    fn test_display() {
        assert_eq!(ShardId(3).to_string(), "shard:3");
        assert_eq!(NodeId::new("n1").to_string(), "node:n1");
        assert_eq!(ShardState::Unassigned.to_string(), "UNASSIGNED");
    }
}
