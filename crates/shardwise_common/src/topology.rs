//! Shard topology model: per-copy descriptors and immutable cluster snapshots.
//!
//! A `ClusterSnapshot` is built once from what the topology source reports and
//! is never mutated afterwards; the cache swaps in a new `Arc<ClusterSnapshot>`
//! on every refresh.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TopologyError;
use crate::types::{ClusterHealth, NodeId, ShardId, ShardRole, ShardState};

/// One copy (primary or replica) of one shard of one index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub index: String,
    pub shard: ShardId,
    pub role: ShardRole,
    /// Hosting node. `None` while the copy is unassigned.
    pub node: Option<NodeId>,
    pub state: ShardState,
    /// Approximate on-disk size.
    pub size_bytes: u64,
}

impl ShardDescriptor {
    pub fn started(
        index: impl Into<String>,
        shard: u32,
        role: ShardRole,
        node: impl Into<String>,
    ) -> Self {
        Self {
            index: index.into(),
            shard: ShardId(shard),
            role,
            node: Some(NodeId::new(node)),
            state: ShardState::Started,
            size_bytes: 0,
        }
    }

    pub fn unassigned(index: impl Into<String>, shard: u32, role: ShardRole) -> Self {
        Self {
            index: index.into(),
            shard: ShardId(shard),
            role,
            node: None,
            state: ShardState::Unassigned,
            size_bytes: 0,
        }
    }

    pub fn with_state(mut self, state: ShardState) -> Self {
        self.state = state;
        if state == ShardState::Unassigned {
            self.node = None;
        }
        self
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    pub fn is_primary(&self) -> bool {
        self.role == ShardRole::Primary
    }

    /// Searchable copies need both a searchable state and a hosting node.
    pub fn is_searchable(&self) -> bool {
        self.state.is_searchable() && self.node.is_some()
    }

    fn sort_key(&self) -> (&str, ShardId, ShardRole, Option<&NodeId>) {
        (self.index.as_str(), self.shard, self.role, self.node.as_ref())
    }
}

/// Point-in-time view of shard placement and cluster health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    /// Wall-clock time the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Ordered by (index, shard, role primary-first, node).
    shards: Vec<ShardDescriptor>,
    health: ClusterHealth,
    #[serde(skip, default = "Instant::now")]
    fetched_at: Instant,
}

impl ClusterSnapshot {
    /// Build a snapshot, reconciling the health reported by the cluster with
    /// the health implied by shard states.
    ///
    /// RED is kept only if some primary is unassigned; a RED report without
    /// one is recorded as YELLOW.
    pub fn new(mut shards: Vec<ShardDescriptor>, reported: ClusterHealth) -> Self {
        shards.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        let derived = Self::derive_health(&shards);
        let health = match reported.max(derived) {
            ClusterHealth::Red if derived != ClusterHealth::Red => ClusterHealth::Yellow,
            h => h,
        };
        Self {
            timestamp: Utc::now(),
            shards,
            health,
            fetched_at: Instant::now(),
        }
    }

    /// Health implied purely by shard states.
    pub fn derive_health(shards: &[ShardDescriptor]) -> ClusterHealth {
        let mut health = ClusterHealth::Green;
        for s in shards {
            if s.state == ShardState::Unassigned {
                if s.is_primary() {
                    return ClusterHealth::Red;
                }
                health = ClusterHealth::Yellow;
            }
        }
        health
    }

    pub fn health(&self) -> ClusterHealth {
        self.health
    }

    pub fn shards(&self) -> &[ShardDescriptor] {
        &self.shards
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Time elapsed since the snapshot was fetched.
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    pub fn indices(&self) -> BTreeSet<&str> {
        self.shards.iter().map(|s| s.index.as_str()).collect()
    }

    pub fn has_index(&self, index: &str) -> bool {
        self.shards.iter().any(|s| s.index == index)
    }

    /// All shard ids of an index.
    pub fn shard_ids(&self, index: &str) -> BTreeSet<ShardId> {
        self.shards
            .iter()
            .filter(|s| s.index == index)
            .map(|s| s.shard)
            .collect()
    }

    /// Number of primary shards of an index, used as the routing modulus.
    pub fn number_of_shards(&self, index: &str) -> u32 {
        self.shard_ids(index)
            .iter()
            .next_back()
            .map(|s| s.0 + 1)
            .unwrap_or(0)
    }

    /// Copies of one shard, primary first.
    pub fn copies<'a: 'b, 'b>(
        &'a self,
        index: &'b str,
        shard: ShardId,
    ) -> impl Iterator<Item = &'a ShardDescriptor> + 'b {
        self.shards
            .iter()
            .filter(move |s| s.index == index && s.shard == shard)
    }

    pub fn primary<'a>(&'a self, index: &str, shard: ShardId) -> Option<&'a ShardDescriptor> {
        self.copies(index, shard).find(|s| s.is_primary())
    }

    /// At least one copy of the shard can serve searches.
    pub fn is_assigned(&self, index: &str, shard: ShardId) -> bool {
        self.copies(index, shard).any(|s| s.is_searchable())
    }

    /// Some copy of the shard is relocating or unassigned.
    pub fn is_unstable(&self, index: &str, shard: ShardId) -> bool {
        self.copies(index, shard).any(|s| s.state.is_unstable())
    }

    /// Nodes hosting at least one copy of the index.
    pub fn nodes(&self, index: &str) -> BTreeSet<&NodeId> {
        self.shards
            .iter()
            .filter(|s| s.index == index)
            .filter_map(|s| s.node.as_ref())
            .collect()
    }

    /// Rejects placements no cluster can report: two primaries for one shard,
    /// or two copies of one shard on the same node.
    pub fn validate(&self) -> Result<(), TopologyError> {
        let mut primaries = BTreeSet::new();
        let mut placed = BTreeSet::new();
        for s in &self.shards {
            if s.is_primary() && !primaries.insert((s.index.as_str(), s.shard)) {
                return Err(TopologyError::Malformed(format!(
                    "index '{}' reports more than one primary for {}",
                    s.index, s.shard
                )));
            }
            if let Some(node) = &s.node {
                if !placed.insert((s.index.as_str(), s.shard, node)) {
                    return Err(TopologyError::Malformed(format!(
                        "index '{}' places two copies of {} on {}",
                        s.index, s.shard, node
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_shards() -> Vec<ShardDescriptor> {
        vec![
            ShardDescriptor::started("logs", 2, ShardRole::Primary, "n3"),
            ShardDescriptor::started("logs", 0, ShardRole::Replica, "n2"),
            ShardDescriptor::started("logs", 0, ShardRole::Primary, "n1"),
            ShardDescriptor::started("logs", 1, ShardRole::Primary, "n2"),
        ]
    }

    #[test]
    fn test_snapshot_orders_shards() {
        let snap = ClusterSnapshot::new(three_shards(), ClusterHealth::Green);
        let order: Vec<(u32, ShardRole)> =
            snap.shards().iter().map(|s| (s.shard.0, s.role)).collect();
        assert_eq!(
            order,
            vec![
                (0, ShardRole::Primary),
                (0, ShardRole::Replica),
                (1, ShardRole::Primary),
                (2, ShardRole::Primary),
            ]
        );
        assert_eq!(snap.number_of_shards("logs"), 3);
        assert_eq!(snap.number_of_shards("missing"), 0);
    }

    #[test]
    fn test_red_requires_unassigned_primary() {
        let snap = ClusterSnapshot::new(three_shards(), ClusterHealth::Red);
        assert_eq!(snap.health(), ClusterHealth::Yellow);

        let mut shards = three_shards();
        shards.push(ShardDescriptor::unassigned("logs", 3, ShardRole::Primary));
        let snap = ClusterSnapshot::new(shards, ClusterHealth::Green);
        assert_eq!(snap.health(), ClusterHealth::Red);
    }

    #[test]
    fn test_unassigned_replica_is_yellow() {
        let mut shards = three_shards();
        shards.push(ShardDescriptor::unassigned("logs", 1, ShardRole::Replica));
        let snap = ClusterSnapshot::new(shards, ClusterHealth::Green);
        assert_eq!(snap.health(), ClusterHealth::Yellow);
        assert!(snap.is_unstable("logs", ShardId(1)));
        assert!(snap.is_assigned("logs", ShardId(1)));
    }

    #[test]
    fn test_copies_and_primary() {
        let snap = ClusterSnapshot::new(three_shards(), ClusterHealth::Green);
        assert_eq!(snap.copies("logs", ShardId(0)).count(), 2);
        let primary = snap.primary("logs", ShardId(0)).unwrap();
        assert_eq!(primary.node, Some(NodeId::new("n1")));
        assert_eq!(snap.nodes("logs").len(), 3);
    }

    #[test]
    fn test_primary_outlives_index_name() {
        let snap = ClusterSnapshot::new(three_shards(), ClusterHealth::Green);
        let primary = {
            let index = String::from("logs");
            snap.primary(&index, ShardId(1))
        };
        assert_eq!(primary.and_then(|p| p.node.clone()), Some(NodeId::new("n2")));
        assert!(snap.primary("logs", ShardId(7)).is_none());
    }

    #[test]
    fn test_validate_rejects_conflicting_placement() {
        assert!(ClusterSnapshot::new(three_shards(), ClusterHealth::Green)
            .validate()
            .is_ok());

        let mut shards = three_shards();
        shards.push(ShardDescriptor::started("logs", 2, ShardRole::Primary, "n1"));
        let err = ClusterSnapshot::new(shards, ClusterHealth::Green)
            .validate()
            .unwrap_err();
        assert!(matches!(err, TopologyError::Malformed(_)), "{:?}", err);

        let mut shards = three_shards();
        shards.push(ShardDescriptor::started("logs", 1, ShardRole::Replica, "n2"));
        let err = ClusterSnapshot::new(shards, ClusterHealth::Green)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("two copies"), "{}", err);
    }

    #[test]
    fn test_with_state_unassigned_clears_node() {
        let d = ShardDescriptor::started("logs", 0, ShardRole::Replica, "n1")
            .with_state(ShardState::Unassigned);
        assert!(d.node.is_none());
        assert!(!d.is_searchable());
    }
}
