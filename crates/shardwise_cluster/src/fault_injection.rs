//! Fault injection for the simulated cluster.
//!
//! Faults are armed per shard, per node or on the topology source and are
//! checked by `SimulatedCluster` before it serves a call. Call counters make
//! it possible to assert how many network calls a scenario issued (for
//! example that planning errors issue none and failed shards are not retried).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

use shardwise_common::error::ShardError;
use shardwise_common::types::{NodeId, ShardId};

/// Thread-safe fault state shared between a test and the simulated cluster.
#[derive(Debug, Default)]
pub struct FaultInjector {
    shard_failures: DashMap<ShardId, ShardError>,
    shard_delays: DashMap<ShardId, Duration>,
    node_failures: DashMap<NodeId, ShardError>,
    topology_outage: AtomicBool,
    topology_delay_ms: AtomicU64,
    topology_calls: AtomicU64,
    shard_calls: DashMap<ShardId, u64>,
    node_calls: DashMap<NodeId, u64>,
    faults_fired: AtomicU64,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Shard faults ──

    /// Every call to `shard` (on any copy) fails with `error`.
    pub fn fail_shard(&self, shard: ShardId, error: ShardError) {
        self.shard_failures.insert(shard, error);
    }

    pub fn heal_shard(&self, shard: ShardId) {
        self.shard_failures.remove(&shard);
    }

    /// Every call to `shard` sleeps for `delay` before answering.
    pub fn delay_shard(&self, shard: ShardId, delay: Duration) {
        self.shard_delays.insert(shard, delay);
    }

    pub fn clear_delay(&self, shard: ShardId) {
        self.shard_delays.remove(&shard);
    }

    // ── Node faults ──

    /// Every call served by a copy on `node` fails with `error`.
    pub fn fail_node(&self, node: NodeId, error: ShardError) {
        self.node_failures.insert(node, error);
    }

    pub fn heal_node(&self, node: &NodeId) {
        self.node_failures.remove(node);
    }

    // ── Topology source ──

    pub fn set_topology_outage(&self, down: bool) {
        self.topology_outage.store(down, Ordering::SeqCst);
    }

    pub fn topology_outage_active(&self) -> bool {
        self.topology_outage.load(Ordering::SeqCst)
    }

    pub fn set_topology_delay(&self, delay: Duration) {
        self.topology_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    // ── Hooks called by the simulated cluster ──

    /// Count a topology call and report whether the source is down.
    pub(crate) fn on_topology_call(&self) -> (Duration, bool) {
        self.topology_calls.fetch_add(1, Ordering::Relaxed);
        let delay = Duration::from_millis(self.topology_delay_ms.load(Ordering::Relaxed));
        let down = self.topology_outage.load(Ordering::SeqCst);
        if down {
            self.faults_fired.fetch_add(1, Ordering::Relaxed);
        }
        (delay, down)
    }

    /// Count a shard call; returns the injected delay and failure, if any.
    pub(crate) fn on_shard_call(
        &self,
        shard: ShardId,
        node: &NodeId,
    ) -> (Option<Duration>, Option<ShardError>) {
        *self.shard_calls.entry(shard).or_insert(0) += 1;
        *self.node_calls.entry(node.clone()).or_insert(0) += 1;

        let delay = self.shard_delays.get(&shard).map(|d| *d);
        let failure = self
            .shard_failures
            .get(&shard)
            .map(|e| e.clone())
            .or_else(|| self.node_failures.get(node).map(|e| e.clone()));
        if delay.is_some() || failure.is_some() {
            self.faults_fired.fetch_add(1, Ordering::Relaxed);
        }
        (delay, failure)
    }

    // ── Observability ──

    pub fn topology_calls(&self) -> u64 {
        self.topology_calls.load(Ordering::Relaxed)
    }

    pub fn shard_calls(&self, shard: ShardId) -> u64 {
        self.shard_calls.get(&shard).map(|c| *c).unwrap_or(0)
    }

    pub fn node_calls(&self, node: &NodeId) -> u64 {
        self.node_calls.get(node).map(|c| *c).unwrap_or(0)
    }

    pub fn total_shard_calls(&self) -> u64 {
        self.shard_calls.iter().map(|e| *e.value()).sum()
    }

    /// Number of calls on which an armed fault took effect.
    pub fn faults_fired(&self) -> u64 {
        self.faults_fired.load(Ordering::Relaxed)
    }

    /// Reset all faults and counters.
    pub fn reset(&self) {
        self.shard_failures.clear();
        self.shard_delays.clear();
        self.node_failures.clear();
        self.topology_outage.store(false, Ordering::SeqCst);
        self.topology_delay_ms.store(0, Ordering::Relaxed);
        self.topology_calls.store(0, Ordering::Relaxed);
        self.shard_calls.clear();
        self.node_calls.clear();
        self.faults_fired.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_failure_takes_precedence_over_node() {
        let f = FaultInjector::new();
        let n1 = NodeId::new("n1");
        f.fail_node(n1.clone(), ShardError::Transport("node down".into()));
        f.fail_shard(ShardId(0), ShardError::Rejected("queue full".into()));

        let (_, err) = f.on_shard_call(ShardId(0), &n1);
        assert_eq!(err, Some(ShardError::Rejected("queue full".into())));
        let (_, err) = f.on_shard_call(ShardId(1), &n1);
        assert_eq!(err, Some(ShardError::Transport("node down".into())));
        assert_eq!(f.faults_fired(), 2);
    }

    #[test]
    fn test_counters_and_reset() {
        let f = FaultInjector::new();
        let n = NodeId::new("n0");
        f.on_shard_call(ShardId(2), &n);
        f.on_shard_call(ShardId(2), &n);
        f.on_topology_call();
        assert_eq!(f.shard_calls(ShardId(2)), 2);
        assert_eq!(f.node_calls(&n), 2);
        assert_eq!(f.total_shard_calls(), 2);
        assert_eq!(f.topology_calls(), 1);

        f.delay_shard(ShardId(2), Duration::from_millis(5));
        f.reset();
        assert_eq!(f.total_shard_calls(), 0);
        assert_eq!(f.on_shard_call(ShardId(2), &n), (None, None));
    }

    #[test]
    fn test_topology_outage_toggle() {
        let f = FaultInjector::new();
        assert!(!f.on_topology_call().1);
        f.set_topology_outage(true);
        assert!(f.on_topology_call().1);
        f.set_topology_outage(false);
        assert!(!f.on_topology_call().1);
        assert_eq!(f.faults_fired(), 1);
    }
}
