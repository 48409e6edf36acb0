//! Cluster state cache: the engine's only view of shard placement.
//!
//! - `get()` returns the held snapshot without waiting while it is younger
//!   than `max_age`. An older snapshot triggers a refresh; if that fails the
//!   call fails with `StaleTopology` instead of planning on stale placement.
//! - Concurrent `refresh()` calls collapse into one fetch: callers that find
//!   a refresh completed while they waited take its result.
//! - Every fetch is bounded by `refresh_timeout`; a source that does not
//!   answer counts as a failed refresh.
//! - Before the first snapshot exists, `get()` retries the fetch for up to
//!   `cold_start_grace`.
//! - `spawn_refresher()` refreshes on a fixed interval until its handle is
//!   stopped or dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use shardwise_common::config::TopologyConfig;
use shardwise_common::error::{ShardwiseError, ShardwiseResult, TopologyError};
use shardwise_common::search::TopologyFreshness;
use shardwise_common::topology::ClusterSnapshot;
use shardwise_common::types::ClusterHealth;

use crate::transport::TopologySource;

type RefreshOutcome = Result<Arc<ClusterSnapshot>, TopologyError>;

/// Counters exposed for observability.
#[derive(Debug, Default)]
struct RefreshCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    collapsed: AtomicU64,
}

/// Point-in-time view of the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshStats {
    /// Fetches issued to the topology source.
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// `refresh()` callers served by another caller's fetch.
    pub collapsed: u64,
    pub snapshot_age: Option<Duration>,
    pub health: Option<ClusterHealth>,
}

pub struct ClusterStateCache {
    source: Arc<dyn TopologySource>,
    config: TopologyConfig,
    current: RwLock<Option<Arc<ClusterSnapshot>>>,
    /// Held for the duration of a fetch; stores the last fetch's outcome.
    in_flight: Mutex<Option<RefreshOutcome>>,
    /// Bumped after every completed fetch.
    generation: AtomicU64,
    counters: RefreshCounters,
}

impl ClusterStateCache {
    pub fn new(source: Arc<dyn TopologySource>, config: TopologyConfig) -> Self {
        Self {
            source,
            config,
            current: RwLock::new(None),
            in_flight: Mutex::new(None),
            generation: AtomicU64::new(0),
            counters: RefreshCounters::default(),
        }
    }

    /// The held snapshot regardless of age.
    pub fn current(&self) -> Option<Arc<ClusterSnapshot>> {
        self.current.read().clone()
    }

    pub fn stats(&self) -> RefreshStats {
        let current = self.current();
        RefreshStats {
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            collapsed: self.counters.collapsed.load(Ordering::Relaxed),
            snapshot_age: current.as_ref().map(|s| s.age()),
            health: current.as_ref().map(|s| s.health()),
        }
    }

    /// Pull a new snapshot and swap it in. Joins a fetch already in flight.
    pub async fn refresh(&self) -> RefreshOutcome {
        let observed = self.generation.load(Ordering::Acquire);
        let mut slot = self.in_flight.lock().await;
        if self.generation.load(Ordering::Acquire) != observed {
            if let Some(outcome) = slot.as_ref() {
                self.counters.collapsed.fetch_add(1, Ordering::Relaxed);
                return outcome.clone();
            }
        }

        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        let limit = self.config.refresh_timeout();
        let outcome = match tokio::time::timeout(limit, self.fetch()).await {
            Ok(fetched) => fetched.map(Arc::new),
            Err(_elapsed) => Err(TopologyError::Unavailable(format!(
                "topology source did not answer within {}ms",
                self.config.refresh_timeout_ms
            ))),
        };
        match &outcome {
            Ok(snapshot) => {
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                self.install(Arc::clone(snapshot));
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "topology refresh failed");
            }
        }
        shardwise_observability::record_topology_refresh(
            outcome.is_ok(),
            outcome.as_ref().map(|s| s.shards().len()).unwrap_or(0),
            &outcome
                .as_ref()
                .map(|s| s.health().to_string())
                .unwrap_or_default(),
        );

        *slot = Some(outcome.clone());
        self.generation.fetch_add(1, Ordering::Release);
        outcome
    }

    async fn fetch(&self) -> Result<ClusterSnapshot, TopologyError> {
        let topology = self.source.get_shard_topology(None).await?;
        let reported = match self.source.get_cluster_health().await {
            Ok(health) => health.max(topology.health()),
            Err(e) => {
                tracing::warn!(error = %e, "cluster health unavailable; using topology-derived health");
                topology.health()
            }
        };
        let snapshot = ClusterSnapshot::new(topology.shards().to_vec(), reported);
        snapshot.validate()?;
        Ok(snapshot)
    }

    fn install(&self, snapshot: Arc<ClusterSnapshot>) {
        let previous = self.current.write().replace(Arc::clone(&snapshot));
        match previous {
            Some(prev)
                if prev.health() == snapshot.health()
                    && prev.shards().len() == snapshot.shards().len() =>
            {
                tracing::debug!(copies = snapshot.shards().len(), "topology refreshed");
            }
            Some(prev) => tracing::info!(
                copies = snapshot.shards().len(),
                previous_copies = prev.shards().len(),
                health = %snapshot.health(),
                previous_health = %prev.health(),
                "topology changed"
            ),
            None => tracing::info!(
                copies = snapshot.shards().len(),
                health = %snapshot.health(),
                indices = snapshot.indices().len(),
                "initial topology snapshot installed"
            ),
        }
    }

    /// Snapshot for planning.
    pub async fn get(&self) -> ShardwiseResult<Arc<ClusterSnapshot>> {
        let Some(snapshot) = self.current() else {
            return self.cold_start().await;
        };
        let age = snapshot.age();
        if age <= self.config.max_age() {
            return Ok(snapshot);
        }
        match self.refresh().await {
            Ok(fresh) => Ok(fresh),
            Err(e) => {
                let age_ms = age.as_millis() as u64;
                tracing::warn!(age_ms, error = %e, "topology snapshot stale and refresh failed");
                Err(ShardwiseError::stale(
                    Some(age_ms),
                    format!(
                        "snapshot is {}ms old (max {}ms) and refresh failed: {}",
                        age_ms, self.config.max_age_ms, e
                    ),
                ))
            }
        }
    }

    /// `Fresh` refreshes first and falls back to `get()` if that fails.
    pub async fn get_with(
        &self,
        freshness: TopologyFreshness,
    ) -> ShardwiseResult<Arc<ClusterSnapshot>> {
        if freshness == TopologyFreshness::Fresh {
            if let Ok(snapshot) = self.refresh().await {
                return Ok(snapshot);
            }
        }
        self.get().await
    }

    async fn cold_start(&self) -> ShardwiseResult<Arc<ClusterSnapshot>> {
        let grace = self.config.cold_start_grace();
        let retry = self.config.cold_start_retry();
        let mut last_error = None;
        let outcome = tokio::time::timeout(grace, async {
            loop {
                match self.refresh().await {
                    Ok(snapshot) => return snapshot,
                    Err(e) => {
                        last_error = Some(e);
                        tokio::time::sleep(retry).await;
                    }
                }
            }
        })
        .await;

        outcome.map_err(|_| {
            let cause = last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no response from topology source".to_string());
            tracing::warn!(grace_ms = self.config.cold_start_grace_ms, %cause, "no topology within cold start grace");
            ShardwiseError::stale(
                None,
                format!(
                    "no topology snapshot within {}ms cold start grace: {}",
                    self.config.cold_start_grace_ms, cause
                ),
            )
        })
    }

    /// Start the background refresher.
    pub fn spawn_refresher(self: &Arc<Self>) -> RefresherHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let cache = Arc::clone(self);
        let period = self.config.refresh_interval();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_ms = period.as_millis() as u64, "topology refresher started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // failures are logged and counted by refresh()
                        let _ = cache.refresh().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("topology refresher stopped");
        });

        RefresherHandle {
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }
}

/// Owns the background refresh task. Dropping it stops the task.
pub struct RefresherHandle {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl RefresherHandle {
    /// Signal shutdown and wait for the task to exit.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for RefresherHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
