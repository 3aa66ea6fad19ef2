//! Tracks the replica we're accepting samples from for each HA replica
//! group we know about.
//!
//! Every front-end runs one tracker. Elections live in a replicated KV
//! store under `tenant/replicaGroup` keys; a prefix watch mirrors them
//! into the local cache so the per-sample admission check normally never
//! leaves memory. Failover and garbage collection are driven through the
//! store's compare-and-swap, so independent front-ends converge without
//! talking to each other.

pub(crate) mod cache;
mod cleanup;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::TrackerConfig;
use crate::error::{Result, TrackerError};
use crate::kv::codec::ReplicaDesc;
use crate::kv::{Client, KvStore, WatchEvent};
use crate::limits::TrackerLimits;
use crate::metrics::TrackerMetrics;
use cache::ElectionCache;

const REPLICA_GROUP_COUNT_UPDATE_INTERVAL: Duration = Duration::from_secs(30);
const WATCH_RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// Consecutive watch failures after which the tracker reports itself
/// unhealthy. A single restart is routine (e.g. a KV leader change);
/// repeated ones mean the cache is no longer being kept current.
const MAX_WATCH_FAILURES: u32 = 3;

pub struct ReplicaTracker {
    cfg: TrackerConfig,
    limits: Arc<dyn TrackerLimits>,
    client: Client,
    cache: ElectionCache,
    metrics: TrackerMetrics,
    /// Update timeout with the process-wide jitter applied, in
    /// milliseconds. Drawn once at construction so independent front-ends
    /// spread their heartbeats.
    update_timeout_jittered_ms: i64,
    failover_timeout_ms: i64,
    /// Watch failures since the last successfully observed event.
    consecutive_watch_failures: AtomicU32,
}

impl ReplicaTracker {
    /// Build a tracker over the given store. Fails when the config is
    /// invalid or the metrics cannot be registered. The tracker is inert
    /// until [`run`](Self::run) is called.
    pub fn new(
        cfg: TrackerConfig,
        limits: Arc<dyn TrackerLimits>,
        store: Arc<dyn KvStore>,
        registry: &prometheus::Registry,
    ) -> Result<Self> {
        cfg.validate()?;

        let jitter_max_ms = cfg.update_timeout_jitter_max.as_millis() as i64;
        let jitter_ms = if jitter_max_ms > 0 {
            rand::thread_rng().gen_range(-jitter_max_ms..=jitter_max_ms)
        } else {
            0
        };

        let metrics = TrackerMetrics::new(registry)?;
        let client = Client::new(store, cfg.kvstore.prefix.clone());
        let update_timeout_jittered_ms = cfg.update_timeout.as_millis() as i64 + jitter_ms;
        let failover_timeout_ms = cfg.failover_timeout.as_millis() as i64;

        Ok(Self {
            cfg,
            limits,
            client,
            cache: ElectionCache::new(),
            metrics,
            update_timeout_jittered_ms,
            failover_timeout_ms,
            consecutive_watch_failures: AtomicU32::new(0),
        })
    }

    /// Run the tracker until the token is cancelled: mirror the watched
    /// prefix into the cache, sweep old replicas, and refresh the
    /// per-tenant group count gauge. When HA tracking is disabled this
    /// just parks until cancellation.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.cfg.enable_ha_tracker {
            cancel.cancelled().await;
            return;
        }

        let cleanup = tokio::spawn({
            let tracker = self.clone();
            let cancel = cancel.clone();
            async move { tracker.cleanup_loop(cancel).await }
        });
        let group_counts = tokio::spawn({
            let tracker = self.clone();
            let cancel = cancel.clone();
            async move { tracker.replica_group_count_loop(cancel).await }
        });

        self.watch_loop(cancel).await;

        let _ = cleanup.await;
        let _ = group_counts.await;
    }

    /// Consume watch events until cancelled, re-subscribing if the watch
    /// terminates unexpectedly. Repeated failures without an event in
    /// between flip [`is_healthy`](Self::is_healthy) to false.
    async fn watch_loop(&self, cancel: CancellationToken) {
        loop {
            let mut events = match self.client.watch_prefix().await {
                Ok(events) => events,
                Err(e) => {
                    let failures = self.record_watch_failure();
                    tracing::warn!(error = %e, failures, "Failed to start KV watch, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(WATCH_RESTART_BACKOFF) => continue,
                    }
                }
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => match event {
                        Some(event) => {
                            self.consecutive_watch_failures.store(0, Ordering::Relaxed);
                            self.observe(event).await;
                        }
                        None => break,
                    },
                }
            }

            if cancel.is_cancelled() {
                return;
            }
            let failures = self.record_watch_failure();
            tracing::warn!(failures, "KV watch terminated unexpectedly, restarting");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(WATCH_RESTART_BACKOFF) => {}
            }
        }
    }

    fn record_watch_failure(&self) -> u32 {
        self.consecutive_watch_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// True while the watch that keeps the cache current is making
    /// progress. Flips to false once several consecutive watch attempts
    /// have failed without an event in between; recovers on the next
    /// delivered event. A disabled tracker is always healthy.
    pub fn is_healthy(&self) -> bool {
        self.consecutive_watch_failures.load(Ordering::Relaxed) < MAX_WATCH_FAILURES
    }

    /// Apply one watch notification to the cache and metrics.
    async fn observe(&self, event: WatchEvent) {
        // A valid key looks like tenant/replicaGroup; anything without the
        // separator (e.g. `ring`) belongs to someone else sharing the
        // prefix and is ignored.
        let Some((tenant, replica_group)) = event.key.split_once('/') else {
            return;
        };
        let desc = event.desc;

        if desc.deleted_at > 0 {
            self.cache.remove(&event.key, tenant, replica_group).await;
            let _ = self
                .metrics
                .elected_replica_changes
                .remove_label_values(&[tenant, replica_group]);
            let _ = self
                .metrics
                .elected_replica_timestamp
                .remove_label_values(&[tenant, replica_group]);
            return;
        }

        let changed = self
            .cache
            .apply(&event.key, tenant, replica_group, desc.clone())
            .await;
        if changed {
            self.metrics
                .elected_replica_changes
                .with_label_values(&[tenant, replica_group])
                .inc();
        }
        self.metrics
            .elected_replica_timestamp
            .with_label_values(&[tenant, replica_group])
            .set((desc.received_at / 1000) as f64);
        let lag_ms = Utc::now().timestamp_millis() - desc.received_at;
        self.metrics
            .elected_replica_propagation_time
            .observe(lag_ms as f64 / 1000.0);
    }

    /// Check an incoming sample batch against the election for
    /// `tenant/replicaGroup`. Returns `Ok` when the sample should be
    /// accepted; [`TrackerError::ReplicasNotMatch`] means another replica
    /// is currently elected and the sample should be dropped without
    /// surfacing an error to the sender.
    ///
    /// The check may mutate the stored election, e.g. to refresh the
    /// heartbeat timestamp or fail over to a new replica once the elected
    /// one has been silent past the failover timeout.
    pub async fn check_replica(
        &self,
        tenant: &str,
        replica_group: &str,
        replica: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        // If HA tracking isn't enabled then accept the sample.
        if !self.cfg.enable_ha_tracker {
            return Ok(());
        }
        let key = format!("{tenant}/{replica_group}");
        let now_ms = now.timestamp_millis();

        let (entry, group_count) = self.cache.entry_and_group_count(&key, tenant).await;

        if let Some(entry) = &entry {
            if now_ms - entry.received_at < self.update_timeout_jittered_ms {
                if entry.replica != replica {
                    return Err(TrackerError::ReplicasNotMatch {
                        replica: replica.to_string(),
                        elected: entry.replica.clone(),
                    });
                }
                return Ok(());
            }
        }

        if entry.is_none() {
            // We don't know about this replica group yet; error out now if
            // tracking it would exceed the tenant's cap.
            let limit = self.limits.max_ha_replica_groups(tenant);
            if limit > 0 && group_count + 1 > limit {
                return Err(TrackerError::TooManyReplicaGroups { limit });
            }
        }

        let result = self.check_kv_store(&key, replica, now_ms).await;
        self.metrics
            .kv_cas_calls
            .with_label_values(&[tenant, replica_group])
            .inc();
        if let Err(err) = &result {
            // The CAS mutator rejects with ReplicasNotMatch when the sample
            // is being deduped; anything else is a real store failure.
            if !err.is_operation_aborted() {
                tracing::error!(key = %key, error = %err, "Rejecting sample");
            }
        }
        result
    }

    async fn check_kv_store(&self, key: &str, replica: &str, now_ms: i64) -> Result<()> {
        let update_window_ms = self.update_timeout_jittered_ms;
        let failover_ms = self.failover_timeout_ms;

        self.client
            .cas(key, |stored| {
                if let Some(desc) = &stored {
                    if desc.deleted_at == 0 {
                        // No need to touch the KV store if the entry was
                        // refreshed less than an update timeout ago.
                        if desc.replica == replica
                            && now_ms - desc.received_at < update_window_ms
                        {
                            return Ok(None);
                        }

                        // Don't failover while the elected replica has been
                        // seen within the failover timeout.
                        if desc.replica != replica
                            && now_ms - desc.received_at < failover_ms
                        {
                            return Err(TrackerError::ReplicasNotMatch {
                                replica: replica.to_string(),
                                elected: desc.replica.clone(),
                            });
                        }
                    }
                }

                // The entry is absent, tombstoned, or expired, so we now
                // accept samples from this replica.
                Ok(Some(ReplicaDesc {
                    replica: replica.to_string(),
                    received_at: now_ms,
                    deleted_at: 0,
                }))
            })
            .await
    }

    /// A value-copy of the currently elected replicas, for status display.
    pub async fn snapshot_elected(&self) -> HashMap<String, ReplicaDesc> {
        self.cache.snapshot().await
    }

    /// Remove the labelled series belonging to a departing tenant. The
    /// match runs against the registered series themselves, so groups
    /// whose elections were already cleaned up (and thus forgotten by the
    /// cache) are removed as well.
    pub fn cleanup_metrics_for_tenant(&self, tenant: &str) {
        self.metrics.delete_tenant_series(tenant);
    }

    async fn replica_group_count_loop(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(REPLICA_GROUP_COUNT_UPDATE_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => self.update_replica_group_counts().await,
            }
        }
    }

    async fn update_replica_group_counts(&self) {
        for (tenant, count) in self.cache.group_counts().await {
            self.metrics
                .user_replica_group_count
                .with_label_values(&[&tenant])
                .set(count as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KvStoreConfig;
    use crate::kv::memory::MemoryStore;
    use crate::kv::{CasMutator, KvEvent};
    use crate::limits::NoLimits;
    use tokio::sync::mpsc;

    fn tracker() -> ReplicaTracker {
        let cfg = TrackerConfig {
            enable_ha_tracker: true,
            update_timeout: Duration::from_secs(15),
            update_timeout_jitter_max: Duration::ZERO,
            failover_timeout: Duration::from_secs(30),
            kvstore: KvStoreConfig {
                store: "consul".to_string(),
                ..Default::default()
            },
        };
        ReplicaTracker::new(
            cfg,
            Arc::new(NoLimits),
            Arc::new(MemoryStore::new()),
            &prometheus::Registry::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_watch_ignores_keys_without_separator() {
        let tracker = tracker();

        tracker
            .observe(WatchEvent {
                key: "ring".to_string(),
                desc: ReplicaDesc {
                    replica: "r1".to_string(),
                    received_at: 1000,
                    deleted_at: 0,
                },
            })
            .await;

        assert!(tracker.snapshot_elected().await.is_empty());
    }

    #[tokio::test]
    async fn test_observe_tombstone_drops_entry() {
        let tracker = tracker();
        let live = ReplicaDesc {
            replica: "r1".to_string(),
            received_at: 1000,
            deleted_at: 0,
        };
        tracker
            .observe(WatchEvent {
                key: "t1/c1".to_string(),
                desc: live.clone(),
            })
            .await;
        assert_eq!(tracker.snapshot_elected().await.len(), 1);

        tracker
            .observe(WatchEvent {
                key: "t1/c1".to_string(),
                desc: ReplicaDesc {
                    deleted_at: 2000,
                    ..live
                },
            })
            .await;
        assert!(tracker.snapshot_elected().await.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_tracker_accepts_everything() {
        // Default config leaves the tracker disabled.
        let cfg = TrackerConfig {
            kvstore: KvStoreConfig {
                store: "consul".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let tracker = ReplicaTracker::new(
            cfg,
            Arc::new(NoLimits),
            Arc::new(MemoryStore::new()),
            &prometheus::Registry::new(),
        )
        .unwrap();

        for replica in ["r1", "r2", "r3"] {
            assert!(tracker
                .check_replica("t1", "c1", replica, Utc::now())
                .await
                .is_ok());
        }
    }

    /// Store whose watch can never be established.
    struct BrokenWatchStore;

    #[async_trait::async_trait]
    impl KvStore for BrokenWatchStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }

        async fn list(&self, _prefix: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            Ok(())
        }

        async fn compare_and_swap(&self, _key: &str, _mutator: CasMutator<'_>) -> Result<()> {
            Ok(())
        }

        async fn watch_prefix(&self, _prefix: &str) -> Result<mpsc::Receiver<KvEvent>> {
            Err(TrackerError::Kv("watch unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_persistent_watch_failure_marks_unhealthy() {
        let cfg = TrackerConfig {
            enable_ha_tracker: true,
            update_timeout: Duration::from_secs(15),
            update_timeout_jitter_max: Duration::ZERO,
            failover_timeout: Duration::from_secs(30),
            kvstore: KvStoreConfig {
                store: "consul".to_string(),
                ..Default::default()
            },
        };
        let tracker = Arc::new(
            ReplicaTracker::new(
                cfg,
                Arc::new(NoLimits),
                Arc::new(BrokenWatchStore),
                &prometheus::Registry::new(),
            )
            .unwrap(),
        );
        assert!(tracker.is_healthy());

        let cancel = CancellationToken::new();
        let run_handle = tokio::spawn(tracker.clone().run(cancel.clone()));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while tracker.is_healthy() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(
            !tracker.is_healthy(),
            "Repeated watch failures should mark the tracker unhealthy"
        );

        cancel.cancel();
        let _ = run_handle.await;
    }

    /// A delivered watch event clears the failure streak.
    #[tokio::test]
    async fn test_observed_event_resets_watch_failures() {
        let tracker = Arc::new(tracker());
        let cancel = CancellationToken::new();
        let run_handle = tokio::spawn(tracker.clone().run(cancel.clone()));

        // First election proves the watch is subscribed and delivering.
        tracker
            .check_replica("t1", "c1", "r1", Utc::now())
            .await
            .unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tracker.snapshot_elected().await.is_empty()
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(tracker.snapshot_elected().await.len(), 1);

        tracker
            .consecutive_watch_failures
            .store(MAX_WATCH_FAILURES, Ordering::Relaxed);
        assert!(!tracker.is_healthy());

        // A fresh election write flows back through the watch and resets
        // the streak.
        tracker
            .check_replica("t2", "c1", "r1", Utc::now())
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !tracker.is_healthy() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(
            tracker.is_healthy(),
            "A delivered watch event should mark the tracker healthy again"
        );

        cancel.cancel();
        let _ = run_handle.await;
    }
}
