use std::collections::HashMap;

use prometheus::core::{Collector, MetricVec, MetricVecBuilder};
use prometheus::{
    Counter, CounterVec, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
};

use crate::error::Result;

/// Prometheus collectors for the tracker, registered once at construction
/// against the caller-supplied registry.
pub struct TrackerMetrics {
    pub(crate) elected_replica_changes: CounterVec,
    pub(crate) elected_replica_timestamp: GaugeVec,
    pub(crate) elected_replica_propagation_time: Histogram,
    pub(crate) kv_cas_calls: CounterVec,
    pub(crate) user_replica_group_count: GaugeVec,

    pub(crate) cleanup_runs: Counter,
    pub(crate) replicas_marked_for_deletion: Counter,
    pub(crate) deleted_replicas: Counter,
    pub(crate) cleanup_delete_failed: Counter,
}

impl TrackerMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let elected_replica_changes = CounterVec::new(
            Opts::new(
                "ha_tracker_elected_replica_changes_total",
                "The total number of times the elected replica has changed for a tenant/replica group.",
            ),
            &["tenant", "replica_group"],
        )?;
        let elected_replica_timestamp = GaugeVec::new(
            Opts::new(
                "ha_tracker_elected_replica_timestamp_seconds",
                "The timestamp stored for the currently elected replica, from the KV store.",
            ),
            &["tenant", "replica_group"],
        )?;
        let elected_replica_propagation_time = Histogram::with_opts(HistogramOpts::new(
            "ha_tracker_elected_replica_change_propagation_seconds",
            "The time it takes for a replica change to reach this process through the KV store watch.",
        ))?;
        let kv_cas_calls = CounterVec::new(
            Opts::new(
                "ha_tracker_kv_store_cas_total",
                "The total number of CAS calls to the KV store for a tenant/replica group.",
            ),
            &["tenant", "replica_group"],
        )?;
        let user_replica_group_count = GaugeVec::new(
            Opts::new(
                "ha_tracker_user_replica_group_count",
                "Number of HA replica groups tracked for each tenant.",
            ),
            &["tenant"],
        )?;

        let cleanup_runs = Counter::with_opts(Opts::new(
            "ha_tracker_replicas_cleanup_started_total",
            "Number of elected replicas cleanup loops started.",
        ))?;
        let replicas_marked_for_deletion = Counter::with_opts(Opts::new(
            "ha_tracker_replicas_cleanup_marked_for_deletion_total",
            "Number of elected replicas marked for deletion.",
        ))?;
        let deleted_replicas = Counter::with_opts(Opts::new(
            "ha_tracker_replicas_cleanup_deleted_total",
            "Number of elected replicas deleted from the KV store.",
        ))?;
        let cleanup_delete_failed = Counter::with_opts(Opts::new(
            "ha_tracker_replicas_cleanup_delete_failed_total",
            "Number of elected replicas that failed to be marked for deletion, or deleted.",
        ))?;

        registry.register(Box::new(elected_replica_changes.clone()))?;
        registry.register(Box::new(elected_replica_timestamp.clone()))?;
        registry.register(Box::new(elected_replica_propagation_time.clone()))?;
        registry.register(Box::new(kv_cas_calls.clone()))?;
        registry.register(Box::new(user_replica_group_count.clone()))?;
        registry.register(Box::new(cleanup_runs.clone()))?;
        registry.register(Box::new(replicas_marked_for_deletion.clone()))?;
        registry.register(Box::new(deleted_replicas.clone()))?;
        registry.register(Box::new(cleanup_delete_failed.clone()))?;

        Ok(Self {
            elected_replica_changes,
            elected_replica_timestamp,
            elected_replica_propagation_time,
            kv_cas_calls,
            user_replica_group_count,
            cleanup_runs,
            replicas_marked_for_deletion,
            deleted_replicas,
            cleanup_delete_failed,
        })
    }

    /// Remove every labelled series belonging to `tenant`, across all the
    /// per-tenant collectors. Matches against the series each collector
    /// currently holds, so groups that have long left the cache are
    /// removed too.
    pub(crate) fn delete_tenant_series(&self, tenant: &str) {
        delete_matching_labels(&self.elected_replica_changes, "tenant", tenant);
        delete_matching_labels(&self.elected_replica_timestamp, "tenant", tenant);
        delete_matching_labels(&self.kv_cas_calls, "tenant", tenant);
        delete_matching_labels(&self.user_replica_group_count, "tenant", tenant);
    }
}

/// Remove every series of `vec` whose `label` equals `value`.
fn delete_matching_labels<B: MetricVecBuilder>(vec: &MetricVec<B>, label: &str, value: &str) {
    for family in vec.collect() {
        for metric in family.get_metric() {
            let labels: HashMap<&str, &str> = metric
                .get_label()
                .iter()
                .map(|pair| (pair.get_name(), pair.get_value()))
                .collect();
            if labels.get(label) == Some(&value) {
                let _ = vec.remove(&labels);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_collectors_register_once() {
        let registry = Registry::new();
        let metrics = TrackerMetrics::new(&registry).unwrap();

        metrics.cleanup_runs.inc();
        metrics
            .kv_cas_calls
            .with_label_values(&["t1", "c1"])
            .inc();

        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "ha_tracker_replicas_cleanup_started_total"));
        assert!(families
            .iter()
            .any(|f| f.get_name() == "ha_tracker_kv_store_cas_total"));

        // Registering the same set twice must fail, not silently alias.
        assert!(TrackerMetrics::new(&registry).is_err());
    }

    #[test]
    fn test_delete_tenant_series_removes_every_series_for_tenant() {
        let registry = Registry::new();
        let metrics = TrackerMetrics::new(&registry).unwrap();

        metrics.kv_cas_calls.with_label_values(&["t1", "c1"]).inc();
        metrics.kv_cas_calls.with_label_values(&["t1", "c2"]).inc();
        metrics.kv_cas_calls.with_label_values(&["t2", "c1"]).inc();
        metrics
            .user_replica_group_count
            .with_label_values(&["t1"])
            .set(2.0);

        metrics.delete_tenant_series("t1");

        let families = registry.gather();
        let cas = families
            .iter()
            .find(|f| f.get_name() == "ha_tracker_kv_store_cas_total")
            .unwrap();
        assert_eq!(cas.get_metric().len(), 1);
        let tenant = cas.get_metric()[0]
            .get_label()
            .iter()
            .find(|pair| pair.get_name() == "tenant")
            .unwrap()
            .get_value();
        assert_eq!(tenant, "t2");

        // The group count gauge had only t1 series, so it is empty now.
        assert!(families
            .iter()
            .filter(|f| f.get_name() == "ha_tracker_user_replica_group_count")
            .all(|f| f.get_metric().is_empty()));
    }
}
