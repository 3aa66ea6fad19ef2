use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

use crate::kv::codec::ReplicaDesc;

/// In-memory mirror of the elections stored in the KV store.
///
/// `elected` maps the full `tenant/replicaGroup` key to the latest
/// descriptor; `replica_groups` tracks the set of group names known per
/// tenant. Both maps move together under one lock: the watch consumer is
/// the only writer, the admission fast path and status readers copy
/// values out before releasing the read lock.
pub(crate) struct ElectionCache {
    inner: RwLock<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    elected: HashMap<String, ReplicaDesc>,
    replica_groups: HashMap<String, HashSet<String>>,
}

impl ElectionCache {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
        }
    }

    /// Fast-path read for the admission check: the cached entry for `key`
    /// (if any) and the number of groups currently known for `tenant`,
    /// taken under a single lock acquisition.
    pub(crate) async fn entry_and_group_count(
        &self,
        key: &str,
        tenant: &str,
    ) -> (Option<ReplicaDesc>, usize) {
        let inner = self.inner.read().await;
        let entry = inner.elected.get(key).cloned();
        let groups = inner.replica_groups.get(tenant).map_or(0, HashSet::len);
        (entry, groups)
    }

    /// Install a live descriptor observed from the watch channel. Returns
    /// true when the elected replica differs from the cached one (a fresh
    /// key counts as a change from "nothing elected").
    pub(crate) async fn apply(
        &self,
        key: &str,
        tenant: &str,
        replica_group: &str,
        desc: ReplicaDesc,
    ) -> bool {
        let mut inner = self.inner.write().await;

        let changed = match inner.elected.get(key) {
            Some(previous) => previous.replica != desc.replica,
            None => {
                inner
                    .replica_groups
                    .entry(tenant.to_string())
                    .or_default()
                    .insert(replica_group.to_string());
                true
            }
        };

        inner.elected.insert(key.to_string(), desc);
        changed
    }

    /// Drop a key after a tombstone notification. The tenant disappears
    /// from `replica_groups` once its last group is gone.
    pub(crate) async fn remove(&self, key: &str, tenant: &str, replica_group: &str) {
        let mut inner = self.inner.write().await;
        inner.elected.remove(key);

        if let Some(groups) = inner.replica_groups.get_mut(tenant) {
            groups.remove(replica_group);
            if groups.is_empty() {
                inner.replica_groups.remove(tenant);
            }
        }
    }

    /// Value-copy of the current elections, for status consumers.
    pub(crate) async fn snapshot(&self) -> HashMap<String, ReplicaDesc> {
        let inner = self.inner.read().await;
        inner.elected.clone()
    }

    /// Current group count per tenant, for the gauge refresher.
    pub(crate) async fn group_counts(&self) -> Vec<(String, usize)> {
        let inner = self.inner.read().await;
        inner
            .replica_groups
            .iter()
            .map(|(tenant, groups)| (tenant.clone(), groups.len()))
            .collect()
    }
}
