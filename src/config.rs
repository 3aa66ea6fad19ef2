use std::time::Duration;

use crate::error::{Result, TrackerError};

/// KV store backends the tracker may run against. Gossip-based stores
/// (e.g. memberlist) are rejected because their propagation latency is
/// incompatible with heartbeat timeouts.
const ALLOWED_KV_STORES: &[&str] = &["consul", "etcd"];

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub enable_ha_tracker: bool,
    /// We should only update the timestamp in the KV store if the difference
    /// between the stored timestamp and the time we received a sample at
    /// is more than this duration.
    pub update_timeout: Duration,
    /// Maximum jitter applied to the update timeout, in order to spread the
    /// HA heartbeats of independent front-ends over time.
    pub update_timeout_jitter_max: Duration,
    /// We should only failover to accepting samples from a replica other
    /// than the one written in the KV store if the difference between the
    /// stored timestamp and the time we received a sample is more than
    /// this duration.
    pub failover_timeout: Duration,
    pub kvstore: KvStoreConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enable_ha_tracker: false,
            update_timeout: Duration::from_secs(15),
            update_timeout_jitter_max: Duration::from_secs(5),
            failover_timeout: Duration::from_secs(30),
            kvstore: KvStoreConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KvStoreConfig {
    /// Backend to use, one of "consul" or "etcd". There is no default;
    /// a backend must be chosen explicitly.
    pub store: String,
    /// Key prefix the tracker owns within the store. Kept separate from
    /// other users of the same store (e.g. a ring) so the key spaces
    /// cannot clash.
    pub prefix: String,
}

impl Default for KvStoreConfig {
    fn default() -> Self {
        Self {
            store: String::new(),
            prefix: "ha-tracker/".to_string(),
        }
    }
}

impl TrackerConfig {
    /// Validate the config. The tracker refuses to start on failure.
    pub fn validate(&self) -> Result<()> {
        let min_failover_timeout = self.update_timeout + self.update_timeout_jitter_max
            + Duration::from_secs(1);
        if self.failover_timeout < min_failover_timeout {
            return Err(TrackerError::InvalidConfig(format!(
                "failover timeout ({:?}) must be at least 1s greater than update timeout + max jitter ({:?})",
                self.failover_timeout, min_failover_timeout,
            )));
        }

        if !ALLOWED_KV_STORES.contains(&self.kvstore.store.as_str()) {
            return Err(TrackerError::InvalidConfig(format!(
                "invalid KV store type: {:?}",
                self.kvstore.store,
            )));
        }

        Ok(())
    }
}
