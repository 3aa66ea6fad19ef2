/// Per-tenant limits consumed by the tracker.
pub trait TrackerLimits: Send + Sync {
    /// Maximum number of replica groups the tracker should track for a
    /// tenant. Samples from additional groups are rejected. Zero means
    /// unlimited.
    fn max_ha_replica_groups(&self, tenant: &str) -> usize;
}

/// Limits implementation that applies no caps. Useful for embedders that
/// do not enforce per-tenant limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLimits;

impl TrackerLimits for NoLimits {
    fn max_ha_replica_groups(&self, _tenant: &str) -> usize {
        0
    }
}
