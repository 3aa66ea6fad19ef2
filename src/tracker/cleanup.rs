//! Garbage collection of old elections.
//!
//! Deletion is two-phase so peers can observe it: a stale entry is first
//! tombstoned through CAS (`deleted_at = now`), which reaches every
//! front-end via the prefix watch; once the tombstone itself has aged past
//! the deletion timeout the key is removed from the store outright.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::ReplicaTracker;

const CLEANUP_CYCLE_PERIOD: Duration = Duration::from_secs(30 * 60);
// For 30 minutes, this is +/- 6 min.
const CLEANUP_CYCLE_JITTER_VARIANCE: f64 = 0.2;

/// If we have received the last sample for a given replica group before
/// this timeout, the elected replica is marked for deletion. Once marked
/// for this long, it is deleted completely.
const DELETION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Apply +/- `variance` of random jitter to a duration, to keep the sweeps
/// of independent front-ends from lining up.
fn duration_with_jitter(duration: Duration, variance: f64) -> Duration {
    let max_jitter_ms = (duration.as_millis() as f64 * variance) as i64;
    if max_jitter_ms <= 0 {
        return duration;
    }
    let jitter_ms = rand::thread_rng().gen_range(-max_jitter_ms..=max_jitter_ms);
    Duration::from_millis((duration.as_millis() as i64 + jitter_ms) as u64)
}

impl ReplicaTracker {
    pub(crate) async fn cleanup_loop(&self, cancel: CancellationToken) {
        let period = duration_with_jitter(CLEANUP_CYCLE_PERIOD, CLEANUP_CYCLE_JITTER_VARIANCE);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(period) => {
                    self.metrics.cleanup_runs.inc();
                    let deadline = Utc::now() - chrono::Duration::seconds(DELETION_TIMEOUT.as_secs() as i64);
                    self.cleanup_old_replicas(deadline, &cancel).await;
                }
            }
        }
    }

    /// One sweep over every key the tracker owns. Replicas marked for
    /// deletion before `deadline` are deleted; live replicas whose last
    /// sample predates `deadline` are marked for deletion.
    pub(crate) async fn cleanup_old_replicas(
        &self,
        deadline: DateTime<Utc>,
        cancel: &CancellationToken,
    ) {
        let keys = match self.client.list().await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "Cleanup: failed to list replica keys");
                return;
            }
        };
        let deadline_ms = deadline.timestamp_millis();

        for key in keys {
            if cancel.is_cancelled() {
                return;
            }

            let desc = match self.client.get(&key).await {
                Ok(Some(desc)) => desc,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Cleanup: failed to get replica value");
                    continue;
                }
            };

            if desc.deleted_at > 0 {
                if desc.deleted_at > deadline_ms {
                    continue;
                }

                // This is deliberately not a CAS: a racing write since our
                // Get above is deleted along with the tombstone. Peers drop
                // the key on the watch notification and the admission path
                // re-creates it on the next matching sample.
                match self.client.delete(&key).await {
                    Ok(()) => {
                        tracing::info!(key = %key, "Cleanup: deleted old replica");
                        self.metrics.deleted_replicas.inc();
                    }
                    Err(e) => {
                        tracing::error!(key = %key, error = %e, "Cleanup: failed to delete old replica");
                        self.metrics.cleanup_delete_failed.inc();
                    }
                }
                continue;
            }

            // Not marked as deleted yet.
            if desc.received_at < deadline_ms {
                let result = self
                    .client
                    .cas(&key, |stored| match stored {
                        Some(mut current)
                            if current.deleted_at == 0 && current.received_at < deadline_ms =>
                        {
                            current.deleted_at = Utc::now().timestamp_millis();
                            Ok(Some(current))
                        }
                        _ => Ok(None),
                    })
                    .await;

                match result {
                    Ok(()) => {
                        tracing::info!(key = %key, "Cleanup: marked replica as deleted");
                        self.metrics.replicas_marked_for_deletion.inc();
                    }
                    Err(e) => {
                        tracing::error!(key = %key, error = %e, "Cleanup: failed to mark replica as deleted");
                        self.metrics.cleanup_delete_failed.inc();
                    }
                }
            }
        }
    }
}
