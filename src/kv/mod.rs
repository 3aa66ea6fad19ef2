//! KV store access for the tracker.
//!
//! The tracker only needs a narrow slice of a replicated store: `Get`,
//! `List`, `Delete`, compare-and-swap, and prefix watches. [`KvStore`] is
//! that slice over raw bytes; backends (consul, etcd, or the in-memory
//! store used in tests) implement it and are injected by the embedding
//! process. [`Client`] layers the replica descriptor codec and the
//! tracker's key prefix on top, so the rest of the crate works with typed
//! values and unprefixed `tenant/replicaGroup` keys.

pub mod codec;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use crate::error::Result;
use codec::ReplicaDesc;

const WATCH_CHANNEL_CAPACITY: usize = 128;

/// A single change observed by a prefix watch. `value` is `None` when the
/// key was deleted outright.
#[derive(Debug, Clone)]
pub struct KvEvent {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

/// Mutator passed to [`KvStore::compare_and_swap`]. Receives the current
/// value (or `None` when the key is absent) and returns the new value to
/// persist atomically, `None` for "no change needed", or an error to abort.
pub type CasMutator<'a> = &'a mut (dyn FnMut(Option<&[u8]>) -> Result<Option<Vec<u8>>> + Send);

/// Minimal interface over a replicated, CAS-capable store.
///
/// Implementations must be safe for concurrent use. `compare_and_swap`
/// re-invokes the mutator under contention until it either commits or the
/// mutator asks for no change; per-key ordering of watch events is
/// preserved, ordering across keys is unspecified.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// List all keys under `prefix`, including the prefix in each key.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn compare_and_swap(&self, key: &str, mutator: CasMutator<'_>) -> Result<()>;

    /// Subscribe to every change under `prefix`. The channel closes when
    /// the watch terminates; callers decide whether to re-subscribe.
    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<KvEvent>>;
}

/// Decoded watch notification handed to the tracker. Deletions arrive as
/// descriptors with `deleted_at > 0`; explicit store deletions are
/// synthesized into tombstones by the client.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub key: String,
    pub desc: ReplicaDesc,
}

/// Typed, prefixed view of a [`KvStore`]. All keys passed in and handed
/// out are relative to the configured prefix.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn KvStore>,
    prefix: String,
}

impl Client {
    pub fn new(store: Arc<dyn KvStore>, prefix: String) -> Self {
        Self { store, prefix }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub async fn get(&self, key: &str) -> Result<Option<ReplicaDesc>> {
        match self.store.get(&self.full_key(key)).await? {
            Some(bytes) => Ok(Some(ReplicaDesc::decode_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List all keys owned by the tracker, relative to the prefix.
    pub async fn list(&self) -> Result<Vec<String>> {
        let keys = self.store.list(&self.prefix).await?;
        Ok(keys
            .into_iter()
            .map(|k| k.strip_prefix(&self.prefix).map(str::to_string).unwrap_or(k))
            .collect())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.store.delete(&self.full_key(key)).await
    }

    /// Compare-and-swap on the decoded descriptor. The mutator receives
    /// the stored descriptor (or `None`), and returns the descriptor to
    /// persist, `None` for no change, or an error to abort the operation.
    pub async fn cas<F>(&self, key: &str, mut mutator: F) -> Result<()>
    where
        F: FnMut(Option<ReplicaDesc>) -> Result<Option<ReplicaDesc>> + Send,
    {
        let mut raw = |current: Option<&[u8]>| -> Result<Option<Vec<u8>>> {
            let decoded = match current {
                Some(bytes) => Some(ReplicaDesc::decode_bytes(bytes)?),
                None => None,
            };
            Ok(mutator(decoded)?.map(|desc| desc.encode_bytes()))
        };
        self.store.compare_and_swap(&self.full_key(key), &mut raw).await
    }

    /// Watch every key under the tracker's prefix, decoding values and
    /// synthesizing tombstones for explicit deletions. Undecodable values
    /// are logged and skipped. The returned channel closes when the
    /// underlying watch terminates.
    pub async fn watch_prefix(&self) -> Result<mpsc::Receiver<WatchEvent>> {
        let mut raw = self.store.watch_prefix(&self.prefix).await?;
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let prefix = self.prefix.clone();

        tokio::spawn(async move {
            while let Some(event) = raw.recv().await {
                let key = event
                    .key
                    .strip_prefix(&prefix)
                    .map(str::to_string)
                    .unwrap_or(event.key);

                let desc = match event.value {
                    Some(bytes) => match ReplicaDesc::decode_bytes(&bytes) {
                        Ok(desc) => desc,
                        Err(e) => {
                            tracing::warn!(key = %key, error = %e, "Ignoring undecodable value from watch");
                            continue;
                        }
                    },
                    None => ReplicaDesc {
                        replica: String::new(),
                        received_at: 0,
                        deleted_at: Utc::now().timestamp_millis(),
                    },
                };

                if tx.send(WatchEvent { key, desc }).await.is_err() {
                    // Receiver dropped, stop forwarding
                    break;
                }
            }
        });

        Ok(rx)
    }
}
