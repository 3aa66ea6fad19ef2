//! In-memory [`KvStore`] with CAS and watch support.
//!
//! Backs the test suites and local development. A single lock serializes
//! mutations, which gives the same per-key linearizability a replicated
//! backend provides through its CAS primitive.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::error::Result;
use crate::kv::{CasMutator, KvEvent, KvStore};

const EVENT_CHANNEL_CAPACITY: usize = 128;

pub struct MemoryStore {
    data: Mutex<HashMap<String, Vec<u8>>>,
    events: broadcast::Sender<KvEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            data: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Store a value directly, bypassing CAS. Emits a watch event like any
    /// other mutation.
    pub async fn put(&self, key: &str, value: Vec<u8>) {
        let mut data = self.data.lock().await;
        data.insert(key.to_string(), value.clone());
        drop(data);

        self.notify(key, Some(value));
    }

    fn notify(&self, key: &str, value: Option<Vec<u8>>) {
        // Send fails when nobody is watching, which is fine.
        let _ = self.events.send(KvEvent {
            key: key.to_string(),
            value,
        });
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let data = self.data.lock().await;
        Ok(data.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let data = self.data.lock().await;
        let mut keys: Vec<String> = data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        let removed = data.remove(key).is_some();
        drop(data);

        if removed {
            self.notify(key, None);
        }
        Ok(())
    }

    async fn compare_and_swap(&self, key: &str, mutator: CasMutator<'_>) -> Result<()> {
        let mut data = self.data.lock().await;
        let current = data.get(key).cloned();
        let out = mutator(current.as_deref())?;

        if let Some(value) = out {
            data.insert(key.to_string(), value.clone());
            drop(data);
            self.notify(key, Some(value));
        }
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<KvEvent>> {
        let mut events = self.events.subscribe();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if !event.key.starts_with(&prefix) {
                            continue;
                        }
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Watch fell behind, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}
