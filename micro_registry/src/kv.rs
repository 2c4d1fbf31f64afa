use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{RegistryError, Result};

const WATCH_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KvEventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KvEvent {
    pub kind: KvEventKind,
    pub key: String,
    /// Empty for deletes.
    pub value: Vec<u8>,
    pub prev_value: Option<Vec<u8>>,
}

/// The hierarchical key-value backend a [`KvRegistry`](crate::KvRegistry) persists to.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;
    /// Extends the lease of `key`. Returns `false` when the key is gone.
    async fn keep_alive(&self, key: &str, ttl: Duration) -> Result<bool>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn watch_prefix(&self, prefix: &str) -> Result<Box<dyn KvWatch>>;
}

#[async_trait]
pub trait KvWatch: Send {
    async fn next(&mut self) -> Result<KvEvent>;
    fn stop(&self);
}

struct Entry {
    value: Vec<u8>,
    expires: Option<Instant>,
}

/// In-process [`KvStore`] with lease expiry and broadcast watches. Expired
/// keys are swept on every access and reported to watchers as deletes.
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Entry>>,
    events: broadcast::Sender<KvEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        MemoryStore {
            entries: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    /// Removes expired keys, notifying watchers.
    pub async fn sweep(&self) {
        let mut entries = self.entries.lock().await;
        self.sweep_locked(&mut entries);
    }

    /// Runs [`sweep`](Self::sweep) every `period` until the returned token is cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => store.sweep().await,
                }
            }
        });
        cancel
    }

    pub async fn len(&self) -> usize {
        let mut entries = self.entries.lock().await;
        self.sweep_locked(&mut entries);
        entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn sweep_locked(&self, entries: &mut BTreeMap<String, Entry>) {
        let now = Instant::now();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.expires.map_or(false, |at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(entry) = entries.remove(&key) {
                debug!(key = %key, "lease expired");
                self.notify(KvEvent {
                    kind: KvEventKind::Delete,
                    key,
                    value: Vec::new(),
                    prev_value: Some(entry.value),
                });
            }
        }
    }

    fn notify(&self, event: KvEvent) {
        // no receivers is not an error
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let mut entries = self.entries.lock().await;
        self.sweep_locked(&mut entries);
        Ok(entries
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
            })
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.lock().await;
        self.sweep_locked(&mut entries);
        let entry = Entry {
            value: value.clone(),
            expires: ttl.map(|ttl| Instant::now() + ttl),
        };
        let prev = entries.insert(key.to_owned(), entry);
        self.notify(KvEvent {
            kind: KvEventKind::Put,
            key: key.to_owned(),
            value,
            prev_value: prev.map(|e| e.value),
        });
        Ok(())
    }

    async fn keep_alive(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        self.sweep_locked(&mut entries);
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        self.sweep_locked(&mut entries);
        if let Some(entry) = entries.remove(key) {
            self.notify(KvEvent {
                kind: KvEventKind::Delete,
                key: key.to_owned(),
                value: Vec::new(),
                prev_value: Some(entry.value),
            });
        }
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<Box<dyn KvWatch>> {
        Ok(Box::new(MemoryWatch {
            prefix: prefix.to_owned(),
            events: self.events.subscribe(),
            stop: CancellationToken::new(),
        }))
    }
}

struct MemoryWatch {
    prefix: String,
    events: broadcast::Receiver<KvEvent>,
    stop: CancellationToken,
}

#[async_trait]
impl KvWatch for MemoryWatch {
    async fn next(&mut self) -> Result<KvEvent> {
        loop {
            let event = tokio::select! {
                _ = self.stop.cancelled() => return Err(RegistryError::WatcherStopped),
                event = self.events.recv() => event,
            };
            match event {
                Ok(event) if event.key.starts_with(&self.prefix) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(RegistryError::Transport(format!(
                        "watch fell behind by {} events",
                        n
                    )))
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(RegistryError::WatcherStopped)
                }
            }
        }
    }

    fn stop(&self) {
        self.stop.cancel();
    }
}
