//! In-memory storage with native TTL expiry and index-stamped watch
//! streams.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
// tokio's Instant so the paused test clock drives expiry too.
use tokio::time::Instant;

use kite_protocol::{Kite, KiteQuery, KEY_TTL};

use crate::storage::{KiteRecord, Storage, StorageError, WatchAction, WatchEvent};

/// How many past events are kept for watch replay.
const HISTORY_LIMIT: usize = 1024;

/// Watch channel capacity; a consumer this far behind is dropped and
/// must reopen from its last index.
const WATCH_BUFFER: usize = 64;

struct Stored {
    record: KiteRecord,
    expires_at: Instant,
}

struct Subscriber {
    prefix: String,
    tx: mpsc::Sender<WatchEvent>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, Stored>,
    index: u64,
    history: VecDeque<WatchEvent>,
    subscribers: Vec<Subscriber>,
}

impl Inner {
    fn publish(&mut self, action: WatchAction, key: String, record: Option<KiteRecord>) {
        self.index += 1;
        let event = WatchEvent {
            action,
            key,
            record,
            index: self.index,
        };
        self.history.push_back(event.clone());
        if self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
        // Slow subscribers lose their stream instead of blocking the
        // store.
        self.subscribers.retain(|sub| {
            if !event.key.starts_with(&sub.prefix) {
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(prefix = %sub.prefix, "watch stream overflowed, dropping");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// The in-memory store.
pub struct MemoryStorage {
    inner: Arc<Mutex<Inner>>,
    ttl: Duration,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_ttl(KEY_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        let storage = Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            ttl,
        };
        storage.spawn_expiry_sweeper();
        storage
    }

    fn spawn_expiry_sweeper(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = self.inner.clone();
        let period = (self.ttl / 10).max(Duration::from_millis(100));
        handle.spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                let mut guard = inner.lock();
                let now = Instant::now();
                let expired: Vec<String> = guard
                    .records
                    .iter()
                    .filter(|(_, stored)| stored.expires_at <= now)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in expired {
                    if let Some(stored) = guard.records.remove(&key) {
                        tracing::debug!(key = %key, "record expired");
                        guard.publish(WatchAction::Expire, key, Some(stored.record));
                    }
                }
                // The store outlives every handle through the spawned
                // sweeper; stop when nothing else references it.
                if Arc::strong_count(&inner) == 1 {
                    return;
                }
            }
        });
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn add(&self, record: &KiteRecord) -> Result<(), StorageError> {
        let key = record.kite.key();
        let mut inner = self.inner.lock();
        let refresh = inner
            .records
            .insert(
                key.clone(),
                Stored {
                    record: record.clone(),
                    expires_at: Instant::now() + self.ttl,
                },
            )
            .is_some();
        inner.publish(WatchAction::Set { refresh }, key, Some(record.clone()));
        Ok(())
    }

    async fn update(&self, record: &KiteRecord) -> Result<(), StorageError> {
        let key = record.kite.key();
        let mut inner = self.inner.lock();
        match inner.records.get_mut(&key) {
            Some(stored) => {
                stored.expires_at = Instant::now() + self.ttl;
            }
            None => return Err(StorageError::NotFound),
        }
        // TTL refreshes surface as refresh writes, like an etcd update
        // with prevExist.
        inner.publish(WatchAction::Set { refresh: true }, key, Some(record.clone()));
        Ok(())
    }

    async fn delete(&self, kite: &Kite) -> Result<(), StorageError> {
        let key = kite.key();
        let mut inner = self.inner.lock();
        match inner.records.remove(&key) {
            Some(stored) => {
                inner.publish(WatchAction::Delete, key, Some(stored.record));
                Ok(())
            }
            None => Err(StorageError::NotFound),
        }
    }

    async fn get(&self, query: &KiteQuery) -> Result<Vec<KiteRecord>, StorageError> {
        let inner = self.inner.lock();
        Ok(inner
            .records
            .values()
            .filter(|stored| query.matches(&stored.record.kite))
            .map(|stored| stored.record.clone())
            .collect())
    }

    async fn watch(
        &self,
        prefix: &str,
        from_index: u64,
    ) -> Result<mpsc::Receiver<WatchEvent>, StorageError> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let mut inner = self.inner.lock();
        for event in inner.history.iter() {
            if event.index > from_index && event.key.starts_with(prefix) {
                tx.try_send(event.clone())
                    .map_err(|_| StorageError::Backend("watch replay overflow".into()))?;
            }
        }
        inner.subscribers.push(Subscriber {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn index(&self) -> u64 {
        self.inner.lock().index
    }
}
