//! Server-side heartbeat tracking.
//!
//! Every registered kite gets an updater task: each beat refreshes the
//! storage TTL and re-arms a `interval + delay` window; a kite silent
//! past the window is deregistered. Beats for unknown ids answer
//! `registeragain`, which is how kites recover after a kontrol
//! restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use kite_protocol::{HEARTBEAT_DELAY, HEARTBEAT_INTERVAL};

use crate::storage::{KiteRecord, Storage};

/// Answer to one heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeatOutcome {
    Pong,
    RegisterAgain,
}

impl BeatOutcome {
    /// The literal body the HTTP endpoint returns.
    pub fn as_body(&self) -> &'static str {
        match self {
            BeatOutcome::Pong => "pong",
            BeatOutcome::RegisterAgain => "registeragain",
        }
    }
}

struct Entry {
    record: KiteRecord,
    reset_tx: mpsc::Sender<()>,
}

pub struct HeartbeatTracker {
    storage: Arc<dyn Storage>,
    window: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl HeartbeatTracker {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_window(storage, HEARTBEAT_INTERVAL + HEARTBEAT_DELAY)
    }

    pub fn with_window(storage: Arc<dyn Storage>, window: Duration) -> Self {
        Self {
            storage,
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or restart) the updater for a freshly registered kite.
    pub fn track(self: &Arc<Self>, record: KiteRecord) {
        let id = record.kite.id.clone();
        let (reset_tx, mut reset_rx) = mpsc::channel::<()>(4);
        self.entries.lock().insert(
            id.clone(),
            Entry {
                record: record.clone(),
                reset_tx,
            },
        );

        let tracker = self.clone();
        let window = self.window;
        tokio::spawn(async move {
            loop {
                match tokio::time::timeout(window, reset_rx.recv()).await {
                    Ok(Some(())) => continue,
                    // A replacement updater took over.
                    Ok(None) => return,
                    Err(_elapsed) => break,
                }
            }
            tracing::info!(kite = %record.kite.key(), "heartbeats stopped, deregistering");
            tracker.entries.lock().remove(&id);
            if let Err(e) = tracker.storage.delete(&record.kite).await {
                tracing::debug!(kite = %record.kite.key(), error = %e, "deregistration delete failed");
            }
        });
    }

    /// Process one heartbeat for the kite with this id.
    pub async fn beat(&self, id: &str) -> BeatOutcome {
        let entry = {
            let entries = self.entries.lock();
            match entries.get(id) {
                Some(entry) => (entry.record.clone(), entry.reset_tx.clone()),
                None => return BeatOutcome::RegisterAgain,
            }
        };
        let (record, reset_tx) = entry;
        let _ = reset_tx.try_send(());
        match self.storage.update(&record).await {
            Ok(()) => BeatOutcome::Pong,
            Err(_) => {
                // The record fell out of storage; a fresh registration
                // is the only fix.
                BeatOutcome::RegisterAgain
            }
        }
    }

    pub fn tracked(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memstore::MemoryStorage;
    use kite_protocol::{Kite, KiteQuery};

    fn record() -> KiteRecord {
        KiteRecord {
            kite: Kite {
                username: "u".into(),
                environment: "e".into(),
                name: "math".into(),
                version: "1.0.0".into(),
                region: "r".into(),
                hostname: "h".into(),
                id: "kite-1".into(),
            },
            url: "http://127.0.0.1:7777/kite".into(),
            key_id: "kp".into(),
        }
    }

    fn query() -> KiteQuery {
        KiteQuery {
            username: "u".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn beats_keep_the_record_alive() {
        let storage = Arc::new(MemoryStorage::new());
        let tracker = Arc::new(HeartbeatTracker::with_window(
            storage.clone(),
            Duration::from_millis(100),
        ));
        storage.add(&record()).await.unwrap();
        tracker.track(record());

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(tracker.beat("kite-1").await, BeatOutcome::Pong);
        }
        assert_eq!(storage.get(&query()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn silence_deregisters() {
        let storage = Arc::new(MemoryStorage::new());
        let tracker = Arc::new(HeartbeatTracker::with_window(
            storage.clone(),
            Duration::from_millis(50),
        ));
        storage.add(&record()).await.unwrap();
        tracker.track(record());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(storage.get(&query()).await.unwrap().is_empty());
        assert_eq!(tracker.tracked(), 0);
        assert_eq!(tracker.beat("kite-1").await, BeatOutcome::RegisterAgain);
    }

    #[tokio::test]
    async fn unknown_ids_register_again() {
        let storage = Arc::new(MemoryStorage::new());
        let tracker = Arc::new(HeartbeatTracker::new(storage));
        assert_eq!(tracker.beat("ghost").await, BeatOutcome::RegisterAgain);
    }
}
