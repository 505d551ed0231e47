//! Per-query registration event streams.
//!
//! A watcher is born from `getKites` with a watch callback. The hub
//! opens a prefix watch on storage and translates changes into
//! `Register` / `Deregister` events pushed through the caller's
//! callback. TTL-refresh writes are skipped, version constraints are
//! applied, and `Register` events carry a freshly signed token whose
//! audience is the canonical path of the query. A dropped storage
//! stream is reopened at the last-seen index.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use semver::{Version, VersionReq};
use tokio_util::sync::CancellationToken;

use kite_protocol::{EventAction, KiteEvent, KiteQuery};

use crate::storage::{Storage, WatchAction, WatchEvent};
use crate::token::TokenSigner;

/// Delivers one event to the watching kite; an `Err` means the
/// session died and the watcher should be torn down.
pub type EventSink =
    Arc<dyn Fn(KiteEvent) -> futures_util::future::BoxFuture<'static, Result<(), String>> + Send + Sync>;

struct WatcherEntry {
    cancel: CancellationToken,
}

pub struct WatcherHub {
    storage: Arc<dyn Storage>,
    signer: Arc<TokenSigner>,
    watchers: Mutex<HashMap<String, WatcherEntry>>,
}

impl WatcherHub {
    pub fn new(storage: Arc<dyn Storage>, signer: Arc<TokenSigner>) -> Self {
        Self {
            storage,
            signer,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Open a watcher for `query` on behalf of `subject` and return
    /// its id.
    pub async fn add(self: &Arc<Self>, query: KiteQuery, subject: String, sink: EventSink) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        self.watchers.lock().insert(
            id.clone(),
            WatcherEntry {
                cancel: cancel.clone(),
            },
        );

        let constraint = query.version_constraint();
        // A constrained query watches the wider name prefix and
        // filters here.
        let prefix = match constraint {
            Some(_) => query.up_to_name().canonical_path(),
            None => query.canonical_path(),
        };
        let audience = query.canonical_path();
        let mut last_index = self.storage.index().await;

        let hub = self.clone();
        let watcher_id = id.clone();
        tokio::spawn(async move {
            'reopen: loop {
                let mut stream = match hub.storage.watch(&prefix, last_index).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!(prefix = %prefix, error = %e, "storage watch failed");
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(1)) => continue 'reopen,
                            _ = cancel.cancelled() => break 'reopen,
                        }
                    }
                };
                loop {
                    let event = tokio::select! {
                        event = stream.recv() => event,
                        _ = cancel.cancelled() => break 'reopen,
                    };
                    let Some(event) = event else {
                        // Buffer overflow on the storage side; pick up
                        // where we left off.
                        tracing::debug!(prefix = %prefix, last_index, "watch dropped, reopening");
                        continue 'reopen;
                    };
                    last_index = event.index;
                    let Some(kite_event) = hub.translate(event, &constraint, &audience, &subject)
                    else {
                        continue;
                    };
                    if let Err(e) = sink(kite_event).await {
                        tracing::debug!(watcher = %watcher_id, error = %e, "event sink failed, cancelling watcher");
                        break 'reopen;
                    }
                }
            }
            hub.watchers.lock().remove(&watcher_id);
        });

        id
    }

    fn translate(
        &self,
        event: WatchEvent,
        constraint: &Option<VersionReq>,
        audience: &str,
        subject: &str,
    ) -> Option<KiteEvent> {
        match event.action {
            // TTL refreshes and re-registrations are not arrivals.
            WatchAction::Set { refresh: true } => None,
            WatchAction::Set { refresh: false } => {
                let record = event.record?;
                if let Some(req) = constraint {
                    let version = Version::parse(&record.kite.version).ok()?;
                    if !req.matches(&version) {
                        return None;
                    }
                }
                let token = match self.signer.sign_token(audience, subject) {
                    Ok(token) => token,
                    Err(e) => {
                        tracing::error!(error = %e, "token signing for watcher event failed");
                        return None;
                    }
                };
                Some(KiteEvent {
                    action: EventAction::Register,
                    kite: record.kite,
                    url: Some(record.url),
                    token: Some(token),
                })
            }
            WatchAction::Delete | WatchAction::Expire => {
                let record = event.record?;
                Some(KiteEvent {
                    action: EventAction::Deregister,
                    kite: record.kite,
                    url: None,
                    token: None,
                })
            }
        }
    }

    /// Tear a watcher down; unknown ids are a no-op.
    pub fn cancel(&self, id: &str) -> bool {
        match self.watchers.lock().remove(id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.watchers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::{KeyPair, KeyPairs};
    use crate::memstore::MemoryStorage;
    use crate::storage::KiteRecord;
    use kite_protocol::Kite;
    use tokio::sync::mpsc;

    const PRIVATE: &str =
        include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/keys/kontrol.pem"));
    const PUBLIC: &str = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/keys/kontrol.pub.pem"
    ));

    fn hub() -> (Arc<MemoryStorage>, Arc<WatcherHub>) {
        let storage = Arc::new(MemoryStorage::new());
        let signer = Arc::new(TokenSigner::new(
            "kontrol".into(),
            KeyPairs::new(KeyPair::new(PUBLIC.into(), PRIVATE.into()).unwrap()),
        ));
        (storage.clone(), Arc::new(WatcherHub::new(storage, signer)))
    }

    fn record(name: &str, version: &str) -> KiteRecord {
        KiteRecord {
            kite: Kite {
                username: "u".into(),
                environment: "e".into(),
                name: name.into(),
                version: version.into(),
                region: "r".into(),
                hostname: "h".into(),
                id: format!("{name}-{version}"),
            },
            url: format!("http://127.0.0.1:7777/{name}"),
            key_id: "kp".into(),
        }
    }

    fn channel_sink() -> (EventSink, mpsc::UnboundedReceiver<KiteEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink: EventSink = Arc::new(move |event| {
            let tx = tx.clone();
            Box::pin(async move { tx.send(event).map_err(|e| e.to_string()) })
        });
        (sink, rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<KiteEvent>) -> KiteEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event timeout")
            .expect("stream closed")
    }

    #[tokio::test]
    async fn register_and_deregister_events_flow() {
        let (storage, hub) = hub();
        let (sink, mut rx) = channel_sink();
        let query = KiteQuery {
            username: "u".into(),
            ..Default::default()
        };
        hub.add(query, "watcher-user".into(), sink).await;

        storage.add(&record("math", "1.0.0")).await.unwrap();
        let event = recv(&mut rx).await;
        assert_eq!(event.action, EventAction::Register);
        assert_eq!(event.kite.name, "math");
        assert!(event.token.is_some());
        assert!(event.url.is_some());

        // A TTL refresh is not an arrival.
        storage.update(&record("math", "1.0.0")).await.unwrap();
        storage.delete(&record("math", "1.0.0").kite).await.unwrap();
        let event = recv(&mut rx).await;
        assert_eq!(event.action, EventAction::Deregister);
        assert!(event.token.is_none());
    }

    #[tokio::test]
    async fn version_constraint_filters_events() {
        let (storage, hub) = hub();
        let (sink, mut rx) = channel_sink();
        let query = KiteQuery {
            username: "u".into(),
            environment: "e".into(),
            name: "math".into(),
            version: ">=0.2.0, <1.0.0".into(),
            ..Default::default()
        };
        hub.add(query, "watcher-user".into(), sink).await;

        storage.add(&record("math", "0.1.0")).await.unwrap();
        storage.add(&record("math", "0.2.0")).await.unwrap();
        storage.add(&record("math", "1.0.0")).await.unwrap();

        let event = recv(&mut rx).await;
        assert_eq!(event.kite.version, "0.2.0");
        // Nothing else came through.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_stops_events() {
        let (storage, hub) = hub();
        let (sink, mut rx) = channel_sink();
        let query = KiteQuery {
            username: "u".into(),
            ..Default::default()
        };
        let id = hub.add(query, "watcher-user".into(), sink).await;
        assert_eq!(hub.len(), 1);

        assert!(hub.cancel(&id));
        assert!(!hub.cancel(&id));
        tokio::time::sleep(Duration::from_millis(50)).await;

        storage.add(&record("math", "1.0.0")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert!(hub.is_empty());
    }
}
