//! Client side of the kontrol registry: registration, discovery,
//! tokens, and watchers.
//!
//! The session to kontrol dials forever and reconnects; watchers are
//! re-subscribed after every reconnect (their callback ids die with
//! the session), and a previously registered URL is re-submitted to
//! the registration loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use kite_protocol::{
    Authentication, GetKitesArgs, GetKitesResult, KiteEvent, KiteQuery, KiteWithToken,
    RegisterArgs, RegisterResult,
};

use crate::client::{Client, RemoteFunction};
use crate::error::KiteError;
use crate::renewer::spawn_renewer;
use crate::runtime::KiteCore;

/// Default timeout for kontrol RPC calls.
const KONTROL_TELL_TIMEOUT: Duration = Duration::from_secs(4);

/// How long a lazily-dialed RPC waits for the first connection.
const KONTROL_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Receives registration change events for a watched query.
pub type EventHandler = Arc<dyn Fn(KiteEvent) + Send + Sync>;

pub(crate) struct Watcher {
    query: KiteQuery,
    handler: EventHandler,
    /// Remote watcher id; refreshed on every (re)subscription.
    id: Mutex<String>,
}

struct KontrolInner {
    core: Arc<KiteCore>,
    client: Client,
    watchers: Mutex<Vec<Arc<Watcher>>>,
    dialed: AtomicBool,
}

/// Handle to the kontrol service. Cheap to clone.
#[derive(Clone)]
pub struct KontrolClient {
    inner: Arc<KontrolInner>,
}

impl KontrolClient {
    pub(crate) fn new(core: Arc<KiteCore>) -> Result<Self, KiteError> {
        let url = core
            .config
            .kontrol_url
            .clone()
            .ok_or_else(|| KiteError::Generic("no kontrol url configured".into()))?;

        let client = Client::new(core.clone(), url);
        client.set_reconnect(true);
        client.set_tell_timeout(Some(KONTROL_TELL_TIMEOUT));
        if let Some(key) = core.config.kite_key.clone() {
            client.set_auth(Authentication::kite_key(key));
        }

        let kontrol = Self {
            inner: Arc::new(KontrolInner {
                core,
                client: client.clone(),
                watchers: Mutex::new(Vec::new()),
                dialed: AtomicBool::new(false),
            }),
        };

        // After every (re)connect: re-subscribe watchers and re-submit
        // the last registered URL.
        let hook = kontrol.clone();
        client.on_connect(move |_client| {
            let kontrol = hook.clone();
            tokio::spawn(async move {
                kontrol.resubscribe_watchers().await;
                kontrol.resubmit_registration();
            });
        });

        Ok(kontrol)
    }

    /// Start dialing in the background; call once, later calls are
    /// no-ops.
    pub fn dial(&self) {
        if !self.inner.dialed.swap(true, Ordering::SeqCst) {
            self.inner.client.dial_forever();
        }
    }

    /// Wait for a live kontrol session.
    pub async fn wait_connected(&self) {
        self.dial();
        self.inner.client.wait_connected().await;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.client.is_connected()
    }

    /// Every RPC needs a live session; dial lazily and wait, bounded.
    async fn ensure_connected(&self) -> Result<(), KiteError> {
        if self.is_connected() {
            return Ok(());
        }
        tokio::time::timeout(KONTROL_CONNECT_TIMEOUT, self.wait_connected())
            .await
            .map_err(|_| KiteError::Send("cannot connect to kontrol".into()))
    }

    pub async fn close(&self) {
        self.inner.client.close().await;
    }

    // ── RPC surface ──────────────────────────────────────────────────

    /// Register this kite under `url`. The result may carry a
    /// kontrol-created heartbeat callable.
    pub(crate) async fn register(
        &self,
        url: &str,
    ) -> Result<(RegisterResult, Option<RemoteFunction>), KiteError> {
        self.ensure_connected().await?;
        let args = serde_json::to_value(RegisterArgs {
            url: url.to_string(),
        })
        .map_err(|e| KiteError::Argument(e.to_string()))?;
        let value = self.inner.client.tell("register", vec![args]).await?;
        let result: RegisterResult = serde_json::from_value(value.clone())
            .map_err(|e| KiteError::InvalidResponse(e.to_string()))?;
        let heartbeat = value
            .get("heartbeat")
            .and_then(|v| self.inner.client.bind_value(v));
        Ok((result, heartbeat))
    }

    /// Discover kites and get clients pre-wired with their URL and a
    /// call token. Each client gets its own token renewer.
    pub async fn get_kites(&self, query: KiteQuery) -> Result<Vec<Client>, KiteError> {
        let result = self.get_kites_raw(query, None).await?;
        Ok(result
            .kites
            .into_iter()
            .map(|kw| self.remote_client(kw))
            .collect())
    }

    async fn get_kites_raw(
        &self,
        query: KiteQuery,
        watch_callback: Option<Value>,
    ) -> Result<GetKitesResult, KiteError> {
        self.ensure_connected().await?;
        query
            .validate()
            .map_err(|e| KiteError::Argument(e.to_string()))?;
        let args = serde_json::to_value(GetKitesArgs {
            query,
            watch_callback,
            who: None,
        })
        .map_err(|e| KiteError::Argument(e.to_string()))?;
        let value = self.inner.client.tell("getKites", vec![args]).await?;
        serde_json::from_value(value).map_err(|e| KiteError::InvalidResponse(e.to_string()))
    }

    fn remote_client(&self, kw: KiteWithToken) -> Client {
        let client = Client::new(self.inner.core.clone(), kw.url);
        client.set_remote_kite(kw.kite.clone());
        client.set_auth(Authentication::token(kw.token));
        spawn_renewer(client.clone(), self.clone(), kw.kite);
        client
    }

    /// A fresh call token for `kite`.
    pub async fn get_token(&self, kite: &kite_protocol::Kite) -> Result<String, KiteError> {
        self.ensure_connected().await?;
        let arg = serde_json::to_value(kite).map_err(|e| KiteError::Argument(e.to_string()))?;
        let value = self.inner.client.tell("getToken", vec![arg]).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| KiteError::InvalidResponse("token is not a string".into()))
    }

    /// Kontrol's current public key.
    pub async fn get_key(&self) -> Result<String, KiteError> {
        self.ensure_connected().await?;
        let value = self.inner.client.tell("getKey", vec![]).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| KiteError::InvalidResponse("key is not a string".into()))
    }

    /// Watch registration changes under `query`. The handler observes
    /// `Register` / `Deregister` events until the watcher is
    /// cancelled.
    pub async fn watch_kites(
        &self,
        query: KiteQuery,
        handler: impl Fn(KiteEvent) + Send + Sync + 'static,
    ) -> Result<WatcherHandle, KiteError> {
        let watcher = Arc::new(Watcher {
            query,
            handler: Arc::new(handler),
            id: Mutex::new(String::new()),
        });
        self.subscribe(&watcher).await?;
        self.inner.watchers.lock().push(watcher.clone());
        Ok(WatcherHandle {
            kontrol: self.clone(),
            watcher,
        })
    }

    async fn subscribe(&self, watcher: &Arc<Watcher>) -> Result<(), KiteError> {
        let handler = watcher.handler.clone();
        let callback = self.inner.client.callback(move |mut args: Vec<Value>| {
            if args.is_empty() {
                return;
            }
            match serde_json::from_value::<KiteEvent>(args.remove(0)) {
                Ok(event) => handler(event),
                Err(e) => tracing::warn!(error = %e, "malformed watcher event"),
            }
        });
        let result = self
            .get_kites_raw(watcher.query.clone(), Some(callback.to_value()))
            .await?;
        let id = result
            .watcher_id
            .ok_or_else(|| KiteError::Watch("kontrol returned no watcher id".into()))?;
        *watcher.id.lock() = id;
        Ok(())
    }

    async fn resubscribe_watchers(&self) {
        let watchers: Vec<Arc<Watcher>> = self.inner.watchers.lock().clone();
        for watcher in watchers {
            if let Err(e) = self.subscribe(&watcher).await {
                tracing::warn!(query = %watcher.query, error = %e, "watcher resubscription failed");
            }
        }
    }

    fn resubmit_registration(&self) {
        let url = self.inner.core.last_registered_url.lock().clone();
        let urls = self.inner.core.register_urls.lock().clone();
        if let (Some(url), Some(urls)) = (url, urls) {
            tracing::debug!(url = %url, "resubmitting registration after reconnect");
            let _ = urls.try_send(url);
        }
    }

    pub async fn cancel_watcher(&self, handle: &WatcherHandle) -> Result<(), KiteError> {
        self.ensure_connected().await?;
        let id = handle.watcher.id.lock().clone();
        self.inner
            .client
            .tell("cancelWatcher", vec![Value::String(id)])
            .await?;
        self.inner
            .watchers
            .lock()
            .retain(|w| !Arc::ptr_eq(w, &handle.watcher));
        Ok(())
    }
}

/// A live watcher subscription.
pub struct WatcherHandle {
    kontrol: KontrolClient,
    watcher: Arc<Watcher>,
}

impl WatcherHandle {
    /// The current remote watcher id.
    pub fn id(&self) -> String {
        self.watcher.id.lock().clone()
    }

    /// Stop watching.
    pub async fn cancel(self) -> Result<(), KiteError> {
        self.kontrol.clone().cancel_watcher(&self).await
    }
}
