//! The kite runtime: identity, method registration, kontrol wiring,
//! and lifecycle channels. The HTTP/SockJS server itself lives in
//! `server`.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use kite_protocol as protocol;

use crate::auth::{AuthState, Authenticator, KeyVerifier, VerifyCache};
use crate::client::Client;
use crate::config::Config;
use crate::error::KiteError;
use crate::kontrol::KontrolClient;
use crate::method::{Handler, HandlerFn, MethodHandle, MethodHandling, MethodRegistry};
use crate::registration;
use crate::request::Request;

pub(crate) struct KiteCore {
    pub config: Config,
    identity: Mutex<protocol::Kite>,
    pub methods: MethodRegistry,
    pub auth: AuthState,
    kontrol: Mutex<Option<KontrolClient>>,

    // ── Registration state ───────────────────────────────────────────
    pub(crate) last_registered_url: Mutex<Option<String>>,
    pub(crate) register_urls: Mutex<Option<mpsc::Sender<String>>>,
    pub(crate) heartbeat_cancel: Mutex<Option<CancellationToken>>,
    registered_tx: watch::Sender<bool>,

    // ── Server lifecycle ─────────────────────────────────────────────
    pub(crate) ready_tx: watch::Sender<bool>,
    pub(crate) closed_tx: watch::Sender<bool>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) local_addr: Mutex<Option<std::net::SocketAddr>>,
    /// Live accepted sessions, closed on shutdown so the server can
    /// drain.
    pub(crate) accepted: Mutex<Vec<Client>>,
}

impl KiteCore {
    /// Snapshot of this kite's identity.
    pub fn identity(&self) -> protocol::Kite {
        self.identity.lock().clone()
    }

    pub(crate) fn signal_registered(&self) {
        // Closes the "ready" side exactly once; later registrations
        // are re-registrations.
        self.registered_tx.send_if_modified(|registered| {
            let first = !*registered;
            *registered = true;
            first
        });
    }
}

/// A kite: an RPC server and client with one identity.
#[derive(Clone)]
pub struct Kite {
    pub(crate) core: Arc<KiteCore>,
}

impl Kite {
    /// A kite named `name` at semantic version `version`, configured
    /// from the environment.
    pub fn new(name: &str, version: &str) -> Self {
        Self::with_config(Config::new(name, version))
    }

    pub fn with_config(config: Config) -> Self {
        let identity = protocol::Kite {
            username: config.username.clone(),
            environment: config.environment.clone(),
            name: config.name.clone(),
            version: config.version.clone(),
            region: config.region.clone(),
            hostname: config.hostname.clone(),
            id: config.id.clone(),
        };
        let auth = AuthState::new(config.kontrol_user.clone(), config.kontrol_key.clone());
        let shutdown = CancellationToken::new();
        VerifyCache::spawn_sweeper(auth.verify_cache.clone(), shutdown.clone());

        let kite = Self {
            core: Arc::new(KiteCore {
                config,
                identity: Mutex::new(identity),
                methods: MethodRegistry::new(),
                auth,
                kontrol: Mutex::new(None),
                last_registered_url: Mutex::new(None),
                register_urls: Mutex::new(None),
                heartbeat_cancel: Mutex::new(None),
                registered_tx: watch::channel(false).0,
                ready_tx: watch::channel(false).0,
                closed_tx: watch::channel(false).0,
                shutdown,
                local_addr: Mutex::new(None),
                accepted: Mutex::new(Vec::new()),
            }),
        };

        kite.handle_func("kite.ping", |_req| async { Ok(Value::String("pong".into())) })
            .disable_authentication();

        kite
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    /// This kite's identity tuple.
    pub fn kite(&self) -> protocol::Kite {
        self.core.identity()
    }

    // ── Methods ──────────────────────────────────────────────────────

    /// Register a method handler.
    pub fn handle(&self, name: &str, handler: impl Handler + 'static) -> MethodHandle {
        self.core.methods.register(name, Arc::new(handler))
    }

    /// Register a closure as a method handler.
    pub fn handle_func<F, Fut>(&self, name: &str, f: F) -> MethodHandle
    where
        F: Fn(Arc<Request>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, KiteError>> + Send + 'static,
    {
        self.core.methods.register(name, Arc::new(HandlerFn(f)))
    }

    /// Prepend a step to every method's chain.
    pub fn pre_handle_func<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<Request>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, KiteError>> + Send + 'static,
    {
        self.core.methods.pre_handle(Arc::new(HandlerFn(f)));
    }

    /// Append a step to every method's chain.
    pub fn post_handle_func<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<Request>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, KiteError>> + Send + 'static,
    {
        self.core.methods.post_handle(Arc::new(HandlerFn(f)));
    }

    /// Registry-wide chain semantics.
    pub fn set_method_handling(&self, handling: MethodHandling) {
        self.core.methods.set_method_handling(handling);
    }

    // ── Auth configuration ───────────────────────────────────────────

    /// Register an authenticator for a custom `authentication.type`.
    pub fn set_authenticator(&self, kind: &str, authenticator: Authenticator) {
        self.core
            .auth
            .authenticators
            .write()
            .insert(kind.to_string(), authenticator);
    }

    /// Delegate `kontrolKey` trust decisions (key rotation hook).
    pub fn set_key_verifier(&self, verifier: KeyVerifier) {
        *self.core.auth.key_verifier.lock() = Some(verifier);
    }

    /// Replace the trusted kontrol public key.
    pub fn set_kontrol_key(&self, key_pem: String) {
        *self.core.auth.kontrol_key.lock() = Some(key_pem);
    }

    // ── Clients ──────────────────────────────────────────────────────

    /// A client for the kite at `url` (e.g. `http://host:port/kite`).
    pub fn client(&self, url: &str) -> Client {
        Client::new(self.core.clone(), url)
    }

    /// The kontrol client, created on first use.
    pub fn kontrol(&self) -> Result<KontrolClient, KiteError> {
        let mut slot = self.core.kontrol.lock();
        if let Some(kontrol) = slot.as_ref() {
            return Ok(kontrol.clone());
        }
        let kontrol = KontrolClient::new(self.core.clone())?;
        *slot = Some(kontrol.clone());
        Ok(kontrol)
    }

    // ── Registration ─────────────────────────────────────────────────

    /// Keep this kite registered under `url` until shutdown: dials
    /// kontrol forever, registers, heartbeats, re-registers after
    /// reconnects. Returns a channel that flips to `true` on the first
    /// successful registration.
    pub fn register_forever(&self, url: &str) -> Result<watch::Receiver<bool>, KiteError> {
        let kontrol = self.kontrol()?;
        kontrol.dial();
        let urls = {
            let existing = self.core.register_urls.lock().clone();
            match existing {
                Some(urls) => urls,
                None => registration::start_registration(self.core.clone(), kontrol),
            }
        };
        let _ = urls.try_send(url.to_string());
        Ok(self.core.registered_tx.subscribe())
    }

    /// Register through a reverse/tunnel proxy: the proxy assigns the
    /// public URL that actually gets registered.
    pub fn register_via_proxy(&self, local_url: &str) -> Result<watch::Receiver<bool>, KiteError> {
        let kontrol = self.kontrol()?;
        kontrol.dial();
        if self.core.register_urls.lock().is_none() {
            registration::start_registration(self.core.clone(), kontrol.clone());
        }
        registration::start_proxy_registration(
            self.core.clone(),
            kontrol,
            local_url.to_string(),
        );
        Ok(self.core.registered_tx.subscribe())
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Flips to `true` once the server is bound and accepting.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.core.ready_tx.subscribe()
    }

    /// Flips to `true` once the server has shut down.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.core.closed_tx.subscribe()
    }

    /// The bound address, once serving.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        *self.core.local_addr.lock()
    }

    /// Stop serving and release resources. Idempotent.
    pub fn close(&self) {
        self.core.shutdown.cancel();
        if let Some(cancel) = self.core.heartbeat_cancel.lock().take() {
            cancel.cancel();
        }
        // Tear down live sessions so graceful shutdown can drain.
        let clients: Vec<Client> = self.core.accepted.lock().drain(..).collect();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            for client in clients {
                handle.spawn(async move { client.close().await });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ping_is_preregistered() {
        let kite = Kite::new("testkite", "0.0.1");
        assert!(kite.core.methods.get("kite.ping").is_some());
        assert!(!kite
            .core
            .methods
            .get("kite.ping")
            .unwrap()
            .must_authenticate());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let kite = Kite::new("testkite", "0.0.1");
        kite.close();
        kite.close();
        assert!(kite.core.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn registered_signal_fires_once() {
        let kite = Kite::new("testkite", "0.0.1");
        let mut rx = kite.core.registered_tx.subscribe();
        assert!(!*rx.borrow());
        kite.core.signal_registered();
        kite.core.signal_registered();
        assert!(rx.changed().await.is_ok());
        assert!(*rx.borrow_and_update());
        // The second signal did not queue another change.
        assert!(!rx.has_changed().unwrap());
    }
}
