//! Kontrol: the registry and authentication service. Kontrol is
//! itself a kite; its RPC surface is `register`, `registerMachine`,
//! `getKites`, `getToken`, `getKey`, and `cancelWatcher`, plus an HTTP
//! register/heartbeat pair for session-less kites.

mod heartbeat;
mod http;
mod keypair;
mod memstore;
mod storage;
mod token;
mod watcher;

pub use heartbeat::{BeatOutcome, HeartbeatTracker};
pub use keypair::{fingerprint, KeyPair, KeyPairError, KeyPairs};
pub use memstore::MemoryStorage;
pub use storage::{KiteRecord, Storage, StorageError, WatchAction, WatchEvent};
pub use token::TokenSigner;
pub use watcher::WatcherHub;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use semver::Version;
use serde_json::{json, Value};

use kite::{KiteError, Request};
use kite_protocol::{
    FunctionRef, GetKitesArgs, GetKitesResult, KiteQuery, KiteWithToken, RegisterArgs,
    RegisterMachineArgs, HEARTBEAT_INTERVAL,
};

use crate::watcher::EventSink;

/// Vets `registerMachine` requests; `Err` denies with the given
/// message.
pub type MachineAuthenticator =
    Arc<dyn Fn(&RegisterMachineArgs) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct KontrolConfig {
    pub ip: String,
    /// Kontrol's conventional port is 4000.
    pub port: u16,
    pub username: String,
    pub environment: String,
    pub region: String,
    /// Public URL kontrol registers itself under and stamps into kite
    /// keys; derived from the bound address when unset.
    pub url: Option<String>,
    pub public_key_pem: String,
    pub private_key_pem: String,
    /// Lifetime of issued call tokens.
    pub token_ttl: Duration,
    /// Heartbeat period handed to registering kites.
    pub heartbeat_interval: Duration,
    /// Grace on top of the interval before a silent kite is dropped.
    pub heartbeat_delay: Duration,
}

impl KontrolConfig {
    pub fn new(public_key_pem: String, private_key_pem: String) -> Self {
        Self {
            ip: "0.0.0.0".into(),
            port: kite_protocol::KONTROL_PORT,
            username: "kontrol".into(),
            environment: "production".into(),
            region: "unconfigured".into(),
            url: None,
            public_key_pem,
            private_key_pem,
            token_ttl: kite_protocol::TOKEN_TTL,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_delay: kite_protocol::HEARTBEAT_DELAY,
        }
    }
}

pub(crate) struct KontrolState {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) signer: Arc<TokenSigner>,
    pub(crate) heartbeats: Arc<HeartbeatTracker>,
    pub(crate) watchers: Arc<WatcherHub>,
    pub(crate) heartbeat_interval: Duration,
    /// Kontrol's public URL, resolved at serve time.
    pub(crate) url: Mutex<String>,
    pub(crate) machine_auth: Mutex<Option<MachineAuthenticator>>,
}

/// The kontrol service.
pub struct Kontrol {
    kite: kite::Kite,
    state: Arc<KontrolState>,
    config: KontrolConfig,
}

impl Kontrol {
    pub fn new(config: KontrolConfig, storage: Arc<dyn Storage>) -> anyhow::Result<Self> {
        let pair = KeyPair::new(
            config.public_key_pem.clone(),
            config.private_key_pem.clone(),
        )?;
        let signer = Arc::new(TokenSigner::with_ttl(
            config.username.clone(),
            KeyPairs::new(pair),
            config.token_ttl,
        ));
        let heartbeats = Arc::new(HeartbeatTracker::with_window(
            storage.clone(),
            config.heartbeat_interval + config.heartbeat_delay,
        ));
        let watchers = Arc::new(WatcherHub::new(storage.clone(), signer.clone()));

        let mut kite_config = kite::Config::new("kontrol", env!("CARGO_PKG_VERSION"));
        kite_config.username = config.username.clone();
        kite_config.environment = config.environment.clone();
        kite_config.region = config.region.clone();
        kite_config.kontrol_user = config.username.clone();
        kite_config.kontrol_key = Some(config.public_key_pem.clone());
        kite_config.ip = config.ip.clone();
        kite_config.port = config.port;
        let kite = kite::Kite::with_config(kite_config);

        // Kite keys signed by rotated-out pairs must keep working;
        // trust any public key from the history.
        let history = signer.clone();
        kite.set_key_verifier(Arc::new(move |pem: &str| {
            history.keys().read().by_public(pem).is_some()
        }));

        let state = Arc::new(KontrolState {
            storage,
            signer,
            heartbeats,
            watchers,
            heartbeat_interval: config.heartbeat_interval,
            url: Mutex::new(config.url.clone().unwrap_or_default()),
            machine_auth: Mutex::new(None),
        });

        let kontrol = Self {
            kite,
            state,
            config,
        };
        kontrol.wire_methods();
        Ok(kontrol)
    }

    /// Require an out-of-band check for `registerMachine`. Without
    /// one, every request is granted.
    pub fn set_machine_authenticator(&self, auth: MachineAuthenticator) {
        *self.state.machine_auth.lock() = Some(auth);
    }

    /// Rotate in a new signing key pair. Existing kite keys keep
    /// verifying; `register` answers them with fresh material.
    pub fn rotate_keys(&self, public_pem: String, private_pem: String) -> anyhow::Result<()> {
        let pair = KeyPair::new(public_pem, private_pem)?;
        self.state.signer.keys().write().add(pair);
        Ok(())
    }

    /// The underlying kite, for lifecycle channels and the bound
    /// address.
    pub fn kite(&self) -> &kite::Kite {
        &self.kite
    }

    pub fn close(&self) {
        self.kite.close();
    }

    /// Serve until closed: the kite RPC surface under `/kite`, the
    /// HTTP register/heartbeat endpoints at the root, plus kontrol's
    /// own storage record refreshed every heartbeat interval.
    pub async fn serve(&self) -> anyhow::Result<()> {
        self.spawn_self_registration();
        self.spawn_token_cache_sweeper();
        let router = http::router(self.state.clone());
        self.kite.serve_with(router).await
    }

    fn wire_methods(&self) {
        let state = self.state.clone();
        self.kite
            .handle_func("register", move |req| handle_register(state.clone(), req));

        let state = self.state.clone();
        self.kite
            .handle_func("registerMachine", move |req| {
                handle_register_machine(state.clone(), req)
            })
            .disable_authentication();

        let state = self.state.clone();
        self.kite
            .handle_func("getKites", move |req| handle_get_kites(state.clone(), req));

        let state = self.state.clone();
        self.kite
            .handle_func("getToken", move |req| handle_get_token(state.clone(), req));

        let state = self.state.clone();
        self.kite
            .handle_func("getKey", move |req| handle_get_key(state.clone(), req));

        let state = self.state.clone();
        self.kite.handle_func("cancelWatcher", move |req| {
            handle_cancel_watcher(state.clone(), req)
        });
    }

    /// Kontrol writes its own record and refreshes it; a transient
    /// storage failure retries after a short pause.
    fn spawn_self_registration(&self) {
        let state = self.state.clone();
        let kite = self.kite.clone();
        let configured_url = self.config.url.clone();
        tokio::spawn(async move {
            // The bound address is only known once serving.
            let mut ready = kite.ready();
            while !*ready.borrow_and_update() {
                if ready.changed().await.is_err() {
                    return;
                }
            }
            let url = match configured_url {
                Some(url) => url,
                None => match kite.local_addr() {
                    Some(addr) => {
                        format!("http://{}:{}/kite", kite.config().hostname, addr.port())
                    }
                    None => {
                        tracing::error!("ready without a bound address, self-registration disabled");
                        return;
                    }
                },
            };
            *state.url.lock() = url.clone();

            let record = KiteRecord {
                kite: kite.kite(),
                url,
                key_id: state.signer.current_key_id(),
            };
            let mut closed = kite.closed();
            loop {
                let pause = match state.storage.add(&record).await {
                    Ok(()) => HEARTBEAT_INTERVAL,
                    Err(e) => {
                        tracing::warn!(error = %e, "self-registration failed");
                        Duration::from_secs(1)
                    }
                };
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = closed.changed() => return,
                }
            }
        });
    }

    fn spawn_token_cache_sweeper(&self) {
        let signer = self.state.signer.clone();
        let mut closed = self.kite.closed();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = tick.tick() => signer.sweep_cache(),
                    _ = closed.changed() => return,
                }
            }
        });
    }
}

// ── RPC handlers ────────────────────────────────────────────────────

async fn handle_register(
    state: Arc<KontrolState>,
    req: Arc<Request>,
) -> Result<Value, KiteError> {
    let args: RegisterArgs = req.one()?;
    let identity = req.client.remote_kite();
    if identity.username.is_empty() || identity.id.is_empty() {
        return Err(KiteError::Argument("caller kite identity is incomplete".into()));
    }

    // Which pair signed the caller's kite key decides whether fresh
    // material rides along.
    let kite_key = req
        .auth
        .as_ref()
        .filter(|a| a.kind == "kiteKey")
        .map(|a| a.key.clone())
        .ok_or_else(|| {
            KiteError::Authentication("registration requires kiteKey authentication".into())
        })?;
    let (_claims, key_id) = state
        .signer
        .verify_kite_key(&kite_key)
        .map_err(|e| KiteError::Authentication(e.to_string()))?;

    let record = KiteRecord {
        kite: identity.clone(),
        url: args.url.clone(),
        key_id: key_id.clone(),
    };
    state
        .storage
        .add(&record)
        .await
        .map_err(|e| KiteError::Generic(e.to_string()))?;
    state.heartbeats.track(record);
    tracing::info!(kite = %identity.key(), url = %args.url, "kite registered");

    // The heartbeat callable rides back in the result; each invocation
    // refreshes the TTL.
    let beat_state = state.clone();
    let kite_id = identity.id.clone();
    let heartbeat_fn = req.client.callback(move |_args| {
        let state = beat_state.clone();
        let id = kite_id.clone();
        tokio::spawn(async move {
            state.heartbeats.beat(&id).await;
        });
    });

    let mut result = json!({
        "url": args.url,
        "heartbeatInterval": state.heartbeat_interval.as_secs(),
        "heartbeat": heartbeat_fn.to_value(),
    });
    if !state.signer.keys().read().is_current(&key_id) {
        tracing::info!(kite = %identity.key(), "kite key is from a rotated pair, issuing fresh material");
        let kontrol_url = state.url.lock().clone();
        let fresh = state
            .signer
            .sign_kite_key(&req.username(), &kontrol_url)
            .map_err(|e| KiteError::Generic(e.to_string()))?;
        result["kiteKey"] = Value::String(fresh);
        result["publicKey"] = Value::String(state.signer.current_public_key());
    }
    Ok(result)
}

async fn handle_register_machine(
    state: Arc<KontrolState>,
    req: Arc<Request>,
) -> Result<Value, KiteError> {
    let args: RegisterMachineArgs = req.one()?;
    let gate = state.machine_auth.lock().clone();
    match gate {
        Some(authenticate) => {
            authenticate(&args).map_err(KiteError::Authentication)?;
        }
        None => {
            tracing::warn!(username = %args.username, "registerMachine without an authenticator, granting");
        }
    }
    let kontrol_url = state.url.lock().clone();
    let kite_key = state
        .signer
        .sign_kite_key(&args.username, &kontrol_url)
        .map_err(|e| KiteError::Generic(e.to_string()))?;
    tracing::info!(username = %args.username, "machine registered, kite key issued");
    Ok(Value::String(kite_key))
}

async fn handle_get_kites(
    state: Arc<KontrolState>,
    req: Arc<Request>,
) -> Result<Value, KiteError> {
    let args: GetKitesArgs = req.one()?;
    args.query
        .validate()
        .map_err(|e| KiteError::Argument(e.to_string()))?;

    let records = query_storage(&state, &args.query).await?;

    // One token covers the whole result set: its audience is the
    // canonical path of the query, not of any single kite.
    let audience = args.query.canonical_path();
    let token = state
        .signer
        .sign_token(&audience, &req.username())
        .map_err(|e| KiteError::Generic(e.to_string()))?;
    let kites: Vec<KiteWithToken> = records
        .into_iter()
        .map(|record| KiteWithToken {
            kite: record.kite,
            url: record.url,
            token: token.clone(),
        })
        .collect();

    let watcher_id = match args.watch_callback.as_ref().and_then(FunctionRef::from_value) {
        Some(func_ref) => {
            let func = req.client.bind(func_ref);
            let sink: EventSink = Arc::new(move |event| {
                let func = func.clone();
                Box::pin(async move {
                    let arg = serde_json::to_value(&event).map_err(|e| e.to_string())?;
                    func.call(vec![arg]).await.map_err(|e| e.to_string())
                })
            });
            Some(
                state
                    .watchers
                    .add(args.query.clone(), req.username(), sink)
                    .await,
            )
        }
        None => None,
    };

    serde_json::to_value(GetKitesResult { kites, watcher_id })
        .map_err(|e| KiteError::Generic(e.to_string()))
}

/// Exact-version queries go straight to storage; a version constraint
/// queries up to `name` and filters here. Results are shuffled.
async fn query_storage(
    state: &KontrolState,
    query: &KiteQuery,
) -> Result<Vec<KiteRecord>, KiteError> {
    let constraint = query.version_constraint();
    let storage_query = match constraint {
        Some(_) => query.up_to_name(),
        None => query.clone(),
    };
    let mut records = state
        .storage
        .get(&storage_query)
        .await
        .map_err(|e| KiteError::Generic(e.to_string()))?;
    if let Some(req_version) = &constraint {
        records.retain(|record| {
            Version::parse(&record.kite.version)
                .map(|v| req_version.matches(&v))
                .unwrap_or(false)
        });
    }
    records.shuffle(&mut rand::thread_rng());
    Ok(records)
}

async fn handle_get_token(
    state: Arc<KontrolState>,
    req: Arc<Request>,
) -> Result<Value, KiteError> {
    let kite: kite_protocol::Kite = req.one()?;
    let token = state
        .signer
        .sign_token(&kite.key(), &req.username())
        .map_err(|e| KiteError::Generic(e.to_string()))?;
    Ok(Value::String(token))
}

async fn handle_get_key(
    state: Arc<KontrolState>,
    _req: Arc<Request>,
) -> Result<Value, KiteError> {
    Ok(Value::String(state.signer.current_public_key()))
}

async fn handle_cancel_watcher(
    state: Arc<KontrolState>,
    req: Arc<Request>,
) -> Result<Value, KiteError> {
    let id: String = req.one()?;
    if !state.watchers.cancel(&id) {
        return Err(KiteError::Watch(format!("unknown watcher: {id}")));
    }
    Ok(Value::Null)
}
