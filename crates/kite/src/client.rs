//! The session multiplexer: one [`Client`] per remote kite.
//!
//! A client wraps a SockJS session with a sender hub, a reader that
//! dispatches inbound messages, request/reply correlation through the
//! callback table, and an explicit connection state machine
//! (`disconnected → dialing → connected → closing`). Dialed clients can
//! reconnect forever; accepted (server-side) clients never redial.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use kite_protocol::{
    Authentication, CallOptions, FunctionRef, Message, MethodId, ResponsePayload,
};
use kite_sockjs::{ClientSession, ServerSession, SessionState, Transport};

use crate::backoff::DialBackoff;
use crate::callbacks::{Callback, CallbackTable};
use crate::error::KiteError;
use crate::renewer::RenewSignal;
use crate::request;
use crate::runtime::KiteCore;

/// Observable connection lifecycle of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Dialing,
    Connected,
    Closing,
}

/// Hook run on connect/disconnect transitions.
pub type ConnHandler = Arc<dyn Fn(Client) + Send + Sync>;

struct Outbound {
    text: String,
    /// Fires with a description when the hub fails to put the message
    /// on the wire.
    error_tx: Option<oneshot::Sender<String>>,
}

enum Session {
    Dialed(ClientSession),
    Accepted(ServerSession),
}

impl Session {
    async fn recv(&mut self) -> Option<String> {
        match self {
            Session::Dialed(s) => s.recv().await,
            Session::Accepted(s) => s.recv().await,
        }
    }

    async fn close(&self) {
        match self {
            Session::Dialed(s) => s.close(),
            Session::Accepted(s) => s.close(kite_sockjs::CLOSE_GO_AWAY, "Go away!").await,
        }
    }
}

#[derive(Clone)]
enum SessionSender {
    Dialed(kite_sockjs::SessionSender),
    Accepted(kite_sockjs::ServerSender),
}

impl SessionSender {
    async fn send(&self, text: String) -> Result<(), ()> {
        match self {
            SessionSender::Dialed(s) => s.send(text).await.map_err(|_| ()),
            SessionSender::Accepted(s) => s.send(text).await.map_err(|_| ()),
        }
    }
}

pub(crate) struct ClientInner {
    pub(crate) core: Arc<KiteCore>,
    /// Identity of the remote kite; filled from the dial target or the
    /// first request it sends.
    remote: Mutex<kite_protocol::Kite>,
    url: Mutex<Option<String>>,
    auth: Mutex<Option<Authentication>>,
    transport: Transport,
    reconnect: AtomicBool,
    concurrent: bool,
    concurrent_callbacks: bool,
    tell_timeout: Mutex<Option<Duration>>,
    pub(crate) callbacks: CallbackTable,

    state_tx: watch::Sender<ConnState>,
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    hub_done: Mutex<Option<oneshot::Receiver<()>>>,
    /// Rotated on every disconnect so late subscribers do not observe
    /// a stale signal.
    disconnect: Mutex<broadcast::Sender<()>>,
    closed: AtomicBool,
    close_token: CancellationToken,
    close_tx: watch::Sender<bool>,
    on_connect: Mutex<Vec<ConnHandler>>,
    on_disconnect: Mutex<Vec<ConnHandler>>,
    pub(crate) renew_tx: Mutex<Option<mpsc::Sender<RenewSignal>>>,
}

/// A connection to a remote kite. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    pub(crate) fn new(core: Arc<KiteCore>, url: impl Into<String>) -> Self {
        let transport = core.config.transport;
        let concurrent = !core.config.disable_concurrency;
        let concurrent_callbacks = core.config.concurrent_callbacks;
        Self {
            inner: Arc::new(ClientInner {
                core,
                remote: Mutex::new(kite_protocol::Kite::default()),
                url: Mutex::new(Some(url.into())),
                auth: Mutex::new(None),
                transport,
                reconnect: AtomicBool::new(false),
                concurrent,
                concurrent_callbacks,
                tell_timeout: Mutex::new(None),
                callbacks: CallbackTable::new(),
                state_tx: watch::channel(ConnState::Disconnected).0,
                outbound: Mutex::new(None),
                hub_done: Mutex::new(None),
                disconnect: Mutex::new(broadcast::channel(4).0),
                closed: AtomicBool::new(false),
                close_token: CancellationToken::new(),
                close_tx: watch::channel(false).0,
                on_connect: Mutex::new(Vec::new()),
                on_disconnect: Mutex::new(Vec::new()),
                renew_tx: Mutex::new(None),
            }),
        }
    }

    /// Wrap an accepted server-side session. The remote identity is
    /// learned from its first request.
    pub(crate) fn from_accepted(core: Arc<KiteCore>, session: ServerSession) -> Self {
        let client = Self::new(core, String::new());
        *client.inner.url.lock() = None;
        client.install_session(Session::Accepted(session));
        let _ = client.inner.state_tx.send(ConnState::Connected);
        client
    }

    // ── Configuration ────────────────────────────────────────────────

    /// Enable redialing after connection loss.
    pub fn set_reconnect(&self, reconnect: bool) {
        self.inner.reconnect.store(reconnect, Ordering::SeqCst);
    }

    pub fn set_auth(&self, auth: Authentication) {
        *self.inner.auth.lock() = Some(auth);
    }

    pub fn auth(&self) -> Option<Authentication> {
        self.inner.auth.lock().clone()
    }

    /// Default timeout applied by [`tell`](Self::tell). `None` waits
    /// forever.
    pub fn set_tell_timeout(&self, timeout: Option<Duration>) {
        *self.inner.tell_timeout.lock() = timeout;
    }

    pub fn set_remote_kite(&self, kite: kite_protocol::Kite) {
        *self.inner.remote.lock() = kite;
    }

    /// Identity of the remote kite, as far as it is known.
    pub fn remote_kite(&self) -> kite_protocol::Kite {
        self.inner.remote.lock().clone()
    }

    pub fn url(&self) -> Option<String> {
        self.inner.url.lock().clone()
    }

    pub fn on_connect(&self, handler: impl Fn(Client) + Send + Sync + 'static) {
        self.inner.on_connect.lock().push(Arc::new(handler));
    }

    pub fn on_disconnect(&self, handler: impl Fn(Client) + Send + Sync + 'static) {
        self.inner.on_disconnect.lock().push(Arc::new(handler));
    }

    /// Observable connection state.
    pub fn state(&self) -> watch::Receiver<ConnState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state_tx.borrow() == ConnState::Connected
    }

    /// Observable close signal; flips to `true` exactly once.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.inner.close_tx.subscribe()
    }

    pub(crate) fn close_cancelled(&self) -> CancellationToken {
        self.inner.close_token.clone()
    }

    // ── Dialing ──────────────────────────────────────────────────────

    /// One dial attempt.
    pub async fn dial(&self) -> Result<(), KiteError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(KiteError::Send("client is closed".into()));
        }
        let url = self
            .inner
            .url
            .lock()
            .clone()
            .ok_or_else(|| KiteError::Send("client has no url to dial".into()))?;

        let _ = self.inner.state_tx.send(ConnState::Dialing);
        let session = match ClientSession::connect(&url, self.inner.transport).await {
            Ok(session) => session,
            Err(e) => {
                let _ = self.inner.state_tx.send(ConnState::Disconnected);
                return Err(KiteError::Send(e.to_string()));
            }
        };

        // Wait for the open frame before claiming the connection.
        let mut state = session.state();
        let opened = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match *state.borrow_and_update() {
                    SessionState::Active => return true,
                    SessionState::Closed => return false,
                    SessionState::Opening => {}
                }
                if state.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;
        if !matches!(opened, Ok(true)) {
            let _ = self.inner.state_tx.send(ConnState::Disconnected);
            return Err(KiteError::Send("sockjs open handshake failed".into()));
        }

        self.install_session(Session::Dialed(session));
        let _ = self.inner.state_tx.send(ConnState::Connected);
        tracing::debug!(url = %url, "connected");
        self.run_connect_handlers();
        Ok(())
    }

    /// Dial until connected, backing off exponentially. Returns
    /// immediately; observe [`state`](Self::state) for progress.
    pub fn dial_forever(&self) {
        let client = self.clone();
        tokio::spawn(async move {
            let backoff = DialBackoff::default();
            let mut attempt: u32 = 0;
            loop {
                if client.inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                match client.dial().await {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::debug!(attempt, error = %e, "dial failed");
                    }
                }
                let delay = backoff.delay_for_attempt(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = client.inner.close_token.cancelled() => return,
                }
                attempt = attempt.saturating_add(1);
            }
        });
    }

    /// Wait until the client is connected.
    pub async fn wait_connected(&self) {
        let mut state = self.state();
        loop {
            if *state.borrow_and_update() == ConnState::Connected {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    fn install_session(&self, session: Session) {
        let sender = match &session {
            Session::Dialed(s) => SessionSender::Dialed(s.sender()),
            Session::Accepted(s) => SessionSender::Accepted(s.sender()),
        };

        // Sender hub: drains the queue, reporting failures per message.
        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(64);
        let (done_tx, done_rx) = oneshot::channel::<()>();
        *self.inner.outbound.lock() = Some(out_tx);
        *self.inner.hub_done.lock() = Some(done_rx);
        tokio::spawn(async move {
            while let Some(out) = out_rx.recv().await {
                if sender.send(out.text).await.is_err() {
                    if let Some(err_tx) = out.error_tx {
                        let _ = err_tx.send("session closed while sending".into());
                    }
                    break;
                }
            }
            drop(done_tx);
        });

        // Reader: dispatches until the session ends or close is
        // requested.
        let client = self.clone();
        tokio::spawn(async move {
            let mut session = session;
            loop {
                tokio::select! {
                    msg = session.recv() => match msg {
                        Some(text) => client.dispatch(text).await,
                        None => break,
                    },
                    _ = client.inner.close_token.cancelled() => {
                        session.close().await;
                        break;
                    }
                }
            }
            client.handle_disconnect();
        });
    }

    fn run_connect_handlers(&self) {
        let handlers: Vec<ConnHandler> = self.inner.on_connect.lock().clone();
        for handler in handlers {
            handler(self.clone());
        }
        if let Some(renew) = self.inner.renew_tx.lock().clone() {
            let _ = renew.try_send(RenewSignal::Reconnected);
        }
    }

    fn handle_disconnect(&self) {
        *self.inner.outbound.lock() = None;
        // Session gone: every callback reference dies with it, and
        // outstanding waiters learn it from the disconnect broadcast.
        self.inner.callbacks.clear();
        let fresh = broadcast::channel(4).0;
        let stale = std::mem::replace(&mut *self.inner.disconnect.lock(), fresh);
        let _ = stale.send(());
        let _ = self.inner.state_tx.send(ConnState::Disconnected);

        let handlers: Vec<ConnHandler> = self.inner.on_disconnect.lock().clone();
        for handler in handlers {
            handler(self.clone());
        }

        if !self.inner.closed.load(Ordering::SeqCst)
            && self.inner.reconnect.load(Ordering::SeqCst)
        {
            tracing::debug!(url = ?self.url(), "connection lost, redialing");
            self.dial_forever();
        }
    }

    // ── Calls ────────────────────────────────────────────────────────

    /// Call a method and wait for its response with the client's
    /// default timeout.
    pub async fn tell(&self, method: &str, args: Vec<Value>) -> Result<Value, KiteError> {
        let timeout = *self.inner.tell_timeout.lock();
        self.tell_with_timeout(method, args, timeout).await
    }

    /// Call a method; exactly one of result / error is returned. A
    /// timeout purges the response callback registration.
    pub async fn tell_with_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, KiteError> {
        let (response_tx, response_rx) = oneshot::channel::<Result<Value, KiteError>>();
        let slot = Mutex::new(Some(response_tx));
        let response_cb: Callback = Arc::new(move |mut cb_args: Vec<Value>| {
            let outcome = if cb_args.is_empty() {
                Err(KiteError::InvalidResponse("empty response".into()))
            } else {
                match serde_json::from_value::<ResponsePayload>(cb_args.remove(0)) {
                    Ok(ResponsePayload {
                        error: Some(err), ..
                    }) => Err(KiteError::Remote(err)),
                    Ok(ResponsePayload { result, .. }) => {
                        Ok(result.unwrap_or(Value::Null))
                    }
                    Err(e) => Err(KiteError::InvalidResponse(e.to_string())),
                }
            };
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send(outcome);
            }
        });
        let func = self.inner.callbacks.register(response_cb);

        let options = CallOptions {
            kite: self.inner.core.identity(),
            authentication: self.inner.auth.lock().clone(),
            with_args: args,
            response_callback: Some(func),
        };
        let options = serde_json::to_value(&options)
            .map_err(|e| KiteError::Argument(e.to_string()))?;
        let msg = Message::new(MethodId::Name(method.to_string()), vec![options]);
        let text = serde_json::to_string(&msg)
            .map_err(|e| KiteError::Argument(e.to_string()))?;

        // Subscribe before queueing so a racing disconnect is not
        // missed.
        let mut disconnect_rx = self.inner.disconnect.lock().subscribe();

        let (send_err_tx, send_err_rx) = oneshot::channel::<String>();
        let queue = self.inner.outbound.lock().clone();
        let queued = match queue {
            Some(queue) => queue
                .send(Outbound {
                    text,
                    error_tx: Some(send_err_tx),
                })
                .await
                .is_ok(),
            None => false,
        };
        if !queued {
            self.inner.callbacks.purge(func.id);
            return Err(KiteError::Send("can't send, not connected".into()));
        }

        let timeout_fut = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        // The hub drops the error sender on success; only a real
        // failure resolves this arm.
        let send_err_fut = async {
            match send_err_rx.await {
                Ok(detail) => detail,
                Err(_) => std::future::pending::<String>().await,
            }
        };

        let outcome = tokio::select! {
            response = response_rx => match response {
                Ok(outcome) => outcome,
                // Callback dropped without firing: the table was
                // cleared by a disconnect.
                Err(_) => Err(KiteError::Disconnect),
            },
            _ = disconnect_rx.recv() => {
                self.inner.callbacks.purge(func.id);
                Err(KiteError::Disconnect)
            }
            detail = send_err_fut => {
                self.inner.callbacks.purge(func.id);
                Err(KiteError::Send(detail))
            }
            _ = timeout_fut => {
                self.inner.callbacks.purge(func.id);
                Err(KiteError::Timeout(timeout.unwrap_or_default()))
            }
        };

        if let Err(err) = &outcome {
            if err.is_token_expired() {
                if let Some(renew) = self.inner.renew_tx.lock().clone() {
                    let _ = renew.try_send(RenewSignal::Expired);
                }
            }
        }
        outcome
    }

    /// Unblocking variant of [`tell`](Self::tell): returns the channel
    /// the response will arrive on.
    pub fn go(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> oneshot::Receiver<Result<Value, KiteError>> {
        let (tx, rx) = oneshot::channel();
        let client = self.clone();
        let method = method.to_string();
        tokio::spawn(async move {
            let _ = tx.send(client.tell(&method, args).await);
        });
        rx
    }

    /// Bind a received function placeholder to this session.
    pub fn bind(&self, func: FunctionRef) -> RemoteFunction {
        RemoteFunction {
            id: func.id,
            client: self.clone(),
        }
    }

    /// Bind the placeholder found in `value`, if any.
    pub fn bind_value(&self, value: &Value) -> Option<RemoteFunction> {
        FunctionRef::from_value(value).map(|f| self.bind(f))
    }

    /// Register a local callable and get the placeholder to embed in
    /// outgoing arguments.
    pub fn callback(&self, callback: impl Fn(Vec<Value>) + Send + Sync + 'static) -> FunctionRef {
        self.inner.callbacks.register(Arc::new(callback))
    }

    pub(crate) async fn send_message(&self, msg: &Message) -> Result<(), KiteError> {
        let text =
            serde_json::to_string(msg).map_err(|e| KiteError::Argument(e.to_string()))?;
        let queue = self
            .inner
            .outbound
            .lock()
            .clone()
            .ok_or_else(|| KiteError::Send("can't send, not connected".into()))?;
        queue
            .send(Outbound {
                text,
                error_tx: None,
            })
            .await
            .map_err(|_| KiteError::Send("session closed".into()))
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    async fn dispatch(&self, text: String) {
        let msg: Message = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "skipping invalid message");
                return;
            }
        };
        match msg.method.clone() {
            MethodId::Callback(id) => match self.inner.callbacks.get(id) {
                Some(callback) => {
                    if self.inner.concurrent_callbacks {
                        tokio::task::spawn_blocking(move || callback(msg.arguments));
                    } else {
                        // Invoked inline: same-session callback order
                        // is preserved.
                        callback(msg.arguments);
                    }
                }
                None => {
                    tracing::warn!(id, "callback not found");
                }
            },
            MethodId::Name(name) => {
                if self.inner.concurrent {
                    let client = self.clone();
                    tokio::spawn(async move {
                        request::run_method(client, name, msg).await;
                    });
                } else {
                    request::run_method(self.clone(), name, msg).await;
                }
            }
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Close the client. Idempotent: resources are released exactly
    /// once, repeated calls return immediately.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.reconnect.store(false, Ordering::SeqCst);
        let _ = self.inner.state_tx.send(ConnState::Closing);

        // Drop the queue so the hub drains and exits, then wait for it.
        let hub_done = {
            *self.inner.outbound.lock() = None;
            self.inner.hub_done.lock().take()
        };
        if let Some(done) = hub_done {
            let _ = tokio::time::timeout(Duration::from_secs(5), done).await;
        }

        // Tear the session down with the go-away close code.
        self.inner.close_token.cancel();
        self.inner.callbacks.clear();
        let _ = self.inner.close_tx.send(true);
        tracing::debug!(url = ?self.url(), "client closed");
    }
}

/// A callable the remote side handed us by reference.
#[derive(Clone)]
pub struct RemoteFunction {
    id: u64,
    client: Client,
}

impl RemoteFunction {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Invoke the remote callback. One-way: delivery errors surface,
    /// application errors do not.
    pub async fn call(&self, args: Vec<Value>) -> Result<(), KiteError> {
        let msg = Message::new(MethodId::Callback(self.id), args);
        self.client.send_message(&msg).await
    }
}
