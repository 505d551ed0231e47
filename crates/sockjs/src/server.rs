//! Server side: an axum-mounted SockJS endpoint.
//!
//! Flow:
//! 1. The endpoint is nested under a prefix (kites use `/kite`).
//! 2. A client opens the websocket transport (or falls back to XHR
//!    polling) under `/{server}/{session}/...`.
//! 3. Each opened session is pushed to the acceptor channel as a
//!    [`ServerSession`]; the application drives `recv`/`send`.
//!
//! Sessions move `opening → active → closed`; a second simultaneous
//! XHR poll is interrupted with close code 2010.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Notify};

use crate::client::SessionState;
use crate::frame::{decode_client_frame, Frame, CLOSE_GO_AWAY, CLOSE_STILL_OPEN};

/// Interval between `h` frames on idle connections.
const HEARTBEAT: Duration = Duration::from_secs(25);

/// How long an XHR session survives without a poll before it is
/// considered disconnected.
const DISCONNECT_DELAY: Duration = Duration::from_secs(5);

enum Command {
    Message(String),
    Close { code: u16, reason: String },
}

/// An accepted session, handed to the application.
pub struct ServerSession {
    id: String,
    inbound: mpsc::Receiver<String>,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
}

impl ServerSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next message from the client; `None` once the session closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    /// Queue one SockJS message to the client.
    pub async fn send(&self, msg: impl Into<String>) -> Result<(), SessionClosed> {
        self.commands
            .send(Command::Message(msg.into()))
            .await
            .map_err(|_| SessionClosed)
    }

    /// Close the session with a SockJS close frame.
    pub async fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self
            .commands
            .send(Command::Close {
                code,
                reason: reason.into(),
            })
            .await;
    }

    /// Clonable send-half for writer tasks.
    pub fn sender(&self) -> ServerSender {
        ServerSender {
            commands: self.commands.clone(),
        }
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("session closed")]
pub struct SessionClosed;

/// Clonable send-half of a [`ServerSession`].
#[derive(Clone)]
pub struct ServerSender {
    commands: mpsc::Sender<Command>,
}

impl ServerSender {
    pub async fn send(&self, msg: impl Into<String>) -> Result<(), SessionClosed> {
        self.commands
            .send(Command::Message(msg.into()))
            .await
            .map_err(|_| SessionClosed)
    }

    pub async fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self
            .commands
            .send(Command::Close {
                code,
                reason: reason.into(),
            })
            .await;
    }
}

struct XhrSession {
    inbound: mpsc::Sender<String>,
    /// Single-receiver guard: a second concurrent poll fails try_lock
    /// and is answered with close code 2010.
    commands: Arc<tokio::sync::Mutex<mpsc::Receiver<Command>>>,
    state: watch::Sender<SessionState>,
    /// Close frame to replay to late polls.
    close_frame: parking_lot::Mutex<Option<(u16, String)>>,
    touched: Arc<Notify>,
}

struct EndpointState {
    xhr_sessions: parking_lot::Mutex<HashMap<String, Arc<XhrSession>>>,
    accept_tx: mpsc::Sender<ServerSession>,
}

/// A SockJS endpoint to nest into an axum router.
#[derive(Clone)]
pub struct SockJsEndpoint {
    state: Arc<EndpointState>,
}

impl SockJsEndpoint {
    /// Create the endpoint and the acceptor channel the application
    /// reads new sessions from.
    pub fn new() -> (Self, mpsc::Receiver<ServerSession>) {
        let (accept_tx, accept_rx) = mpsc::channel(16);
        (
            Self {
                state: Arc::new(EndpointState {
                    xhr_sessions: parking_lot::Mutex::new(HashMap::new()),
                    accept_tx,
                }),
            },
            accept_rx,
        )
    }

    /// The transport routes, relative to the mount prefix.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(greeting))
            .route("/info", get(info))
            .route("/:server/:session/websocket", get(websocket_transport))
            .route("/:server/:session/xhr", post(xhr_poll))
            .route("/:server/:session/xhr_send", post(xhr_send))
            .with_state(self.state.clone())
    }
}

async fn greeting() -> &'static str {
    "Welcome to SockJS!\n"
}

async fn info() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "websocket": true,
        "cookie_needed": false,
        "origins": ["*:*"],
        "entropy": rand::random::<u32>(),
    }))
}

// ── WebSocket transport ─────────────────────────────────────────────

async fn websocket_transport(
    ws: WebSocketUpgrade,
    Path((_server, session_id)): Path<(String, String)>,
    State(state): State<Arc<EndpointState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, session_id, state))
}

async fn handle_websocket(socket: WebSocket, session_id: String, state: Arc<EndpointState>) {
    let (mut sink, mut stream) = socket.split();

    if sink
        .send(Message::Text(Frame::Open.encode()))
        .await
        .is_err()
    {
        return;
    }

    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(64);
    let (command_tx, mut command_rx) = mpsc::channel::<Command>(64);
    let (state_tx, state_rx) = watch::channel(SessionState::Active);

    let session = ServerSession {
        id: session_id.clone(),
        inbound: inbound_rx,
        commands: command_tx,
        state: state_rx,
    };
    if state.accept_tx.send(session).await.is_err() {
        tracing::warn!(session = %session_id, "no acceptor, dropping session");
        return;
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(Command::Message(msg)) => {
                        let frame = Frame::Messages(vec![msg]).encode();
                        if sink.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    Some(Command::Close { code, reason }) => {
                        let frame = Frame::Close { code, reason }.encode();
                        let _ = sink.send(Message::Text(frame)).await;
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    None => break,
                }
            }
            _ = heartbeat.tick() => {
                if sink.send(Message::Text(Frame::Heartbeat.encode())).await.is_err() {
                    break;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match decode_client_frame(&text) {
                            Ok(batch) => {
                                for m in batch {
                                    if inbound_tx.send(m).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::debug!(session = %session_id, error = %e, "malformed client frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(session = %session_id, error = %e, "websocket read failed");
                        break;
                    }
                }
            }
        }
    }

    let _ = state_tx.send(SessionState::Closed);
    tracing::debug!(session = %session_id, "websocket session ended");
}

// ── XHR polling transport ───────────────────────────────────────────

async fn xhr_poll(
    Path((_server, session_id)): Path<(String, String)>,
    State(state): State<Arc<EndpointState>>,
) -> impl IntoResponse {
    let existing = state.xhr_sessions.lock().get(&session_id).cloned();

    let session = match existing {
        Some(session) => session,
        None => {
            let (inbound_tx, inbound_rx) = mpsc::channel::<String>(64);
            let (command_tx, command_rx) = mpsc::channel::<Command>(64);
            let (state_tx, state_rx) = watch::channel(SessionState::Active);
            let touched = Arc::new(Notify::new());

            let xhr = Arc::new(XhrSession {
                inbound: inbound_tx,
                commands: Arc::new(tokio::sync::Mutex::new(command_rx)),
                state: state_tx,
                close_frame: parking_lot::Mutex::new(None),
                touched: touched.clone(),
            });
            state
                .xhr_sessions
                .lock()
                .insert(session_id.clone(), xhr.clone());

            let accepted = ServerSession {
                id: session_id.clone(),
                inbound: inbound_rx,
                commands: command_tx,
                state: state_rx,
            };
            if state.accept_tx.send(accepted).await.is_err() {
                state.xhr_sessions.lock().remove(&session_id);
                return (StatusCode::SERVICE_UNAVAILABLE, String::new());
            }

            // Expire the session when polling stops.
            let expire_state = state.clone();
            let expire_id = session_id.clone();
            let expire_session = xhr.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = touched.notified() => {}
                        _ = tokio::time::sleep(HEARTBEAT + DISCONNECT_DELAY) => {
                            tracing::debug!(session = %expire_id, "xhr session expired");
                            let _ = expire_session.state.send(SessionState::Closed);
                            expire_state.xhr_sessions.lock().remove(&expire_id);
                            break;
                        }
                    }
                }
            });

            return (StatusCode::OK, format!("{}\n", Frame::Open.encode()));
        }
    };

    session.touched.notify_one();

    if let Some((code, reason)) = session.close_frame.lock().clone() {
        return (
            StatusCode::OK,
            format!("{}\n", Frame::Close { code, reason }.encode()),
        );
    }

    // One receiving connection at a time.
    let mut commands = match session.commands.clone().try_lock_owned() {
        Ok(guard) => guard,
        Err(_) => {
            return (
                StatusCode::OK,
                format!(
                    "{}\n",
                    Frame::Close {
                        code: CLOSE_STILL_OPEN,
                        reason: "Another connection still open".into(),
                    }
                    .encode()
                ),
            );
        }
    };

    match tokio::time::timeout(HEARTBEAT, commands.recv()).await {
        Ok(Some(Command::Message(first))) => {
            let mut batch = vec![first];
            loop {
                match commands.try_recv() {
                    Ok(Command::Message(msg)) => batch.push(msg),
                    Ok(Command::Close { code, reason }) => {
                        *session.close_frame.lock() = Some((code, reason));
                        break;
                    }
                    Err(_) => break,
                }
            }
            (StatusCode::OK, format!("{}\n", Frame::Messages(batch).encode()))
        }
        Ok(Some(Command::Close { code, reason })) => {
            *session.close_frame.lock() = Some((code, reason.clone()));
            let _ = session.state.send(SessionState::Closed);
            (
                StatusCode::OK,
                format!("{}\n", Frame::Close { code, reason }.encode()),
            )
        }
        Ok(None) => {
            *session.close_frame.lock() = Some((CLOSE_GO_AWAY, "Go away!".into()));
            let _ = session.state.send(SessionState::Closed);
            (
                StatusCode::OK,
                format!(
                    "{}\n",
                    Frame::Close {
                        code: CLOSE_GO_AWAY,
                        reason: "Go away!".into(),
                    }
                    .encode()
                ),
            )
        }
        Err(_elapsed) => (StatusCode::OK, format!("{}\n", Frame::Heartbeat.encode())),
    }
}

async fn xhr_send(
    Path((_server, session_id)): Path<(String, String)>,
    State(state): State<Arc<EndpointState>>,
    body: String,
) -> impl IntoResponse {
    let session = match state.xhr_sessions.lock().get(&session_id).cloned() {
        Some(s) => s,
        None => return StatusCode::NOT_FOUND,
    };
    session.touched.notify_one();

    let batch = match decode_client_frame(&body) {
        Ok(batch) => batch,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR,
    };
    for msg in batch {
        if session.inbound.send(msg).await.is_err() {
            return StatusCode::NOT_FOUND;
        }
    }
    StatusCode::NO_CONTENT
}
