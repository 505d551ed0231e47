//! Client side of a SockJS session.
//!
//! `Transport::Auto` tries a raw WebSocket first and falls back to XHR
//! polling when the server rejects the handshake. The session exposes a
//! blocking `recv`, a `send` that marshals exactly one SockJS message,
//! and an observable state so reconnection can be driven externally.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

use crate::frame::{encode_client_frame, Frame, CLOSE_GO_AWAY};
use crate::{url, xhr, SockJsError};

/// Which transport to use for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// WebSocket, falling back to XHR on a bad handshake.
    #[default]
    Auto,
    WebSocket,
    Xhr,
}

/// Observable session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Active,
    Closed,
}

/// A connected client session.
pub struct ClientSession {
    inbound: mpsc::Receiver<String>,
    outbound: mpsc::Sender<String>,
    state: watch::Receiver<SessionState>,
    cancel: CancellationToken,
}

impl ClientSession {
    /// Dial `base` (an `http`/`https` URL such as
    /// `http://example.com:3636/kite`) and complete the SockJS open
    /// handshake.
    pub async fn connect(base: &str, transport: Transport) -> Result<Self, SockJsError> {
        let server_id = url::random_server_id();
        let session_id = url::random_session_id();
        match transport {
            Transport::WebSocket => Self::connect_ws(base, &server_id, &session_id).await,
            Transport::Xhr => Self::connect_xhr(base, &server_id, &session_id).await,
            Transport::Auto => {
                match Self::connect_ws(base, &server_id, &session_id).await {
                    Ok(session) => Ok(session),
                    // The bad-handshake signal: the endpoint answered,
                    // but not with an upgrade. Anything else (refused
                    // connection, dns) is a real failure.
                    Err(SockJsError::WebSocket(err))
                        if matches!(*err, WsError::Http(_) | WsError::Protocol(_)) =>
                    {
                        tracing::debug!(error = %err, "websocket handshake rejected, falling back to xhr");
                        Self::connect_xhr(base, &server_id, &session_id).await
                    }
                    Err(other) => Err(other),
                }
            }
        }
    }

    async fn connect_ws(
        base: &str,
        server_id: &str,
        session_id: &str,
    ) -> Result<Self, SockJsError> {
        let ws_url = url::websocket_url(base, server_id, session_id)?;
        let (ws, _response) = tokio_tungstenite::connect_async(ws_url.as_str())
            .await
            .map_err(|e| SockJsError::WebSocket(Box::new(e)))?;
        let (mut sink, mut stream) = ws.split();

        let (inbound_tx, inbound_rx) = mpsc::channel::<String>(64);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);
        let (state_tx, state_rx) = watch::channel(SessionState::Opening);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = stream.next() => {
                        let text = match msg {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                tracing::debug!(error = %e, "websocket read failed");
                                break;
                            }
                        };
                        match Frame::parse(&text) {
                            Ok(Frame::Open) => {
                                let _ = state_tx.send(SessionState::Active);
                            }
                            Ok(Frame::Heartbeat) => {}
                            Ok(Frame::Messages(batch)) => {
                                for msg in batch {
                                    if inbound_tx.send(msg).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Ok(Frame::Close { code, reason }) => {
                                tracing::debug!(code, reason = %reason, "session closed by peer");
                                break;
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "skipping malformed frame");
                            }
                        }
                    }
                    out = outbound_rx.recv() => {
                        match out {
                            Some(msg) => {
                                let frame = encode_client_frame(&[msg]);
                                if sink.send(Message::Text(frame)).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = task_cancel.cancelled() => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(CLOSE_GO_AWAY),
                                reason: "Go away!".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
            let _ = state_tx.send(SessionState::Closed);
        });

        Ok(Self {
            inbound: inbound_rx,
            outbound: outbound_tx,
            state: state_rx,
            cancel,
        })
    }

    async fn connect_xhr(
        base: &str,
        server_id: &str,
        session_id: &str,
    ) -> Result<Self, SockJsError> {
        xhr::connect(base, server_id, session_id).await
    }

    pub(crate) fn from_parts(
        inbound: mpsc::Receiver<String>,
        outbound: mpsc::Sender<String>,
        state: watch::Receiver<SessionState>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inbound,
            outbound,
            state,
            cancel,
        }
    }

    /// Next application message; `None` once the session is closed and
    /// drained.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    /// Queue exactly one SockJS message.
    pub async fn send(&self, msg: impl Into<String>) -> Result<(), SockJsError> {
        self.outbound
            .send(msg.into())
            .await
            .map_err(|_| SockJsError::Closed)
    }

    /// A cheap handle for sending from other tasks.
    pub fn sender(&self) -> SessionSender {
        SessionSender {
            outbound: self.outbound.clone(),
        }
    }

    /// Observable state; subscribe to drive reconnection.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn is_active(&self) -> bool {
        *self.state.borrow() == SessionState::Active
    }

    /// Tear the session down. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Clonable send-half of a [`ClientSession`].
#[derive(Clone)]
pub struct SessionSender {
    outbound: mpsc::Sender<String>,
}

impl SessionSender {
    pub async fn send(&self, msg: impl Into<String>) -> Result<(), SockJsError> {
        self.outbound
            .send(msg.into())
            .await
            .map_err(|_| SockJsError::Closed)
    }
}
