//! SockJS protocol 0.3 plumbing for kite sessions.
//!
//! The client prefers a raw WebSocket and falls back to XHR polling on
//! the well-known bad-handshake signal; the server side mounts as an
//! axum router and hands accepted sessions to the application. One
//! SockJS text frame carries exactly one application message.

pub mod client;
pub mod frame;
pub mod server;
pub mod url;
mod xhr;

pub use client::{ClientSession, SessionSender, SessionState, Transport};
pub use frame::{Frame, FrameError, CLOSE_GO_AWAY, CLOSE_STILL_OPEN};
pub use server::{ServerSender, ServerSession, SessionClosed, SockJsEndpoint};

#[derive(Debug, thiserror::Error)]
pub enum SockJsError {
    #[error("bad url: {0}")]
    BadUrl(String),
    #[error("websocket: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("xhr: {0}")]
    Xhr(#[from] reqwest::Error),
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("session closed")]
    Closed,
}
