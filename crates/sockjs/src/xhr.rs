//! XHR polling transport — the fallback when WebSocket upgrades are
//! refused. Receives by long-polling `POST <session>/xhr`, sends via
//! `POST <session>/xhr_send`.

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::client::{ClientSession, SessionState};
use crate::frame::{encode_client_frame, Frame};
use crate::{url, SockJsError};

pub(crate) async fn connect(
    base: &str,
    server_id: &str,
    session_id: &str,
) -> Result<ClientSession, SockJsError> {
    let session = url::session_url(base, server_id, session_id)?;
    let poll_url = format!("{session}/xhr");
    let send_url = format!("{session}/xhr_send");
    let http = reqwest::Client::new();

    // The first poll must answer with the open frame.
    let body = http.post(&poll_url).send().await?.text().await?;
    match Frame::parse(&body) {
        Ok(Frame::Open) => {}
        Ok(other) => {
            return Err(SockJsError::BadUrl(format!(
                "expected open frame, got {other:?}"
            )))
        }
        Err(e) => return Err(e.into()),
    }

    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(64);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);
    let (state_tx, state_rx) = watch::channel(SessionState::Active);
    let cancel = CancellationToken::new();

    // Poll loop: one in-flight receive request at a time.
    let poller_http = http.clone();
    let poller_cancel = cancel.clone();
    let poller_state = state_tx.clone();
    tokio::spawn(async move {
        loop {
            let response = tokio::select! {
                r = poller_http.post(&poll_url).send() => r,
                _ = poller_cancel.cancelled() => break,
            };
            let body = match response {
                Ok(resp) if resp.status().is_success() => match resp.text().await {
                    Ok(b) => b,
                    Err(_) => break,
                },
                _ => break,
            };
            match Frame::parse(&body) {
                Ok(Frame::Messages(batch)) => {
                    for msg in batch {
                        if inbound_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(Frame::Heartbeat) | Ok(Frame::Open) => {}
                Ok(Frame::Close { code, reason }) => {
                    tracing::debug!(code, reason = %reason, "xhr session closed by peer");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed xhr frame");
                }
            }
        }
        let _ = poller_state.send(SessionState::Closed);
    });

    // Sender loop.
    let sender_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                m = outbound_rx.recv() => match m {
                    Some(m) => m,
                    None => break,
                },
                _ = sender_cancel.cancelled() => break,
            };
            let frame = encode_client_frame(&[msg]);
            match http.post(&send_url).body(frame).send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    tracing::debug!(status = %resp.status(), "xhr_send rejected");
                    break;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "xhr_send failed");
                    break;
                }
            }
        }
        let _ = state_tx.send(SessionState::Closed);
    });

    Ok(ClientSession::from_parts(
        inbound_rx,
        outbound_tx,
        state_rx,
        cancel,
    ))
}
