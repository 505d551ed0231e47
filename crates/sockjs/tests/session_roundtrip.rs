//! Integration test: boots the axum-mounted SockJS endpoint on an
//! ephemeral port, connects a real [`ClientSession`] over each
//! transport, and asserts the open handshake plus bidirectional
//! message flow.

use std::time::Duration;

use kite_sockjs::{ClientSession, ServerSession, SessionState, SockJsEndpoint, Transport};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

async fn start_endpoint() -> (String, mpsc::Receiver<ServerSession>) {
    let (endpoint, accept_rx) = SockJsEndpoint::new();
    let app = axum::Router::new().nest("/kite", endpoint.router());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/kite"), accept_rx)
}

async fn echo_once(mut server: ServerSession) {
    if let Some(msg) = server.recv().await {
        server.send(format!("echo:{msg}")).await.unwrap();
    }
}

async fn roundtrip(transport: Transport) {
    let (base, mut accept_rx) = start_endpoint().await;

    let mut client = tokio::time::timeout(
        Duration::from_secs(5),
        ClientSession::connect(&base, transport),
    )
    .await
    .expect("connect timeout")
    .expect("connect failed");

    let server = tokio::time::timeout(Duration::from_secs(5), accept_rx.recv())
        .await
        .expect("accept timeout")
        .expect("no session accepted");
    tokio::spawn(echo_once(server));

    client.send("Hello world!").await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("recv timeout")
        .expect("session closed early");
    assert_eq!(reply, "echo:Hello world!");
}

#[tokio::test]
async fn websocket_roundtrip() {
    roundtrip(Transport::WebSocket).await;
}

#[tokio::test]
async fn auto_picks_websocket() {
    roundtrip(Transport::Auto).await;
}

#[tokio::test]
async fn xhr_roundtrip() {
    roundtrip(Transport::Xhr).await;
}

#[tokio::test]
async fn server_close_reaches_client() {
    let (base, mut accept_rx) = start_endpoint().await;

    let mut client = ClientSession::connect(&base, Transport::WebSocket)
        .await
        .unwrap();
    let server = tokio::time::timeout(Duration::from_secs(5), accept_rx.recv())
        .await
        .unwrap()
        .unwrap();

    server.close(kite_sockjs::CLOSE_GO_AWAY, "Go away!").await;

    // recv drains to None and the state flips to Closed.
    let end = tokio::time::timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("close timeout");
    assert_eq!(end, None);
    let mut state = client.state();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *state.borrow() != SessionState::Closed {
            state.changed().await.unwrap();
        }
    })
    .await
    .expect("state never closed");
}

#[tokio::test]
async fn client_close_is_idempotent() {
    let (base, mut accept_rx) = start_endpoint().await;
    let client = ClientSession::connect(&base, Transport::WebSocket)
        .await
        .unwrap();
    let _server = accept_rx.recv().await.unwrap();

    client.close();
    client.close(); // second close is a no-op
}
