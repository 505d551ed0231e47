//! The self-registration lifecycle: dial-forever, register, heartbeat,
//! re-register on reconnect, and the optional proxy hop.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kite_protocol::{KiteQuery, HEARTBEAT_INTERVAL, KONTROL_RETRY_INTERVAL};

use crate::client::RemoteFunction;
use crate::error::KiteError;
use crate::kontrol::KontrolClient;
use crate::runtime::KiteCore;

/// Start the registration loop and return the URL submission channel.
/// The loop owns the whole lifecycle: every URL pushed into the
/// channel is registered until it sticks, heartbeats keep it alive,
/// and reconnects re-submit the last URL.
pub(crate) fn start_registration(
    core: Arc<KiteCore>,
    kontrol: KontrolClient,
) -> mpsc::Sender<String> {
    let (urls_tx, mut urls_rx) = mpsc::channel::<String>(4);
    *core.register_urls.lock() = Some(urls_tx.clone());

    let loop_tx = urls_tx.clone();
    tokio::spawn(async move {
        while let Some(url) = urls_rx.recv().await {
            loop {
                if core.shutdown.is_cancelled() {
                    return;
                }
                kontrol.wait_connected().await;
                match kontrol.register(&url).await {
                    Ok((result, heartbeat)) => {
                        tracing::info!(url = %result.url, "registered to kontrol");
                        *core.last_registered_url.lock() = Some(url.clone());
                        core.signal_registered();

                        let interval = if result.heartbeat_interval > 0 {
                            Duration::from_secs(result.heartbeat_interval as u64)
                        } else {
                            HEARTBEAT_INTERVAL
                        };

                        // One heartbeat task at a time.
                        let cancel = CancellationToken::new();
                        if let Some(old) =
                            core.heartbeat_cancel.lock().replace(cancel.clone())
                        {
                            old.cancel();
                        }
                        match heartbeat {
                            Some(func) => spawn_rpc_heartbeat(func, interval, cancel),
                            None => spawn_http_heartbeat(
                                core.clone(),
                                interval,
                                url.clone(),
                                loop_tx.clone(),
                                cancel,
                            ),
                        }
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(url = %url, error = %e, "registration failed, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(KONTROL_RETRY_INTERVAL) => {}
                            _ = core.shutdown.cancelled() => return,
                        }
                    }
                }
            }
        }
    });

    urls_tx
}

/// RPC flavor: invoke the heartbeat callable kontrol handed back in
/// the register result. A failed invocation means the session died;
/// the reconnect path re-registers.
fn spawn_rpc_heartbeat(func: RemoteFunction, interval: Duration, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = func.call(vec![]).await {
                        tracing::debug!(error = %e, "heartbeat send failed");
                        return;
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    });
}

/// HTTP flavor: `GET /heartbeat?id=<kite id>` on kontrol's HTTP
/// surface. `registeragain` forces an immediate re-register, which is
/// how kontrol recovers registrations after a restart.
fn spawn_http_heartbeat(
    core: Arc<KiteCore>,
    interval: Duration,
    url: String,
    urls_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    let Some(endpoint) = heartbeat_endpoint(&core) else {
        tracing::warn!("no kontrol url, http heartbeats disabled");
        return;
    };
    let kite_id = core.identity().id;
    tokio::spawn(async move {
        let http = reqwest::Client::new();
        let mut tick = tokio::time::interval(interval);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = cancel.cancelled() => return,
            }
            let response = http
                .get(&endpoint)
                .query(&[("id", kite_id.as_str())])
                .send()
                .await;
            let body = match response {
                Ok(resp) => resp.text().await.unwrap_or_default(),
                Err(e) => {
                    tracing::debug!(error = %e, "heartbeat request failed, re-registering");
                    let _ = urls_tx.try_send(url.clone());
                    return;
                }
            };
            match body.trim() {
                "pong" => {}
                "registeragain" => {
                    tracing::info!("kontrol asked for re-registration");
                    let _ = urls_tx.try_send(url.clone());
                    return;
                }
                other => {
                    tracing::debug!(body = %other, "unexpected heartbeat response");
                }
            }
        }
    });
}

/// `http(s)://host:port/heartbeat`, derived from the kontrol URL.
fn heartbeat_endpoint(core: &KiteCore) -> Option<String> {
    let kontrol_url = core.config.kontrol_url.as_deref()?;
    let parsed = url::Url::parse(kontrol_url).ok()?;
    let host = parsed.host_str()?;
    let mut endpoint = format!("{}://{host}", parsed.scheme());
    if let Some(port) = parsed.port() {
        endpoint.push_str(&format!(":{port}"));
    }
    endpoint.push_str("/heartbeat");
    Some(endpoint)
}

/// Register through a reverse/tunnel proxy: dial the proxy, ask it to
/// `register` our local URL, and register the public URL it answers
/// with. When the proxy session drops, start over.
pub(crate) fn start_proxy_registration(
    core: Arc<KiteCore>,
    kontrol: KontrolClient,
    local_url: String,
) {
    tokio::spawn(async move {
        loop {
            if core.shutdown.is_cancelled() {
                return;
            }
            match register_through_proxy(&core, &kontrol, &local_url).await {
                Ok(proxy_client) => {
                    // Re-run the whole hop when the proxy goes away.
                    let mut state = proxy_client.state();
                    loop {
                        if *state.borrow_and_update() == crate::client::ConnState::Disconnected {
                            break;
                        }
                        if state.changed().await.is_err() {
                            break;
                        }
                    }
                    tracing::warn!("proxy connection lost, re-registering");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "proxy registration failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(KONTROL_RETRY_INTERVAL) => {}
                        _ = core.shutdown.cancelled() => return,
                    }
                }
            }
        }
    });
}

async fn register_through_proxy(
    core: &Arc<KiteCore>,
    kontrol: &KontrolClient,
    local_url: &str,
) -> Result<crate::client::Client, KiteError> {
    let proxy_client = match core.config.proxy_url.clone() {
        // Static override skips discovery.
        Some(proxy_url) => {
            let client = crate::client::Client::new(core.clone(), proxy_url);
            if let Some(key) = core.config.kite_key.clone() {
                client.set_auth(kite_protocol::Authentication::kite_key(key));
            }
            client
        }
        None => discover_proxy(core, kontrol).await?,
    };
    proxy_client.dial().await?;

    let public_url = proxy_client
        .tell("register", vec![Value::String(local_url.to_string())])
        .await?;
    let public_url = public_url
        .as_str()
        .ok_or_else(|| KiteError::InvalidResponse("proxy returned no url".into()))?
        .to_string();
    tracing::info!(local = %local_url, public = %public_url, "registered with proxy");

    let urls = core.register_urls.lock().clone();
    if let Some(urls) = urls {
        let _ = urls.send(public_url).await;
    }
    Ok(proxy_client)
}

async fn discover_proxy(
    core: &Arc<KiteCore>,
    kontrol: &KontrolClient,
) -> Result<crate::client::Client, KiteError> {
    for name in ["tunnelproxy", "proxy"] {
        let query = KiteQuery {
            username: core.config.kontrol_user.clone(),
            environment: core.config.environment.clone(),
            name: name.to_string(),
            ..Default::default()
        };
        match kontrol.get_kites(query).await {
            Ok(mut clients) if !clients.is_empty() => return Ok(clients.remove(0)),
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(name, error = %e, "proxy discovery failed");
            }
        }
    }
    Err(KiteError::Generic("no proxy kite found".into()))
}
