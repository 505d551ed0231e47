//! The kite server: SockJS endpoint at `/kite`, optional TLS, and
//! graceful shutdown/restart wiring.

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tokio_util::sync::CancellationToken;

use kite_sockjs::SockJsEndpoint;

use crate::client::Client;
use crate::config::TlsConfig;
use crate::restart;
use crate::runtime::Kite;

impl Kite {
    /// Serve the kite until [`close`](Self::close). Binds the
    /// configured address, or adopts the listener handed over by a
    /// graceful restart.
    pub async fn serve(&self) -> anyhow::Result<()> {
        self.serve_with(Router::new()).await
    }

    /// Like [`serve`](Self::serve), with extra application routes
    /// merged in (kontrol mounts its HTTP endpoints this way).
    pub async fn serve_with(&self, extra: Router) -> anyhow::Result<()> {
        let core = self.core.clone();

        let std_listener = match restart::inherited_listener()? {
            Some(listener) => {
                tracing::info!("adopted listener from predecessor");
                listener
            }
            None => std::net::TcpListener::bind((core.config.ip.as_str(), core.config.port))
                .with_context(|| {
                    format!("binding {}:{}", core.config.ip, core.config.port)
                })?,
        };
        std_listener.set_nonblocking(true)?;
        let addr = std_listener.local_addr()?;
        *core.local_addr.lock() = Some(addr);

        // Every accepted SockJS session becomes a client of ours; its
        // requests run against this kite's methods.
        let (endpoint, mut accept_rx) = SockJsEndpoint::new();
        let accept_core = core.clone();
        tokio::spawn(async move {
            while let Some(session) = accept_rx.recv().await {
                tracing::debug!(session = %session.id(), "kite session accepted");
                let client = Client::from_accepted(accept_core.clone(), session);
                let mut accepted = accept_core.accepted.lock();
                accepted.retain(|c| *c.state().borrow() != crate::client::ConnState::Disconnected);
                accepted.push(client);
            }
        });

        let app = extra.nest("/kite", endpoint.router());

        restart::spawn_restart_handler(core.clone(), &std_listener)?;
        restart::notify_ready();

        let _ = core.ready_tx.send(true);
        tracing::info!(kite = %core.identity().key(), addr = %addr, "kite serving");

        let shutdown = core.shutdown.clone();
        let result = match core.config.tls.clone() {
            None => {
                let listener = tokio::net::TcpListener::from_std(std_listener)?;
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await
                    .map_err(Into::into)
            }
            Some(tls) => serve_tls(std_listener, app, tls, shutdown).await,
        };

        let _ = core.closed_tx.send(true);
        tracing::info!(addr = %addr, "kite server stopped");
        result
    }
}

async fn serve_tls(
    listener: std::net::TcpListener,
    app: Router,
    tls: TlsConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    use tokio_rustls::rustls::ServerConfig;

    let certs = rustls_pemfile::certs(&mut tls.cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .context("parsing tls certificate")?;
    let key = rustls_pemfile::private_key(&mut tls.key_pem.as_bytes())
        .context("parsing tls key")?
        .context("no private key in pem")?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building tls config")?;
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));
    let listener = tokio::net::TcpListener::from_std(listener)?;

    loop {
        let (stream, peer) = tokio::select! {
            conn = listener.accept() => conn?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "tls handshake failed");
                    return;
                }
            };
            let service = hyper_util::service::TowerToHyperService::new(app);
            let io = hyper_util::rt::TokioIo::new(tls_stream);
            let builder =
                hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new());
            if let Err(e) = builder.serve_connection_with_upgrades(io, service).await {
                tracing::debug!(peer = %peer, error = %e, "tls connection error");
            }
        });
    }
}
