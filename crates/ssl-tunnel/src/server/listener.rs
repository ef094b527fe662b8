//! TLS accept loop.
//!
//! One task per accepted connection. Each task performs the TLS handshake and
//! then serves HTTP/1.1 on the decrypted stream, handing every request to the
//! shared [`ReverseProxy`]. Failures stay inside the task that hit them.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use common::TunnelError;
use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::{TokioIo, TokioTimer};
use rustls::ServerConfig;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::Semaphore,
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use super::proxy::ReverseProxy;
use crate::config::Config;

/// Bounds of the pause after a failed `accept`, doubling while failures
/// continue.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Per-connection deadlines and the admission limit. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionLimits {
    pub handshake_timeout: Option<Duration>,
    pub client_header_timeout: Option<Duration>,
    pub max_connections: Option<usize>,
}

impl From<&Config> for ConnectionLimits {
    fn from(cfg: &Config) -> Self {
        Self {
            handshake_timeout: cfg.handshake_timeout(),
            client_header_timeout: cfg.client_header_timeout(),
            max_connections: cfg.max_connections,
        }
    }
}

/// Bind the listener described by `cfg` and proxy connections until the
/// process is killed.
///
/// # Errors
///
/// Returns an error if the backend origin is malformed or the listening
/// socket cannot be bound.
pub async fn serve(cfg: &Config, tls_config: Arc<ServerConfig>) -> Result<()> {
    let proxy = ReverseProxy::from_config(cfg)?;
    let listener = bind(cfg.listen_addr()).await?;
    run(listener, tls_config, proxy, ConnectionLimits::from(cfg)).await
}

/// Bind the TCP socket the TLS listener accepts on.
///
/// # Errors
///
/// Returns [`TunnelError::Bind`] if the address is in use or not permitted.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, TunnelError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| TunnelError::Bind(format!("{addr}: {e}")))
}

/// Accept loop: terminate TLS on each connection and proxy its requests.
///
/// Runs until the process is killed.
pub async fn run(
    listener: TcpListener,
    tls_config: Arc<ServerConfig>,
    proxy: ReverseProxy,
    limits: ConnectionLimits,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(tls_config);
    let admission = limits.max_connections.map(|n| Arc::new(Semaphore::new(n)));
    let addr = listener.local_addr().context("listener has no local address")?;
    info!(
        addr = %addr,
        backend = %proxy.route(),
        max_connections = limits.max_connections,
        "listening"
    );

    let mut backoff = None;
    loop {
        // Hold off accepting while the admission limit is reached.
        let permit = match &admission {
            Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
            None => None,
        };

        match listener.accept().await {
            Ok((tcp_stream, peer_addr)) => {
                backoff = None;
                debug!(%peer_addr, "accepted TCP connection");
                let acceptor = acceptor.clone();
                let proxy = proxy.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = handle_connection(tcp_stream, peer_addr, acceptor, proxy, limits).await {
                        debug!(%peer_addr, error = %format!("{e:#}"), "connection closed with error");
                    }
                });
            }
            Err(e) => {
                // Typically EMFILE; retrying at once would spin.
                let delay = next_backoff(backoff);
                backoff = Some(delay);
                error!(error = %e, retry_in_ms = delay.as_millis() as u64, "accept error");
                drop(permit);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn next_backoff(prev: Option<Duration>) -> Duration {
    match prev {
        None => ACCEPT_BACKOFF_MIN,
        Some(d) => (d * 2).min(ACCEPT_BACKOFF_MAX),
    }
}

/// Handshake, then serve HTTP/1.1 on one connection.
async fn handle_connection(
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    proxy: ReverseProxy,
    limits: ConnectionLimits,
) -> Result<()> {
    let handshake = acceptor.accept(tcp);
    let tls = match limits.handshake_timeout {
        Some(limit) => tokio::time::timeout(limit, handshake)
            .await
            .context("tls handshake timed out")?,
        None => handshake.await,
    }
    .context("tls handshake failed")?;
    debug!(%peer, "tls handshake complete");

    let service = service_fn(move |req| {
        let proxy = proxy.clone();
        async move { proxy.handle(req, peer).await }
    });

    let mut builder = http1::Builder::new();
    if let Some(limit) = limits.client_header_timeout {
        builder.timer(TokioTimer::new()).header_read_timeout(limit);
    }
    builder
        .serve_connection(TokioIo::new(tls), service)
        .await
        .context("http connection error")
}
