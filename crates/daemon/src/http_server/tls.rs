//! Main site serving on top of hyper
//!
//! The main listener, with or without TLS, is accepted here and handed to
//! hyper directly so the request head can be bounded in size and time. The
//! event and redirect listeners go through `axum::serve`.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;

use super::HttpServerError;

/// Bounds on the request head of every main-site connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnLimits {
    /// Largest request head (or HTTP/2 header list) in bytes.
    pub max_header_bytes: usize,
    /// Time a client gets to send the whole request head.
    pub header_read_timeout: Duration,
}

impl ConnLimits {
    pub fn new(header_read_timeout: Duration) -> Self {
        Self {
            max_header_bytes: super::MAX_HEADER_BYTES,
            header_read_timeout,
        }
    }

    fn header_list_size(&self) -> u32 {
        u32::try_from(self.max_header_bytes).unwrap_or(u32::MAX)
    }
}

/// Load a PEM certificate chain and key into a server config offering
/// HTTP/2 and, unless `http2_only`, HTTP/1.1 through ALPN.
pub fn server_config(
    cert: &Path,
    key: &Path,
    http2_only: bool,
) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    let certs = rustls_pemfile::certs(&mut open(cert)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Read {
            path: cert.to_path_buf(),
            source: e,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(cert.to_path_buf()));
    }
    let private_key = rustls_pemfile::private_key(&mut open(key)?)
        .map_err(|e| TlsError::Read {
            path: key.to_path_buf(),
            source: e,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(key.to_path_buf()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, private_key)?;
    config.alpn_protocols = if http2_only {
        vec![b"h2".to_vec()]
    } else {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    };
    Ok(Arc::new(config))
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| TlsError::Read {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Accept connections until shutdown, then wait for open ones to finish.
///
/// With `tls` unset the connections are cleartext: HTTP/1 or prior-knowledge
/// h2c, or h2c only when `http2_only` is set.
pub async fn serve_connections(
    listener: TcpListener,
    router: Router,
    tls: Option<TlsAcceptor>,
    http2_only: bool,
    limits: ConnLimits,
    mut shutdown_rx: watch::Receiver<()>,
) -> Result<(), HttpServerError> {
    let mut connections = JoinSet::new();

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to accept connection");
                    continue;
                }
            },
        };

        let router = router.clone();
        let tls = tls.clone();
        let shutdown = shutdown_rx.clone();
        connections.spawn(async move {
            match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => {
                        serve_connection(stream, peer, router, http2_only, limits, shutdown).await
                    }
                    Err(e) => tracing::debug!(%peer, error = %e, "TLS handshake failed"),
                },
                None => serve_connection(stream, peer, router, http2_only, limits, shutdown).await,
            }
        });

        // reap finished connections
        while connections.try_join_next().is_some() {}
    }

    tracing::debug!(open = connections.len(), "draining connections");
    while connections.join_next().await.is_some() {}
    Ok(())
}

async fn serve_connection<I>(
    stream: I,
    peer: SocketAddr,
    router: Router,
    http2_only: bool,
    limits: ConnLimits,
    mut shutdown: watch::Receiver<()>,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = hyper::service::service_fn(move |mut request: hyper::Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(peer));
        router.clone().oneshot(request)
    });

    macro_rules! drive {
        ($conn:expr) => {{
            let conn = $conn;
            tokio::pin!(conn);
            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        tracing::debug!(%peer, error = %e, "connection error");
                    }
                }
                _ = shutdown.changed() => {
                    conn.as_mut().graceful_shutdown();
                    if let Err(e) = conn.await {
                        tracing::debug!(%peer, error = %e, "connection error during shutdown");
                    }
                }
            }
        }};
    }

    if http2_only {
        let mut builder = hyper::server::conn::http2::Builder::new(TokioExecutor::new());
        builder
            .timer(TokioTimer::new())
            .max_header_list_size(limits.header_list_size());
        drive!(builder.serve_connection(io, service));
    } else {
        let mut builder = auto::Builder::new(TokioExecutor::new());
        // oversized heads get a 431, slow ones are dropped
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(limits.header_read_timeout)
            .max_buf_size(limits.max_header_bytes);
        builder
            .http2()
            .timer(TokioTimer::new())
            .max_header_list_size(limits.header_list_size());
        drive!(builder.serve_connection_with_upgrades(io, service));
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no certificates found in {0:?}")]
    NoCertificates(PathBuf),
    #[error("no private key found in {0:?}")]
    NoPrivateKey(PathBuf),
    #[error("invalid TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),
}
