mod hooks;
pub mod utils;

use std::net::SocketAddr;
use std::time::Duration;

use futures::future::join_all;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub use hooks::ShutdownHooks;

use crate::http_server::{self, HttpServerError, TlsError};
use crate::service_config::ProtocolMode;
use crate::service_state::StateError;
use crate::{ServiceConfig, ServiceState};

/// Port of the plain HTTP listener in production mode.
const PLAIN_HTTP_PORT: u16 = 80;

/// Where the servers ended up listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Listening {
    pub main: SocketAddr,
    pub events: Option<SocketAddr>,
    /// Plain HTTP listener next to HTTPS in production mode.
    pub plain: Option<SocketAddr>,
    /// Whether the main listener speaks TLS.
    pub tls: bool,
}

/// Handle for gracefully shutting down the server.
pub struct ShutdownHandle {
    graceful_waiter: JoinHandle<()>,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<()>,
    ready_rx: Option<oneshot::Receiver<Listening>>,
    hooks: ShutdownHooks,
    drain_timeout: Duration,
}

impl ShutdownHandle {
    /// Block until the servers shut down (via signal or explicit shutdown),
    /// then run the shutdown hooks.
    pub async fn wait(self) {
        let _ = self.graceful_waiter.await;
        tracing::info!("shutting down");

        let aborts: Vec<_> = self.handles.iter().map(|h| h.abort_handle()).collect();
        if timeout(self.drain_timeout, join_all(self.handles))
            .await
            .is_err()
        {
            tracing::error!(
                "Failed to shut down within {} seconds, closing remaining connections",
                self.drain_timeout.as_secs()
            );
            for abort in aborts {
                abort.abort();
            }
        }

        self.hooks.run();
    }

    /// Trigger shutdown programmatically.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// A sender that triggers shutdown when sent to, usable while [`Self::wait`] runs.
    pub fn done(&self) -> watch::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Resolves once every listener is bound and accepting. Can be taken once.
    pub fn ready(&mut self) -> Option<oneshot::Receiver<Listening>> {
        self.ready_rx.take()
    }

    pub fn hooks(&self) -> &ShutdownHooks {
        &self.hooks
    }
}

/// Initialize logging, panic handler, and build info reporting.
/// Returns guards that must be kept alive for the duration of the program.
fn init_logging(
    service_config: &ServiceConfig,
) -> Vec<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::fmt::format::FmtSpan;

    let mut guards = Vec::new();

    // Stdout layer
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);

    let stdout_env_filter = EnvFilter::builder()
        .with_default_directive(service_config.log_level.into())
        .from_env_lossy();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .with_filter(stdout_env_filter);

    // File layer (if log_dir is set)
    if let Some(log_dir) = &service_config.log_dir {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!(
                "Warning: Failed to create log directory {:?}: {}",
                log_dir, e
            );
        }

        let file_appender = tracing_appender::rolling::daily(log_dir, "livesite.log");
        let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        guards.push(file_guard);

        let file_env_filter = EnvFilter::builder()
            .with_default_directive(service_config.log_level.into())
            .from_env_lossy();

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(file_env_filter);

        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry().with(stdout_layer).init();
    }

    utils::register_panic_logger();
    utils::report_build_info();

    guards
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, SupervisorError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| SupervisorError::Bind { addr, source: e })
}

fn spawn_server<F>(name: &'static str, server: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = Result<(), HttpServerError>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = server.await {
            tracing::error!("{} server error: {}", name, e);
        }
    })
}

/// Build state from config and start everything. See [`start_with_state`].
pub async fn start_service(
    service_config: &ServiceConfig,
) -> Result<(ServiceState, ShutdownHandle), SupervisorError> {
    let state = ServiceState::from_config(service_config)?;
    let handle = start_with_state(state.clone()).await?;
    Ok((state, handle))
}

/// Bind the listeners for the configured protocol mode and spawn the servers,
/// the event server and the filesystem watcher.
///
/// In the default mode a TLS setup failure falls back to plain HTTP. In
/// production mode TLS and the plain :80 listener are required; :80 serves
/// the site, or redirects to HTTPS when `redirect_http` is set.
pub async fn start_with_state(state: ServiceState) -> Result<ShutdownHandle, SupervisorError> {
    let (ready_tx, ready_rx) = oneshot::channel();
    let (graceful_waiter, shutdown_tx, shutdown_rx) = utils::graceful_shutdown_blocker();

    let mut handles = Vec::new();
    let listening = match launch(&state, &shutdown_rx, &mut handles).await {
        Ok(listening) => listening,
        Err(e) => {
            // stop whatever already started
            let _ = shutdown_tx.send(());
            let _ = graceful_waiter.await;
            join_all(handles).await;
            return Err(e);
        }
    };

    tracing::info!(
        addr = %listening.main,
        tls = listening.tls,
        events = ?listening.events,
        root = %state.serve_root().display(),
        "serving"
    );
    let _ = ready_tx.send(listening);

    Ok(ShutdownHandle {
        graceful_waiter,
        handles,
        shutdown_tx,
        ready_rx: Some(ready_rx),
        hooks: ShutdownHooks::new(),
        drain_timeout: state.config().shutdown_timeout,
    })
}

async fn launch(
    state: &ServiceState,
    shutdown_rx: &watch::Receiver<()>,
    handles: &mut Vec<JoinHandle<()>>,
) -> Result<Listening, SupervisorError> {
    let config = state.config();
    let router = http_server::router(state.clone());
    let limits = http_server::ConnLimits::new(config.request_timeout);

    let (main, tls) = match config.protocol {
        ProtocolMode::HttpOnly => {
            let listener = bind(config.listen_addr).await?;
            let addr = listener.local_addr()?;
            handles.push(spawn_server(
                "HTTP",
                http_server::tls::serve_connections(
                    listener,
                    router.clone(),
                    None,
                    false,
                    limits,
                    shutdown_rx.clone(),
                ),
            ));
            (addr, false)
        }
        ProtocolMode::Http2Only => {
            let acceptor = match config.tls_files() {
                Some((cert, key)) => Some(TlsAcceptor::from(http_server::tls::server_config(
                    cert, key, true,
                )?)),
                None => None,
            };
            let tls = acceptor.is_some();
            let listener = bind(config.listen_addr).await?;
            let addr = listener.local_addr()?;
            handles.push(spawn_server(
                "HTTP/2",
                http_server::tls::serve_connections(
                    listener,
                    router.clone(),
                    acceptor,
                    true,
                    limits,
                    shutdown_rx.clone(),
                ),
            ));
            (addr, tls)
        }
        ProtocolMode::Default => {
            let acceptor = match config.tls_files() {
                Some((cert, key)) => match http_server::tls::server_config(cert, key, false) {
                    Ok(server_config) => Some(TlsAcceptor::from(server_config)),
                    Err(e) => {
                        tracing::warn!(error = %e, "TLS setup failed, falling back to plain HTTP");
                        None
                    }
                },
                None => None,
            };
            let tls_listener = match acceptor {
                Some(acceptor) => match bind(config.listen_addr).await {
                    Ok(listener) => Some((listener, acceptor)),
                    Err(e) => {
                        tracing::warn!(error = %e, "HTTPS bind failed, falling back to plain HTTP");
                        None
                    }
                },
                None => None,
            };
            match tls_listener {
                Some((listener, acceptor)) => {
                    let addr = listener.local_addr()?;
                    handles.push(spawn_server(
                        "HTTPS",
                        http_server::tls::serve_connections(
                            listener,
                            router.clone(),
                            Some(acceptor),
                            false,
                            limits,
                            shutdown_rx.clone(),
                        ),
                    ));
                    (addr, true)
                }
                None => {
                    let listener = bind(config.listen_addr).await?;
                    let addr = listener.local_addr()?;
                    handles.push(spawn_server(
                        "HTTP",
                        http_server::tls::serve_connections(
                            listener,
                            router.clone(),
                            None,
                            false,
                            limits,
                            shutdown_rx.clone(),
                        ),
                    ));
                    (addr, false)
                }
            }
        }
        ProtocolMode::Production => {
            let (cert, key) = config.tls_files().ok_or(SupervisorError::TlsRequired)?;
            let acceptor = TlsAcceptor::from(http_server::tls::server_config(cert, key, false)?);
            let listener = bind(config.listen_addr).await?;
            let addr = listener.local_addr()?;
            handles.push(spawn_server(
                "HTTPS",
                http_server::tls::serve_connections(
                    listener,
                    router.clone(),
                    Some(acceptor),
                    false,
                    limits,
                    shutdown_rx.clone(),
                ),
            ));
            (addr, true)
        }
    };

    let plain = if config.protocol == ProtocolMode::Production {
        let plain_addr = SocketAddr::new(config.listen_addr.ip(), PLAIN_HTTP_PORT);
        let listener = bind(plain_addr).await?;
        let addr = listener.local_addr()?;
        if config.redirect_http {
            handles.push(spawn_server(
                "redirect",
                http_server::serve_http(
                    listener,
                    http_server::redirect_router(),
                    shutdown_rx.clone(),
                ),
            ));
        } else {
            handles.push(spawn_server(
                "HTTP",
                http_server::tls::serve_connections(
                    listener,
                    router,
                    None,
                    false,
                    limits,
                    shutdown_rx.clone(),
                ),
            ));
        }
        Some(addr)
    } else {
        None
    };

    let events = if config.auto_refresh {
        let listener = bind(config.event_listen_addr).await?;
        let addr = listener.local_addr()?;
        handles.push(spawn_server(
            "event",
            http_server::serve_http(
                listener,
                http_server::event_router(state.clone()),
                shutdown_rx.clone(),
            ),
        ));

        let root = state.serve_root().to_path_buf();
        let log = state.events().clone();
        let watch_rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = common::events::watch(root, log, watch_rx).await {
                tracing::error!("filesystem watcher error: {}", e);
            }
        }));
        Some(addr)
    } else {
        None
    };

    Ok(Listening {
        main,
        events,
        plain,
        tls,
    })
}

/// Runs the server until a shutdown signal is received. Use for CLI binary usage.
pub async fn spawn_service(service_config: &ServiceConfig) {
    let _guards = init_logging(service_config);
    let handle = match start_service(service_config).await {
        Ok((_, handle)) => handle,
        Err(e) => {
            tracing::error!("error starting server: {}", e);
            std::process::exit(3);
        }
    };
    handle.wait().await;
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("error creating server state: {0}")]
    State(#[from] StateError),
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("production mode requires a certificate and key")]
    TlsRequired,
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
