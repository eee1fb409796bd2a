use std::net::SocketAddr;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderName, HeaderValue};
use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tower_http::trace::{DefaultOnFailure, DefaultOnResponse};
use tower_http::LatencyUnit;

pub mod dispatch;
mod gate;
mod health;
pub mod pages;
mod redirect;
mod sse;
pub mod tls;

pub use tls::{ConnLimits, TlsError};

use crate::ServiceState;

const STATUS_PREFIX: &str = "/_status";

/// Maximum request body size in bytes (10 MB)
pub const MAX_BODY_SIZE_BYTES: usize = 10 * 1024 * 1024;

/// Maximum request head size on the main listener (1 MiB)
pub const MAX_HEADER_BYTES: usize = 1024 * 1024;

/// Sent with every page unless auto-refresh is on or they were switched off.
pub const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("x-xss-protection", "1; mode=block"),
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "SAMEORIGIN"),
    (
        "content-security-policy",
        "connect-src 'self'; object-src 'self'; form-action 'self'",
    ),
];

fn trace_layer(log_level: tracing::Level) -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
        .on_response(
            DefaultOnResponse::new()
                .include_headers(false)
                .level(log_level)
                .latency_unit(LatencyUnit::Micros),
        )
        .on_failure(DefaultOnFailure::new().latency_unit(LatencyUnit::Micros))
}

/// The main site: status routes, then the gate, then the dispatcher.
pub fn router(state: ServiceState) -> Router {
    let config = state.config();
    let server_name = HeaderValue::from_str(&config.server_name)
        .unwrap_or_else(|_| HeaderValue::from_static(common::version::SERVER_NAME));

    let mut router = Router::new()
        .nest(STATUS_PREFIX, health::router(state.clone()))
        .fallback(dispatch::handler)
        .layer(from_fn_with_state(state.clone(), gate::gate))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE_BYTES));

    if config.security_headers && !config.auto_refresh {
        for &(name, value) in SECURITY_HEADERS {
            router = router.layer(SetResponseHeaderLayer::if_not_present(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            ));
        }
    }

    router
        .layer(SetResponseHeaderLayer::overriding(header::SERVER, server_name))
        .layer(TimeoutLayer::new(config.request_timeout))
        .with_state(state.clone())
        .layer(trace_layer(tracing::Level::INFO))
}

/// The event server. Streams stay open, so there is no request timeout here.
pub fn event_router(state: ServiceState) -> Router {
    let event_path = state.config().event_path.clone();
    Router::new()
        .route(&event_path, get(sse::handler))
        .with_state(state)
        .layer(trace_layer(tracing::Level::DEBUG))
}

/// Plain HTTP listener that sends everyone to HTTPS.
/// Used on :80 in production mode when `redirect_http` is set.
pub fn redirect_router() -> Router {
    Router::new()
        .fallback(redirect::to_https)
        .layer(trace_layer(tracing::Level::DEBUG))
}

/// Serve HTTP/1 on `listener` until `shutdown_rx` fires, then drain.
/// No limits on the request head beyond hyper's defaults.
pub async fn serve_http(
    listener: TcpListener,
    router: Router,
    mut shutdown_rx: watch::Receiver<()>,
) -> Result<(), HttpServerError> {
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown_rx.changed().await;
    })
    .await?;

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    #[error("an error occurred running the HTTP server: {0}")]
    ServingFailed(#[from] std::io::Error),
    #[error(transparent)]
    Tls(#[from] TlsError),
}
