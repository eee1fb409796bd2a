use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;

use common::prelude::GateError;

use super::dispatch::clean_url_path;
use super::pages;
use crate::ServiceState;

/// Runs before the dispatcher: role check, then rate limit.
///
/// The role check sees the same cleaned path the dispatcher serves. A
/// rejected request never reaches the dispatcher.
pub async fn gate(State(state): State<ServiceState>, request: Request, next: Next) -> Response {
    let theme = &state.config().theme;

    let served_path = clean_url_path(request.uri().path());
    if let Err(GateError::PermissionDenied {
        path,
        required,
        actual,
    }) = state.users().check(&served_path, request.headers())
    {
        tracing::info!(%path, %required, %actual, "permission denied");
        return match state.users().deny_handler() {
            Some(deny) => deny(request.uri()).map(Body::from),
            None => pages::forbidden(theme),
        };
    }

    if let Some(limiter) = state.limiter() {
        let client = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        if let Err(e) = limiter.check(client) {
            tracing::debug!(client = ?client, error = %e, "rate limited");
            return pages::rate_limited(theme);
        }
    }

    next.run(request).await
}
