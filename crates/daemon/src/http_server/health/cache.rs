use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::ServiceState;

const CACHE_DISABLED: &str = "Caching is disabled";

fn text(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

pub async fn stats_handler(State(state): State<ServiceState>) -> Response {
    match state.cache() {
        Some(cache) => text(cache.stats()),
        None => text(CACHE_DISABLED.to_string()),
    }
}

pub async fn clear_handler(State(state): State<ServiceState>) -> Response {
    match state.cache() {
        Some(cache) => {
            cache.clear();
            tracing::info!("cache cleared on request");
            text("Cache cleared".to_string())
        }
        None => text(CACHE_DISABLED.to_string()),
    }
}
