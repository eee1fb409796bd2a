use axum::routing::get;
use axum::Router;

use crate::ServiceState;

mod cache;
mod liveness;
mod version;

pub fn router(state: ServiceState) -> Router<ServiceState> {
    Router::new()
        .route("/livez", get(liveness::handler))
        .route("/version", get(version::handler))
        .route("/cache", get(cache::stats_handler).delete(cache::clear_handler))
        .with_state(state)
}
