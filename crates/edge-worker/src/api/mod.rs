pub mod routes;

use crate::state::WorkerState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

/// Path prefix reserved for the worker's own endpoints. Everything else is
/// intercepted.
pub const CONTROL_PREFIX: &str = "/__edge";

/// Build the worker router
pub fn router(state: WorkerState) -> Router {
    Router::new()
        .route("/__edge/healthz", get(routes::healthz))
        .route("/__edge/metrics", get(routes::metrics))
        .route("/__edge/v1/config", post(routes::configure))
        .route(
            "/__edge/v1/connectivity",
            get(routes::connectivity).put(routes::set_connectivity),
        )
        .fallback(routes::intercept)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
