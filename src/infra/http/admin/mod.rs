mod cache;
mod state;

pub use state::AdminState;

use axum::{
    Router,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};

use super::middleware::{log_responses, set_request_context};

/// Operator endpoints. Every route checks privileged access itself.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/cache", get(cache::cache_coverage))
        .route("/cache/log", get(cache::cache_log))
        .route("/cache/actions", post(cache::cache_action))
        .route("/_health", get(admin_health))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn admin_health() -> Response {
    StatusCode::NO_CONTENT.into_response()
}
