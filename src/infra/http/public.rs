use std::sync::Arc;

use axum::{
    Router,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};

use crate::{
    cache::{CacheCoordinator, gate_cache_layer},
    infra::upstream::{UpstreamRenderer, proxy_to_upstream},
};

use super::middleware::{log_responses, set_request_context};

/// Liveness probe path, answered without touching the cache or the origin.
pub const HEALTH_PATH: &str = "/_ppsc/health";

/// Router whose every unmatched request is forwarded to the origin.
pub fn upstream_router(upstream: Arc<UpstreamRenderer>) -> Router {
    Router::new()
        .fallback(proxy_to_upstream)
        .with_state(upstream)
}

/// Wrap `renderer` with the gate-aware cache.
///
/// Layer order, outermost first: request context, response logging, cache.
pub fn build_router(coordinator: Arc<CacheCoordinator>, renderer: Router) -> Router {
    renderer
        .layer(middleware::from_fn_with_state(coordinator, gate_cache_layer))
        .route(HEALTH_PATH, get(health))
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn health() -> Response {
    StatusCode::NO_CONTENT.into_response()
}
