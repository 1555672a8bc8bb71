use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    application::error::ErrorReport,
    cache::{CACHE_STATUS_HEADER, DecisionTrail},
};

const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");
const MAX_INBOUND_REQUEST_ID: usize = 128;

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
}

/// Reuse a sane inbound `x-request-id`, otherwise mint one; echo it back.
pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(&REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| {
            !value.is_empty()
                && value.len() <= MAX_INBOUND_REQUEST_ID
                && value
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let ctx = RequestContext {
        request_id: request_id.clone(),
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response.extensions_mut().insert(ctx);
    response
}

pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();

    let mut response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis();

    let cache = response
        .headers()
        .get(CACHE_STATUS_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    if let Some(cache) = cache.as_deref() {
        let decisions: Vec<&str> = response
            .extensions()
            .get::<DecisionTrail>()
            .map(|trail| trail.entries().iter().map(|entry| entry.message.as_str()).collect())
            .unwrap_or_default();
        debug!(
            target = "ppsc::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            cache,
            decisions = ?decisions,
            elapsed_ms,
            request_id = %request_id,
            "gated request served"
        );
    }

    if !(status.is_client_error() || status.is_server_error()) {
        return response;
    }

    let report = response.extensions_mut().remove::<ErrorReport>();
    let failure = Failure::from_report(status, report);
    if status.is_server_error() {
        error!(
            target = "ppsc::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            elapsed_ms,
            source = failure.source,
            detail = %failure.detail,
            chain = ?failure.chain,
            request_id = %request_id,
            cache = cache.as_deref().unwrap_or(""),
            "request failed"
        );
    } else {
        warn!(
            target = "ppsc::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            elapsed_ms,
            source = failure.source,
            detail = %failure.detail,
            chain = ?failure.chain,
            request_id = %request_id,
            "request rejected"
        );
    }

    response
}

struct Failure {
    source: &'static str,
    detail: String,
    chain: Vec<String>,
}

impl Failure {
    fn from_report(status: StatusCode, report: Option<ErrorReport>) -> Self {
        match report {
            Some(report) => Self {
                source: report.source,
                detail: report
                    .messages
                    .first()
                    .cloned()
                    .unwrap_or_else(|| status.to_string()),
                chain: report.messages,
            },
            // Upstream responses pass through without a report.
            None => Self {
                source: "upstream",
                detail: status.to_string(),
                chain: Vec::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{Router, middleware, routing::get};
    use tower::ServiceExt;

    use super::*;

    fn router() -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(middleware::from_fn(log_responses))
            .layer(middleware::from_fn(set_request_context))
    }

    #[tokio::test]
    async fn mints_a_request_id_when_none_is_sent() {
        let response = router()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let id = response.headers().get(&REQUEST_ID_HEADER).expect("request id");
        assert!(Uuid::parse_str(id.to_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn echoes_a_well_formed_inbound_request_id() {
        let request = Request::builder()
            .uri("/")
            .header(&REQUEST_ID_HEADER, "edge-7f3a")
            .body(Body::empty())
            .unwrap();
        let response = router().oneshot(request).await.unwrap();
        assert_eq!(response.headers().get(&REQUEST_ID_HEADER).unwrap(), "edge-7f3a");

        let request = Request::builder()
            .uri("/")
            .header(&REQUEST_ID_HEADER, "has spaces")
            .body(Body::empty())
            .unwrap();
        let response = router().oneshot(request).await.unwrap();
        assert_ne!(response.headers().get(&REQUEST_ID_HEADER).unwrap(), "has spaces");
    }
}
