//! Gate-aware cache middleware.
//!
//! Wraps the rendering pipeline. The coordinator decides first; only a miss
//! lets the inner service run with its output captured. Install it innermost
//! on the public router so request logging sees the final response.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tracing::{instrument, warn};

use crate::domain::types::ResourceId;

use super::{
    audit::DecisionTrail,
    classify::{CapturedRender, IneligibleReason},
    coordinator::{CacheCoordinator, CacheOutcome, Decision, apply_locked_headers},
    gate::GateRequest,
};

/// Middleware entry point, used with `middleware::from_fn_with_state`.
///
/// Inserts the [`super::GateSnapshot`] into the request extensions and the
/// [`DecisionTrail`] into the response extensions.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn gate_cache_layer(
    State(coordinator): State<Arc<CacheCoordinator>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let gate_request = GateRequest::from_request(&request);
    let mut trail = DecisionTrail::default();
    let (snapshot, decision) = coordinator.decide(&gate_request, &mut trail).await;
    request.extensions_mut().insert(snapshot);

    let mut response = match decision {
        Decision::Passthrough => return next.run(request).await,
        Decision::Locked(_) => {
            let mut response = next.run(request).await;
            apply_locked_headers(response.headers_mut());
            coordinator.stamp(response.headers_mut(), CacheOutcome::Locked);
            response
        }
        Decision::Bypass(..) => {
            let mut response = next.run(request).await;
            coordinator.stamp(response.headers_mut(), CacheOutcome::Bypass);
            response
        }
        Decision::Hit { payload, .. } => hit_response(&coordinator, &payload),
        Decision::Miss(id) => capture(&coordinator, id, request, next, &mut trail).await,
    };

    response.extensions_mut().insert(trail);
    response
}

async fn capture(
    coordinator: &CacheCoordinator,
    id: ResourceId,
    request: Request<Body>,
    next: Next,
    trail: &mut DecisionTrail,
) -> Response {
    let flight = coordinator.begin_flight(id).await;
    if flight.is_some() {
        // Another request may have stored the entry while this one waited.
        if let Some(payload) = coordinator.lookup(id, trail).await {
            return hit_response(coordinator, &payload);
        }
    }

    let response = next.run(request).await;
    let (mut parts, body) = response.into_parts();

    let limit = coordinator.config().max_capture_bytes;
    if let Some(reason) = unbufferable(&parts.headers, limit) {
        coordinator
            .skip_uncaptured(id, &mut parts.headers, reason, false, trail)
            .await;
        return Response::from_parts(parts, body);
    }

    let bytes = match buffer_body(body, limit).await {
        Ok(Buffered::Complete(bytes)) => bytes,
        Ok(Buffered::Overflow { head, body }) => {
            let marker_seen = coordinator.shows_lock_marker(&head);
            coordinator
                .skip_uncaptured(
                    id,
                    &mut parts.headers,
                    IneligibleReason::TooLarge,
                    marker_seen,
                    trail,
                )
                .await;
            return Response::from_parts(parts, body);
        }
        Err(err) => {
            warn!(
                target = "ppsc::cache::middleware",
                id = %id,
                error = %err,
                "render body failed mid-stream"
            );
            coordinator
                .log(trail, format!("render for resource {id} failed: {err}"))
                .await;
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let render = CapturedRender {
        status: parts.status,
        headers: parts.headers.clone(),
        body: bytes,
    };
    let finalized = coordinator.finalize(id, render, trail).await;
    drop(flight);

    parts.status = finalized.render.status;
    parts.headers = finalized.render.headers;
    Response::from_parts(parts, Body::from(finalized.render.body))
}

fn hit_response(coordinator: &CacheCoordinator, payload: &Bytes) -> Response {
    let mut response = Response::new(Body::from(coordinator.hit_body(payload)));
    *response.headers_mut() = coordinator.hit_headers();
    response
}

/// Responses that are never buffered, decided from the head alone.
fn unbufferable(headers: &HeaderMap, limit: usize) -> Option<IneligibleReason> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    if content_type.is_some_and(|value| value.starts_with("text/event-stream")) {
        return Some(IneligibleReason::Streaming);
    }

    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if declared.is_some_and(|length| length > limit) {
        return Some(IneligibleReason::TooLarge);
    }
    None
}

enum Buffered {
    Complete(Bytes),
    /// Limit exceeded; `head` is what was read, `body` replays it then the rest.
    Overflow { head: Bytes, body: Body },
}

async fn buffer_body(body: Body, limit: usize) -> Result<Buffered, axum::Error> {
    let mut stream = body.into_data_stream();
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut total = 0usize;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        total += chunk.len();
        chunks.push(chunk);
        if total > limit {
            let head = concat(&chunks, total);
            let replay = futures::stream::iter(chunks.into_iter().map(Ok::<_, axum::Error>));
            return Ok(Buffered::Overflow {
                head,
                body: Body::from_stream(replay.chain(stream)),
            });
        }
    }

    Ok(Buffered::Complete(concat(&chunks, total)))
}

fn concat(chunks: &[Bytes], total: usize) -> Bytes {
    let mut buffer = BytesMut::with_capacity(total);
    for chunk in chunks {
        buffer.extend_from_slice(chunk);
    }
    buffer.freeze()
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[tokio::test]
    async fn small_bodies_are_buffered_whole() {
        let body = Body::from("<p>hello</p>");
        match buffer_body(body, 64).await.unwrap() {
            Buffered::Complete(bytes) => assert_eq!(bytes, Bytes::from_static(b"<p>hello</p>")),
            Buffered::Overflow { .. } => panic!("expected a complete buffer"),
        }
    }

    #[tokio::test]
    async fn overflow_replays_the_full_body() {
        let chunks = vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"aaaa")),
            Ok(Bytes::from_static(b"bbbb")),
            Ok(Bytes::from_static(b"cccc")),
        ];
        let body = Body::from_stream(futures::stream::iter(chunks));

        let Buffered::Overflow { head, body: rest } = buffer_body(body, 5).await.unwrap() else {
            panic!("expected overflow");
        };
        assert_eq!(head, Bytes::from_static(b"aaaabbbb"));
        let replayed = axum::body::to_bytes(rest, usize::MAX).await.unwrap();
        assert_eq!(replayed, Bytes::from_static(b"aaaabbbbcccc"));
    }

    #[test]
    fn event_streams_and_declared_oversize_are_unbufferable() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        );
        assert_eq!(
            unbufferable(&headers, 1024),
            Some(IneligibleReason::Streaming)
        );

        let mut sized = HeaderMap::new();
        sized.insert(header::CONTENT_LENGTH, HeaderValue::from_static("4096"));
        assert_eq!(unbufferable(&sized, 1024), Some(IneligibleReason::TooLarge));
        assert_eq!(unbufferable(&sized, 8192), None);
    }
}
