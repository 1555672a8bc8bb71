//! Reverse-proxy renderer: forwards public requests to the origin.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, Request, header},
    response::Response,
};
use reqwest::{Client, Url, redirect::Policy};
use tracing::debug;

use crate::application::error::AppError;

use super::error::InfraError;

const MAX_FORWARDED_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers scoped to a single connection, never forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    HeaderName::from_static("keep-alive"),
];

pub struct UpstreamRenderer {
    client: Client,
    origin: Url,
}

impl UpstreamRenderer {
    pub fn new(origin: Url) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(concat!("ppsc/", env!("CARGO_PKG_VERSION")))
            .redirect(Policy::none())
            .build()
            .map_err(|err| InfraError::upstream(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client, origin })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    fn target(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = under_base(&self.origin, path);
        url.set_query(query);
        url
    }

    /// Forward `request` and buffer the origin's answer.
    pub async fn forward(&self, request: Request<Body>) -> Result<Response, InfraError> {
        let (parts, body) = request.into_parts();
        let url = self.target(parts.uri.path(), parts.uri.query());

        let body = axum::body::to_bytes(body, MAX_FORWARDED_BODY_BYTES)
            .await
            .map_err(|err| InfraError::upstream(format!("failed to read request body: {err}")))?;

        let mut headers = strip_hop_by_hop(parts.headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        // Identity bodies can be classified and annotated.
        headers.remove(header::ACCEPT_ENCODING);

        debug!(
            target = "ppsc::infra::upstream",
            method = %parts.method,
            url = %url,
            "forwarding request to origin"
        );

        let upstream = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|err| InfraError::upstream(format!("origin request failed: {err}")))?;

        let status = upstream.status();
        let headers = strip_hop_by_hop(upstream.headers().clone());
        let bytes = upstream
            .bytes()
            .await
            .map_err(|err| InfraError::upstream(format!("origin body failed: {err}")))?;

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response.headers_mut().remove(header::CONTENT_LENGTH);
        Ok(response)
    }
}

/// Append `path` to the base's own path. Scheme, host and port always come
/// from `base`, so a path like `//other.host/x` stays on the origin.
pub(crate) fn under_base(base: &Url, path: &str) -> Url {
    let (path, query) = match path.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path, None),
    };
    let mut url = base.clone();
    let prefix = base.path().trim_end_matches('/');
    let suffix = path.trim_start_matches('/');
    url.set_path(&format!("{prefix}/{suffix}"));
    url.set_query(query);
    url.set_fragment(None);
    url
}

fn strip_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers
}

/// Fallback handler of the public router.
pub async fn proxy_to_upstream(
    State(upstream): State<Arc<UpstreamRenderer>>,
    request: Request<Body>,
) -> Result<Response, AppError> {
    upstream.forward(request).await.map_err(AppError::from)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn target_keeps_path_and_query() {
        let renderer = UpstreamRenderer::new(Url::parse("http://origin.test:8080/").unwrap())
            .expect("client");
        let url = renderer.target("/members/report", Some("preview=1"));
        assert_eq!(url.as_str(), "http://origin.test:8080/members/report?preview=1");
    }

    #[test]
    fn scheme_relative_paths_stay_on_the_origin() {
        let renderer =
            UpstreamRenderer::new(Url::parse("http://origin.test/").unwrap()).expect("client");
        let url = renderer.target("//evil.example/steal", None);
        assert_eq!(url.host_str(), Some("origin.test"));
        assert_eq!(url.as_str(), "http://origin.test/evil.example/steal");

        let url = renderer.target("/\\evil.example/steal", Some("a=1"));
        assert_eq!(url.host_str(), Some("origin.test"));
    }

    #[test]
    fn origin_base_path_is_kept() {
        let renderer = UpstreamRenderer::new(Url::parse("http://origin.test/site/").unwrap())
            .expect("client");
        let url = renderer.target("/members/report", None);
        assert_eq!(url.as_str(), "http://origin.test/site/members/report");

        let root = Url::parse("http://origin.test").unwrap();
        assert_eq!(under_base(&root, "/").as_str(), "http://origin.test/");
        assert_eq!(under_base(&root, "/?p=42").as_str(), "http://origin.test/?p=42");
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::COOKIE, HeaderValue::from_static("a=b"));

        let kept = strip_hop_by_hop(headers);
        assert!(kept.get(header::CONNECTION).is_none());
        assert!(kept.get("keep-alive").is_none());
        assert_eq!(kept.get(header::COOKIE).unwrap(), "a=b");
    }
}
