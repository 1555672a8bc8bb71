//! Classification of captured renders.
//!
//! A render is only worth persisting when it is the unlocked page. The default
//! [`MarkerClassifier`] looks for the password-form marker the rendering
//! pipeline emits while a resource is still locked, then applies the generic
//! storability rules (status, cookies, streaming, encoding).

use axum::http::{
    HeaderMap, StatusCode,
    header::{CONTENT_ENCODING, CONTENT_TYPE, SET_COOKIE},
};
use bytes::Bytes;

/// A fully buffered render.
#[derive(Debug, Clone)]
pub struct CapturedRender {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CapturedRender {
    /// Whether the body is HTML (or untyped) and can carry a comment prefix.
    pub fn is_html(&self) -> bool {
        if has_content_encoding(&self.headers) {
            return false;
        }
        match self
            .headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
        {
            Some(value) => value.trim_start().starts_with("text/html"),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Cacheable,
    /// The lock marker is present although the gate reported unlocked.
    StillLocked,
    Ineligible(IneligibleReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IneligibleReason {
    Status(StatusCode),
    SetsCookie,
    Streaming,
    Encoded,
    /// Typed as something other than HTML; hits are always served as HTML.
    NotHtml,
    TooLarge,
}

impl IneligibleReason {
    pub fn describe(&self) -> String {
        match self {
            IneligibleReason::Status(status) => format!("status {}", status.as_u16()),
            IneligibleReason::SetsCookie => "response sets a cookie".to_string(),
            IneligibleReason::Streaming => "streaming response".to_string(),
            IneligibleReason::Encoded => "content-encoded body".to_string(),
            IneligibleReason::NotHtml => "not an HTML document".to_string(),
            IneligibleReason::TooLarge => "body exceeds capture limit".to_string(),
        }
    }
}

pub trait RenderClassifier: Send + Sync {
    fn classify(&self, render: &CapturedRender) -> Classification;
}

/// Marker substring scan followed by storability checks.
#[derive(Debug, Clone)]
pub struct MarkerClassifier {
    marker: Vec<u8>,
}

impl MarkerClassifier {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into().into_bytes(),
        }
    }

    fn contains_marker(&self, body: &[u8]) -> bool {
        !self.marker.is_empty()
            && body
                .windows(self.marker.len())
                .any(|window| window == self.marker.as_slice())
    }
}

impl RenderClassifier for MarkerClassifier {
    fn classify(&self, render: &CapturedRender) -> Classification {
        if self.contains_marker(&render.body) {
            return Classification::StillLocked;
        }
        match storability(render.status, &render.headers) {
            Some(reason) => Classification::Ineligible(reason),
            None => Classification::Cacheable,
        }
    }
}

/// Reason a response with this head must not be stored, if any.
pub(crate) fn storability(status: StatusCode, headers: &HeaderMap) -> Option<IneligibleReason> {
    if !status.is_success() {
        return Some(IneligibleReason::Status(status));
    }
    if headers.contains_key(SET_COOKIE) {
        return Some(IneligibleReason::SetsCookie);
    }
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::trim_start);
    if content_type.is_some_and(|value| value.starts_with("text/event-stream")) {
        return Some(IneligibleReason::Streaming);
    }
    if has_content_encoding(headers) {
        return Some(IneligibleReason::Encoded);
    }
    if content_type.is_some_and(|value| !value.starts_with("text/html")) {
        return Some(IneligibleReason::NotHtml);
    }
    None
}

fn has_content_encoding(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| !value.trim().eq_ignore_ascii_case("identity"))
}
