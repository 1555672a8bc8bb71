//! Contract with the access-gate collaborator.
//!
//! The coordinator never decides on its own whether a visitor may see a
//! resource. It asks a [`GateEvaluator`] and records the answers in a
//! [`GateSnapshot`], which is the only place later stages read them from.

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, Request, header::COOKIE};

use crate::domain::types::ResourceId;

/// Request facts handed to the gate.
#[derive(Debug, Clone)]
pub struct GateRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
}

impl GateRequest {
    pub fn from_request<B>(request: &Request<B>) -> Self {
        Self {
            method: request.method().clone(),
            path: request.uri().path().to_string(),
            query: request.uri().query().map(str::to_string),
            headers: request.headers().clone(),
        }
    }

    /// Value of the first cookie called `name` across all `Cookie` headers.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.trim_matches('"'))
    }

    /// Token from an `Authorization: Bearer ...` header.
    pub fn bearer_token(&self) -> Option<&str> {
        self.headers
            .get(axum::http::header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }
}

/// Access-gate collaborator.
///
/// Implementations must be free of side effects. The coordinator calls each
/// method at most once per request, in this order, and stops as soon as an
/// answer settles the outcome.
#[async_trait]
pub trait GateEvaluator: Send + Sync {
    /// Resource targeted by a single-resource view, `None` for anything else.
    async fn resolve(&self, request: &GateRequest) -> Option<ResourceId>;

    /// Whether `id` carries an access secret.
    async fn is_gated_resource(&self, id: ResourceId, request: &GateRequest) -> bool;

    /// Whether the requester has not yet satisfied the secret for `id`.
    async fn is_locked(&self, id: ResourceId, request: &GateRequest) -> bool;

    /// Whether the requester is an operator who must never see cached output.
    async fn is_privileged_bypass(&self, request: &GateRequest) -> bool;
}

/// Gate answers for one request. `None` means the question was never asked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateSnapshot {
    pub resource: Option<ResourceId>,
    pub gated: Option<bool>,
    pub locked: Option<bool>,
    pub privileged: Option<bool>,
}

impl GateSnapshot {
    pub fn is_locked(&self) -> bool {
        self.locked == Some(true)
    }
}
