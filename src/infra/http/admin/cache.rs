use axum::{
    Form, Json,
    extract::State,
    http::{HeaderMap, Method},
};
use serde::{Deserialize, Serialize};

use crate::application::admin::cache::{
    ActionResult, AdminCacheError, CacheAction, CoverageRow,
};
use crate::application::error::HttpError;
use crate::cache::GateRequest;

use super::AdminState;

#[derive(Debug, Serialize)]
pub(super) struct CoveragePage {
    /// Token to echo back as `_token` on `POST /cache/actions`.
    token: String,
    resources: Vec<CoverageRow>,
}

#[derive(Debug, Serialize)]
pub(super) struct LogPage {
    lines: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ActionForm {
    action: String,
    #[serde(default)]
    resource_id: Option<String>,
    #[serde(rename = "_token", default)]
    token: String,
}

async fn is_operator(state: &AdminState, method: Method, path: &str, headers: HeaderMap) -> bool {
    let request = GateRequest {
        method,
        path: path.to_string(),
        query: None,
        headers,
    };
    state.gate.is_privileged_bypass(&request).await
}

async fn require_operator(
    state: &AdminState,
    method: Method,
    path: &str,
    headers: HeaderMap,
) -> Result<(), HttpError> {
    if is_operator(state, method, path, headers).await {
        Ok(())
    } else {
        Err(AdminCacheError::Forbidden.into())
    }
}

pub(super) async fn cache_coverage(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> Result<Json<CoveragePage>, HttpError> {
    require_operator(&state, Method::GET, "/cache", headers).await?;
    let resources = state.cache.list_coverage().await?;
    Ok(Json(CoveragePage {
        token: state.cache.action_token(),
        resources,
    }))
}

pub(super) async fn cache_log(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> Result<Json<LogPage>, HttpError> {
    require_operator(&state, Method::GET, "/cache/log", headers).await?;
    let lines = state.cache.recent_log().await?;
    Ok(Json(LogPage { lines }))
}

pub(super) async fn cache_action(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Form(form): Form<ActionForm>,
) -> Result<Json<ActionResult>, HttpError> {
    let privileged = is_operator(&state, Method::POST, "/cache/actions", headers).await;
    if !privileged {
        return Err(AdminCacheError::Forbidden.into());
    }
    let action = CacheAction::from_form(&form.action, form.resource_id.as_deref())?;
    let result = state.cache.perform(privileged, &form.token, action).await?;
    Ok(Json(result))
}
