//! Resource Proxy endpoints: system info, list, inspect, actions, prune.
//!
//! Every call goes through the proxy with the gateway's retry policy, so a
//! runtime hiccup is retried before the client sees a 503.

use axum::extract::rejection::PathRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use servcur_core::{retry_transient, PruneReport, Resource, ResourceKind, SystemInfo, Verb};

use crate::api::AppState;
use crate::error::ApiResult;

pub type IdPath = Result<Path<String>, PathRejection>;
pub type ActionPath = Result<Path<(String, String)>, PathRejection>;

pub async fn system_info(State(state): State<AppState>) -> ApiResult<Json<SystemInfo>> {
    let info = retry_transient(&state.retry, "system_info", || state.proxy.system_info()).await?;
    Ok(Json(info))
}

pub async fn list(State(state): State<AppState>, kind: ResourceKind) -> ApiResult<Json<Vec<Resource>>> {
    let resources = retry_transient(&state.retry, "list", || state.proxy.list(kind)).await?;
    Ok(Json(resources))
}

pub async fn inspect(
    State(state): State<AppState>,
    path: IdPath,
    kind: ResourceKind,
) -> ApiResult<Json<serde_json::Value>> {
    let Path(id) = path?;
    let details =
        retry_transient(&state.retry, "inspect", || state.proxy.inspect(kind, &id)).await?;
    Ok(Json(details))
}

pub async fn remove(
    State(state): State<AppState>,
    path: IdPath,
    kind: ResourceKind,
) -> ApiResult<StatusCode> {
    let Path(id) = path?;
    retry_transient(&state.retry, "remove", || {
        state.proxy.action(kind, &id, Verb::Remove)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /{kind}/{id}/{verb}`.
pub async fn action(
    State(state): State<AppState>,
    path: ActionPath,
    kind: ResourceKind,
) -> ApiResult<StatusCode> {
    let Path((id, verb)) = path?;
    let verb: Verb = verb.parse()?;
    retry_transient(&state.retry, verb.as_str(), || state.proxy.action(kind, &id, verb)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn prune(State(state): State<AppState>, kind: ResourceKind) -> ApiResult<Json<PruneReport>> {
    let report = retry_transient(&state.retry, "prune", || state.proxy.prune(kind)).await?;
    Ok(Json(report))
}
