//! Project and build endpoints.

use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use servcur_core::{
    ArchivedJob, Channel, Chunk, CoreError, Dispatched, HistoryPage, JobCommand, JobId, JobRecord,
    NewProject, Project, ProjectKey, WebhookOutcome,
};

use crate::api::AppState;
use crate::error::ApiResult;

const MAX_PER_PAGE: usize = 500;

/// Query string naming a project: `?name=&branch=`.
#[derive(Debug, Deserialize)]
pub struct ProjectQuery {
    pub name: String,
    pub branch: String,
}

impl ProjectQuery {
    fn key(&self) -> ProjectKey {
        ProjectKey::new(&self.name, &self.branch)
    }
}

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub command: JobCommand,
}

#[derive(Debug, Default, Deserialize)]
pub struct SinceQuery {
    #[serde(default)]
    pub since: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub project: ProjectKey,
    pub outcome: WebhookOutcome,
}

/// A chunk as sent to clients. Output is decoded as lossy UTF-8.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkView {
    pub offset: u64,
    pub data: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&Chunk> for ChunkView {
    fn from(chunk: &Chunk) -> Self {
        Self {
            offset: chunk.offset,
            data: String::from_utf8_lossy(&chunk.data).into_owned(),
            timestamp: chunk.timestamp,
        }
    }
}

/// One-shot read of a job's output.
#[derive(Debug, Serialize)]
pub struct OutputPage {
    pub chunks: Vec<ChunkView>,
    pub next_offset: u64,
    pub lowest_offset: u64,
    pub truncated: bool,
    pub live: bool,
}

pub async fn create(
    State(state): State<AppState>,
    body: Result<Json<NewProject>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    let Json(request) = body?;
    let (project, created) = state.orchestrator.projects().create(request).await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(project)))
}

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<Project>>> {
    Ok(Json(state.orchestrator.projects().list().await?))
}

pub async fn remove(
    State(state): State<AppState>,
    query: Result<Query<ProjectQuery>, QueryRejection>,
) -> ApiResult<Json<Project>> {
    let Query(query) = query?;
    Ok(Json(state.orchestrator.projects().remove(&query.key()).await?))
}

pub async fn pull(
    State(state): State<AppState>,
    query: Result<Query<ProjectQuery>, QueryRejection>,
) -> ApiResult<Json<Project>> {
    let Query(query) = query?;
    Ok(Json(state.orchestrator.projects().pull(&query.key()).await?))
}

/// Push webhook. Bodies that are not JSON are treated as non-push deliveries.
pub async fn webhook(
    State(state): State<AppState>,
    path: Result<Path<(String, String)>, PathRejection>,
    body: Bytes,
) -> ApiResult<Json<WebhookResponse>> {
    let Path((name, branch)) = path?;
    let key = ProjectKey::new(name, branch);
    let payload: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
    let outcome = state
        .orchestrator
        .projects()
        .handle_webhook(&key, &payload)
        .await?;
    Ok(Json(WebhookResponse {
        project: key,
        outcome,
    }))
}

pub async fn action(
    State(state): State<AppState>,
    path: Result<Path<(String, String)>, PathRejection>,
    body: Result<Json<ActionRequest>, JsonRejection>,
) -> ApiResult<Json<Dispatched>> {
    let Path((name, branch)) = path?;
    let Json(request) = body?;
    let key = ProjectKey::new(name, branch);
    Ok(Json(state.orchestrator.dispatch(&key, request.command).await?))
}

pub async fn active(State(state): State<AppState>) -> ApiResult<Json<Vec<JobRecord>>> {
    Ok(Json(state.orchestrator.active().await?))
}

pub async fn history(
    State(state): State<AppState>,
    query: Result<Query<HistoryPage>, QueryRejection>,
) -> ApiResult<Json<Vec<JobRecord>>> {
    let Query(page) = query?;
    if page.per_page == 0 || page.per_page > MAX_PER_PAGE {
        return Err(CoreError::InvalidRequest(format!(
            "per_page must be between 1 and {MAX_PER_PAGE}"
        ))
        .into());
    }
    Ok(Json(state.orchestrator.history(page).await?))
}

pub async fn job(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
) -> ApiResult<Json<JobRecord>> {
    let Path(io_id) = path?;
    Ok(Json(state.orchestrator.job(&JobId::from(io_id)).await?))
}

pub async fn archive(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
) -> ApiResult<Json<ArchivedJob>> {
    let Path(io_id) = path?;
    Ok(Json(state.orchestrator.archived(&JobId::from(io_id)).await?))
}

/// `GET /projects/builds/{io_id}/{channel}?since=`: everything retained at
/// or after `since`, without waiting.
pub async fn read_output(
    State(state): State<AppState>,
    path: Result<Path<(String, String)>, PathRejection>,
    query: Result<Query<SinceQuery>, QueryRejection>,
) -> ApiResult<Json<OutputPage>> {
    let Path((io_id, channel)) = path?;
    let Query(query) = query?;
    let channel: Channel = channel.parse()?;
    let read = state.orchestrator.mux().read(
        &JobId::from(io_id),
        channel,
        query.since.unwrap_or(0),
    )?;
    Ok(Json(OutputPage {
        chunks: read.chunks.iter().map(ChunkView::from).collect(),
        next_offset: read.next_offset,
        lowest_offset: read.lowest_offset,
        truncated: read.truncated,
        live: read.live,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(offset: u64, data: &'static [u8]) -> Chunk {
        Chunk {
            offset,
            data: Bytes::from_static(data),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn invalid_utf8_is_replaced_not_rejected() {
        let view = ChunkView::from(&chunk(4, b"ok \xff\n"));
        assert_eq!(view.offset, 4);
        assert_eq!(view.data, "ok \u{fffd}\n");
    }

    #[test]
    fn history_query_defaults_to_first_page() {
        let page: HistoryPage = serde_json::from_str("{}").unwrap();
        assert_eq!(page, HistoryPage::default());
    }
}
