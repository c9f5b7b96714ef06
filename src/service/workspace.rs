//! `/builder/{workspace}`: the build queue as seen by a workspace.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use buildq_common::{BuildRequest, BuildTaskDescriptor, Link, rel};
use serde::Deserialize;

use super::api::{ApiError, check_relative_path};
use crate::queue::BuildQueue;

pub const WORKSPACE_PREFIX: &str = "/builder";

type SharedQueue = Arc<BuildQueue>;

#[derive(Deserialize)]
pub struct DownloadQuery {
    pub path: String,
}

pub fn workspace_router(queue: Arc<BuildQueue>) -> Router {
    Router::new()
        .route("/{workspace}/build", post(build))
        .route("/{workspace}/status/{id}", get(status))
        .route("/{workspace}/cancel/{id}", post(cancel))
        .route("/{workspace}/logs/{id}", get(logs))
        .route("/{workspace}/result/{id}", get(result))
        .route("/{workspace}/download/{id}", get(download))
        .route("/{workspace}/builders", get(builders))
        .with_state(queue)
}

fn with_links(workspace: &str, mut descriptor: BuildTaskDescriptor) -> BuildTaskDescriptor {
    let base = format!("{}/{}", WORKSPACE_PREFIX, workspace);
    let id = descriptor.task_id;
    descriptor.links = vec![
        Link::get(rel::STATUS, format!("{}/status/{}", base, id)),
        Link::get(rel::LOGS, format!("{}/logs/{}", base, id)),
    ];
    if descriptor.status.is_terminal() {
        descriptor
            .links
            .push(Link::get(rel::RESULT, format!("{}/result/{}", base, id)));
        descriptor
            .links
            .push(Link::get(rel::DOWNLOAD, format!("{}/download/{}", base, id)));
    } else {
        descriptor
            .links
            .push(Link::post(rel::CANCEL, format!("{}/cancel/{}", base, id)));
    }
    descriptor
}

async fn build(
    State(queue): State<SharedQueue>,
    Path(workspace): Path<String>,
    Json(request): Json<BuildRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let task = queue.build(&workspace, request).await?;
    Ok((
        StatusCode::CREATED,
        Json(with_links(&workspace, task.descriptor())),
    ))
}

async fn status(
    State(queue): State<SharedQueue>,
    Path((workspace, id)): Path<(String, u64)>,
) -> Result<impl IntoResponse, ApiError> {
    let descriptor = queue.status(&workspace, id).await?;
    Ok(Json(with_links(&workspace, descriptor)))
}

async fn cancel(
    State(queue): State<SharedQueue>,
    Path((workspace, id)): Path<(String, u64)>,
) -> Result<impl IntoResponse, ApiError> {
    let descriptor = queue.cancel(&workspace, id).await?;
    Ok(Json(with_links(&workspace, descriptor)))
}

async fn logs(
    State(queue): State<SharedQueue>,
    Path((workspace, id)): Path<(String, u64)>,
) -> Result<impl IntoResponse, ApiError> {
    let logs = queue.logs(&workspace, id).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], logs))
}

async fn result(
    State(queue): State<SharedQueue>,
    Path((workspace, id)): Path<(String, u64)>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(queue.result(&workspace, id).await?))
}

async fn download(
    State(queue): State<SharedQueue>,
    Path((workspace, id)): Path<(String, u64)>,
    Query(query): Query<DownloadQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_relative_path(&query.path)?;
    let download = queue.download(&workspace, id, &query.path).await?;
    let content_type = download.content_type.unwrap_or_else(|| {
        mime_guess::from_path(&query.path)
            .first_or_octet_stream()
            .to_string()
    });
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        download.bytes,
    ))
}

async fn builders(
    State(queue): State<SharedQueue>,
    Path(workspace): Path<String>,
) -> impl IntoResponse {
    Json(queue.available_builders(&workspace))
}
