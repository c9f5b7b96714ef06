//! `/internal/builder`: exposes the builders hosted by this process to build
//! queues.

use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use buildq_common::{
    BuildRequest, BuildResultDescriptor, BuildTaskDescriptor, BuilderDescriptor, Link,
    ServerDescriptor, ServerState, rel,
};
use serde::Deserialize;

use super::api::{ApiError, check_relative_path};
use crate::builder::{BuildTask, BuilderRegistry};
use crate::errors::BuilderError;

/// Where the host routes are mounted by `build_router`.
pub const HOST_PREFIX: &str = "/internal/builder";

pub struct HostState {
    registry: Arc<BuilderRegistry>,
    descriptor: ServerDescriptor,
    started: Instant,
    base_path: String,
}

impl HostState {
    pub fn new(registry: Arc<BuilderRegistry>, descriptor: ServerDescriptor) -> Self {
        Self {
            registry,
            descriptor,
            started: Instant::now(),
            base_path: HOST_PREFIX.to_string(),
        }
    }

    pub fn registry(&self) -> &Arc<BuilderRegistry> {
        &self.registry
    }

    fn task(&self, builder: &str, id: u64) -> Result<BuildTask, BuilderError> {
        self.registry
            .get(builder)?
            .task(id)
            .ok_or(BuilderError::TaskNotFound(id))
    }

    fn describe(&self, task: &BuildTask) -> BuildTaskDescriptor {
        let mut descriptor = task.descriptor();
        let suffix = format!("{}/{}", task.builder(), task.id());
        let base = &self.base_path;
        descriptor.links = vec![
            Link::get(rel::STATUS, format!("{}/status/{}", base, suffix)),
            Link::get(rel::LOGS, format!("{}/logs/{}", base, suffix)),
        ];
        if task.is_done() {
            descriptor
                .links
                .push(Link::get(rel::RESULT, format!("{}/result/{}", base, suffix)));
            descriptor
                .links
                .push(Link::get(rel::DOWNLOAD, format!("{}/download/{}", base, suffix)));
        } else {
            descriptor
                .links
                .push(Link::post(rel::CANCEL, format!("{}/cancel/{}", base, suffix)));
        }
        descriptor
    }
}

type SharedHost = Arc<HostState>;

#[derive(Deserialize)]
pub struct DownloadQuery {
    pub path: String,
}

pub fn host_router(state: HostState) -> Router {
    Router::new()
        .route("/", get(server_descriptor))
        .route("/available", get(available_builders))
        .route("/state", get(server_state))
        .route("/state/{builder}", get(builder_state))
        .route("/build", post(build))
        .route("/status/{builder}/{id}", get(status))
        .route("/logs/{builder}/{id}", get(logs))
        .route("/cancel/{builder}/{id}", post(cancel))
        .route("/result/{builder}/{id}", get(result))
        .route("/download/{builder}/{id}", get(download))
        .with_state(Arc::new(state))
}

// ── Server ────────────────────────────────────────────────────────────

async fn server_descriptor(State(state): State<SharedHost>) -> Json<ServerDescriptor> {
    let mut descriptor = state.descriptor.clone();
    let base = &state.base_path;
    descriptor.links = vec![
        Link::get("available builders", format!("{}/available", base)),
        Link::get("server state", format!("{}/state", base)),
        Link::post("build", format!("{}/build", base)),
    ];
    Json(descriptor)
}

async fn available_builders(State(state): State<SharedHost>) -> Json<Vec<BuilderDescriptor>> {
    Json(state.registry.all().iter().map(|b| b.descriptor()).collect())
}

async fn server_state(State(state): State<SharedHost>) -> Json<ServerState> {
    Json(ServerState {
        builders: state.registry.all().iter().map(|b| b.state()).collect(),
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

async fn builder_state(
    State(state): State<SharedHost>,
    Path(builder): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.registry.get(&builder)?.state()))
}

// ── Tasks ─────────────────────────────────────────────────────────────

async fn build(
    State(state): State<SharedHost>,
    Json(request): Json<BuildRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let builder = state.registry.get(&request.builder)?;
    let task = builder.perform(request)?;
    tracing::info!(
        builder = task.builder(),
        task_id = task.id(),
        workspace = %task.configuration().request.workspace,
        "build accepted"
    );
    Ok((StatusCode::CREATED, Json(state.describe(&task))))
}

async fn status(
    State(state): State<SharedHost>,
    Path((builder, id)): Path<(String, u64)>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.task(&builder, id)?;
    Ok(Json(state.describe(&task)))
}

async fn logs(
    State(state): State<SharedHost>,
    Path((builder, id)): Path<(String, u64)>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.task(&builder, id)?;
    let logger = task.logger();
    let mut body = logger.lines().join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    Ok(([(header::CONTENT_TYPE, logger.content_type().to_string())], body))
}

async fn cancel(
    State(state): State<SharedHost>,
    Path((builder, id)): Path<(String, u64)>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.task(&builder, id)?;
    if !task.is_done() {
        task.cancel();
        tracing::info!(builder = %builder, task_id = id, "build cancellation requested");
    }
    Ok(Json(state.describe(&task)))
}

async fn result(
    State(state): State<SharedHost>,
    Path((builder, id)): Path<(String, u64)>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.task(&builder, id)?;
    let (true, Some(result)) = (task.is_done(), task.result()) else {
        return Err(ApiError::Conflict(format!("Build task {} is not finished", id)));
    };
    let sources_dir = &task.configuration().sources_dir;
    let relative = |path: &FsPath| {
        path.strip_prefix(sources_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string()
    };
    Ok(Json(BuildResultDescriptor {
        success: result.is_successful(),
        artifacts: result.results().iter().map(|p| relative(p)).collect(),
        report: result.build_report().map(|p| relative(p)),
    }))
}

async fn download(
    State(state): State<SharedHost>,
    Path((builder, id)): Path<(String, u64)>,
    Query(query): Query<DownloadQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_relative_path(&query.path)?;
    let task = state.task(&builder, id)?;
    if !task.is_done() {
        return Err(ApiError::Conflict(format!("Build task {} is not finished", id)));
    }
    let sources_dir = &task.configuration().sources_dir;
    let not_found = || ApiError::NotFound(format!("File not found: {}", query.path));
    // Resolve symlinks before checking where the file really is.
    let full_path = tokio::fs::canonicalize(sources_dir.join(&query.path))
        .await
        .map_err(|_| not_found())?;
    let root = tokio::fs::canonicalize(sources_dir).await.map_err(|_| not_found())?;
    if !full_path.starts_with(&root) {
        tracing::warn!(builder = %builder, task_id = id, path = %query.path, "download outside the build directory refused");
        return Err(ApiError::Forbidden(format!(
            "{} resolves outside the build directory",
            query.path
        )));
    }
    if !full_path.is_file() {
        return Err(not_found());
    }
    let bytes = tokio::fs::read(&full_path)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to read {}: {}", query.path, e)))?;
    let mime = mime_guess::from_path(&full_path).first_or_octet_stream();
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, mime.to_string())],
        bytes,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::engine::BuilderSettings;
    use crate::builder::kind::CommandBuilderKind;
    use crate::builder::sources::DefaultSourcesManager;
    use crate::builder::Builder;
    use crate::events::EventService;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_app(dir: &TempDir, kind: CommandBuilderKind) -> (Router, Arc<BuilderRegistry>) {
        let registry = Arc::new(BuilderRegistry::new());
        let builder = Builder::new(
            Arc::new(kind),
            BuilderSettings {
                work_root: dir.path().join("builds"),
                ..Default::default()
            },
            Arc::new(DefaultSourcesManager::default()),
            EventService::default(),
        )
        .unwrap();
        registry.add(Arc::new(builder)).unwrap();
        registry.start_all().unwrap();
        let state = HostState::new(
            registry.clone(),
            ServerDescriptor {
                description: Some("test host".into()),
                ..Default::default()
            },
        );
        let app = Router::new().nest(HOST_PREFIX, host_router(state));
        (app, registry)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(body: Body) -> String {
        let bytes = body.collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn build_req(request: &BuildRequest) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/internal/builder/build")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(request).unwrap()))
            .unwrap()
    }

    fn sources(dir: &TempDir) -> String {
        let src = dir.path().join("project");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("app.txt"), "artifact").unwrap();
        src.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn test_descriptor_and_available() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(&dir, CommandBuilderKind::new("shell", "true").with_description("Shell"));

        let resp = app.clone().oneshot(get_req("/internal/builder")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let descriptor: ServerDescriptor = body_json(resp.into_body()).await;
        assert_eq!(descriptor.description.as_deref(), Some("test host"));
        assert!(descriptor.assigned_workspace.is_none());
        assert!(!descriptor.links.is_empty());

        let resp = app.clone().oneshot(get_req("/internal/builder/available")).await.unwrap();
        let builders: Vec<BuilderDescriptor> = body_json(resp.into_body()).await;
        assert_eq!(builders.len(), 1);
        assert_eq!(builders[0].description, "Shell");

        let resp = app.clone().oneshot(get_req("/internal/builder/state")).await.unwrap();
        let state: ServerState = body_json(resp.into_body()).await;
        assert_eq!(state.builders[0].name, "shell");

        let resp = app.oneshot(get_req("/internal/builder/state/gradle")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_build_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let kind = CommandBuilderKind::new("shell", "sh")
            .with_args(vec!["-c".into(), "echo building && cp app.txt app.out".into()])
            .with_artifacts(vec!["*.out".into()]);
        let (app, registry) = test_app(&dir, kind);

        let request = BuildRequest::new("shell", sources(&dir), "ws", "/p");
        let resp = app.clone().oneshot(build_req(&request)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let descriptor: BuildTaskDescriptor = body_json(resp.into_body()).await;
        assert!(descriptor.link(rel::STATUS).is_some());

        let task = registry.get("shell").unwrap().task(descriptor.task_id).unwrap();
        tokio::time::timeout(Duration::from_secs(10), task.wait())
            .await
            .unwrap();

        let uri = format!("/internal/builder/status/shell/{}", descriptor.task_id);
        let resp = app.clone().oneshot(get_req(&uri)).await.unwrap();
        let status: BuildTaskDescriptor = body_json(resp.into_body()).await;
        assert_eq!(status.status, buildq_common::BuildStatus::Successful);
        assert!(status.link(rel::CANCEL).is_none());

        let uri = format!("/internal/builder/logs/shell/{}", descriptor.task_id);
        let resp = app.clone().oneshot(get_req(&uri)).await.unwrap();
        assert!(body_text(resp.into_body()).await.contains("building"));

        let uri = format!("/internal/builder/result/shell/{}", descriptor.task_id);
        let resp = app.clone().oneshot(get_req(&uri)).await.unwrap();
        let result: BuildResultDescriptor = body_json(resp.into_body()).await;
        assert!(result.success);
        assert_eq!(result.artifacts, vec!["app.out".to_string()]);

        let uri = format!(
            "/internal/builder/download/shell/{}?path=app.out",
            descriptor.task_id
        );
        let resp = app.clone().oneshot(get_req(&uri)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp.into_body()).await, "artifact");

        let uri = format!(
            "/internal/builder/download/shell/{}?path=../build.log",
            descriptor.task_id
        );
        let resp = app.oneshot(get_req(&uri)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_download_refuses_symlink_out_of_build_dir() {
        let dir = tempfile::tempdir().unwrap();
        let secret = dir.path().join("secret.txt");
        std::fs::write(&secret, "do not serve").unwrap();
        let script = format!("ln -s {} leak.txt && ln -s app.txt alias.txt", secret.display());
        let kind = CommandBuilderKind::new("shell", "sh").with_args(vec!["-c".into(), script]);
        let (app, registry) = test_app(&dir, kind);

        let request = BuildRequest::new("shell", sources(&dir), "ws", "/p");
        let resp = app.clone().oneshot(build_req(&request)).await.unwrap();
        let descriptor: BuildTaskDescriptor = body_json(resp.into_body()).await;
        let task = registry.get("shell").unwrap().task(descriptor.task_id).unwrap();
        tokio::time::timeout(Duration::from_secs(10), task.wait())
            .await
            .unwrap();
        assert_eq!(task.status(), buildq_common::BuildStatus::Successful);

        let uri = format!(
            "/internal/builder/download/shell/{}?path=leak.txt",
            descriptor.task_id
        );
        let resp = app.clone().oneshot(get_req(&uri)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert!(!body_text(resp.into_body()).await.contains("do not serve"));

        let uri = format!(
            "/internal/builder/download/shell/{}?path=alias.txt",
            descriptor.task_id
        );
        let resp = app.clone().oneshot(get_req(&uri)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp.into_body()).await, "artifact");

        let uri = format!(
            "/internal/builder/download/shell/{}?path=missing.txt",
            descriptor.task_id
        );
        let resp = app.oneshot(get_req(&uri)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_build_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(&dir, CommandBuilderKind::new("shell", "true"));

        let unknown = BuildRequest::new("gradle", "/src", "ws", "/p");
        let resp = app.clone().oneshot(build_req(&unknown)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = body_json(resp.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("gradle"));

        let invalid = BuildRequest::new("shell", "", "ws", "/p");
        let resp = app.clone().oneshot(build_req(&invalid)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .oneshot(get_req("/internal/builder/status/shell/999"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_and_unfinished_result() {
        let dir = tempfile::tempdir().unwrap();
        let kind = CommandBuilderKind::new("shell", "sleep").with_args(vec!["30".into()]);
        let (app, registry) = test_app(&dir, kind);

        let request = BuildRequest::new("shell", sources(&dir), "ws", "/p");
        let resp = app.clone().oneshot(build_req(&request)).await.unwrap();
        let descriptor: BuildTaskDescriptor = body_json(resp.into_body()).await;

        let uri = format!("/internal/builder/result/shell/{}", descriptor.task_id);
        let resp = app.clone().oneshot(get_req(&uri)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let cancel = Request::builder()
            .method("POST")
            .uri(format!("/internal/builder/cancel/shell/{}", descriptor.task_id))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(cancel).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let task = registry.get("shell").unwrap().task(descriptor.task_id).unwrap();
        tokio::time::timeout(Duration::from_secs(10), task.wait())
            .await
            .unwrap();
        assert_eq!(task.status(), buildq_common::BuildStatus::Cancelled);
        registry.stop_all().await;
    }
}
