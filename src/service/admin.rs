//! `/admin/builder/server`: builder server registration, admin role only.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use buildq_common::{BuilderServerLocation, BuilderServerRegistration, Link};

use super::api::{ADMIN_ROLE, ApiError, require_role};
use crate::queue::BuildQueue;

pub const ADMIN_PREFIX: &str = "/admin/builder/server";

type SharedQueue = Arc<BuildQueue>;

pub fn admin_router(queue: Arc<BuildQueue>) -> Router {
    Router::new()
        .route("/", get(list_servers))
        .route("/register", post(register_server))
        .route("/unregister", post(unregister_server))
        .with_state(queue)
}

async fn register_server(
    State(queue): State<SharedQueue>,
    headers: HeaderMap,
    Json(registration): Json<BuilderServerRegistration>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&headers, ADMIN_ROLE)?;
    let server = queue.register_server(registration).await?;
    Ok(Json(server))
}

async fn unregister_server(
    State(queue): State<SharedQueue>,
    headers: HeaderMap,
    Json(location): Json<BuilderServerLocation>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&headers, ADMIN_ROLE)?;
    queue.unregister_server(&location)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_servers(
    State(queue): State<SharedQueue>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&headers, ADMIN_ROLE)?;
    let mut servers = queue.server_listing().await;
    for server in &mut servers {
        server.links = vec![Link::post("unregister", format!("{}/unregister", ADMIN_PREFIX))];
    }
    Ok(Json(servers))
}
