//! Client for a buildq server's workspace and admin routes.

use std::time::Duration;

use anyhow::{Context, Result};
use buildq_common::{
    BuildRequest, BuildResultDescriptor, BuildTaskDescriptor, BuilderDescriptor, BuilderServer,
    BuilderServerLocation, BuilderServerRegistration,
};
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue};

use crate::errors::RemoteError;
use crate::remote::http::{self, Download, join_url};
use crate::service::api::ROLES_HEADER;

pub struct BuilderServiceClient {
    base_url: String,
    client: Client,
}

impl BuilderServiceClient {
    /// `roles` is sent with every request; admin calls need `system/admin`.
    pub fn new(base_url: &str, roles: Option<&str>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(roles) = roles {
            let value = HeaderValue::from_str(roles).context("Invalid roles header value")?;
            headers.insert(ROLES_HEADER, value);
        }
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build http client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn workspace_url(&self, workspace: &str, path: &str) -> String {
        join_url(&self.base_url, &format!("builder/{}/{}", workspace, path))
    }

    fn admin_url(&self, path: &str) -> String {
        let url = join_url(&self.base_url, &format!("admin/builder/server/{}", path));
        url.trim_end_matches('/').to_string()
    }

    pub async fn health(&self) -> bool {
        http::get_text(&self.client, &join_url(&self.base_url, "health"))
            .await
            .is_ok()
    }

    // ── Workspace builds ─────────────────────────────────────────────

    pub async fn build(
        &self,
        workspace: &str,
        request: &BuildRequest,
    ) -> Result<BuildTaskDescriptor, RemoteError> {
        http::post_json(&self.client, &self.workspace_url(workspace, "build"), request).await
    }

    pub async fn status(&self, workspace: &str, id: u64) -> Result<BuildTaskDescriptor, RemoteError> {
        http::get_json(&self.client, &self.workspace_url(workspace, &format!("status/{}", id))).await
    }

    pub async fn cancel(&self, workspace: &str, id: u64) -> Result<BuildTaskDescriptor, RemoteError> {
        let url = self.workspace_url(workspace, &format!("cancel/{}", id));
        http::post_json(&self.client, &url, &serde_json::json!({})).await
    }

    pub async fn logs(&self, workspace: &str, id: u64) -> Result<String, RemoteError> {
        http::get_text(&self.client, &self.workspace_url(workspace, &format!("logs/{}", id))).await
    }

    pub async fn result(&self, workspace: &str, id: u64) -> Result<BuildResultDescriptor, RemoteError> {
        http::get_json(&self.client, &self.workspace_url(workspace, &format!("result/{}", id))).await
    }

    pub async fn download(&self, workspace: &str, id: u64, path: &str) -> Result<Download, RemoteError> {
        let url = self.workspace_url(workspace, &format!("download/{}", id));
        http::get_bytes(&self.client, &url, &[("path", path)]).await
    }

    pub async fn builders(&self, workspace: &str) -> Result<Vec<BuilderDescriptor>, RemoteError> {
        http::get_json(&self.client, &self.workspace_url(workspace, "builders")).await
    }

    /// Polls until the task reaches a terminal status or `timeout` elapses.
    pub async fn wait(
        &self,
        workspace: &str,
        id: u64,
        poll: Duration,
        timeout: Duration,
    ) -> Result<BuildTaskDescriptor> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let descriptor = self.status(workspace, id).await?;
            if descriptor.status.is_terminal() {
                return Ok(descriptor);
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!(
                    "Build task {} still {} after {}s",
                    id,
                    descriptor.status,
                    timeout.as_secs()
                );
            }
            tokio::time::sleep(poll).await;
        }
    }

    // ── Admin ────────────────────────────────────────────────────────

    pub async fn registered_servers(&self) -> Result<Vec<BuilderServer>, RemoteError> {
        http::get_json(&self.client, &self.admin_url("")).await
    }

    pub async fn register_server(
        &self,
        registration: &BuilderServerRegistration,
    ) -> Result<BuilderServer, RemoteError> {
        http::post_json(&self.client, &self.admin_url("register"), registration).await
    }

    pub async fn unregister_server(&self, location: &BuilderServerLocation) -> Result<(), RemoteError> {
        http::post_unit(&self.client, &self.admin_url("unregister"), location).await
    }
}
