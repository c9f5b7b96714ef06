use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use buildq_common::{
    BuildRequest, BuildResultDescriptor, BuildTaskDescriptor, BuilderDescriptor,
    BuilderEnvironment, BuilderState,
};
use reqwest::Client;

use super::http::{self, Download, join_url};
use crate::errors::RemoteError;

/// A builder living on a remote builder server.
///
/// Tracks when it was last handed a build (epoch millis, 0 = never) so the
/// queue can prefer builders that are already warm.
#[derive(Debug)]
pub struct RemoteBuilder {
    name: String,
    description: String,
    environments: BTreeMap<String, BuilderEnvironment>,
    server_url: String,
    client: Client,
    last_usage: AtomicI64,
}

impl RemoteBuilder {
    pub fn new(descriptor: BuilderDescriptor, server_url: impl Into<String>, client: Client) -> Self {
        Self {
            name: descriptor.name,
            description: descriptor.description,
            environments: descriptor.environments,
            server_url: server_url.into(),
            client,
            last_usage: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn environments(&self) -> &BTreeMap<String, BuilderEnvironment> {
        &self.environments
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn last_usage_time(&self) -> i64 {
        self.last_usage.load(Ordering::Relaxed)
    }

    pub fn set_last_usage_time(&self, millis: i64) {
        self.last_usage.store(millis, Ordering::Relaxed);
    }

    pub fn descriptor(&self) -> BuilderDescriptor {
        BuilderDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            environments: self.environments.clone(),
        }
    }

    /// Starts a build on the remote server.
    pub async fn perform(&self, request: &BuildRequest) -> Result<RemoteTask, RemoteError> {
        let url = join_url(&self.server_url, "build");
        let descriptor: BuildTaskDescriptor = http::post_json(&self.client, &url, request).await?;
        self.set_last_usage_time(chrono::Utc::now().timestamp_millis());
        tracing::debug!(
            builder = %self.name,
            server = %self.server_url,
            task_id = descriptor.task_id,
            "remote build started"
        );
        Ok(RemoteTask::attach(
            self.server_url.clone(),
            descriptor.builder,
            descriptor.task_id,
            self.client.clone(),
        ))
    }

    pub async fn state(&self) -> Result<BuilderState, RemoteError> {
        let url = join_url(&self.server_url, &format!("state/{}", self.name));
        http::get_json(&self.client, &url).await
    }
}

/// A build running on a remote builder server.
#[derive(Debug, Clone)]
pub struct RemoteTask {
    server_url: String,
    builder: String,
    task_id: u64,
    client: Client,
}

impl RemoteTask {
    /// Binds to a task the server already knows by id.
    pub fn attach(server_url: impl Into<String>, builder: impl Into<String>, task_id: u64, client: Client) -> Self {
        Self {
            server_url: server_url.into(),
            builder: builder.into(),
            task_id,
            client,
        }
    }

    pub fn id(&self) -> u64 {
        self.task_id
    }

    pub fn builder(&self) -> &str {
        &self.builder
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn url(&self, action: &str) -> String {
        join_url(
            &self.server_url,
            &format!("{}/{}/{}", action, self.builder, self.task_id),
        )
    }

    pub async fn status(&self) -> Result<BuildTaskDescriptor, RemoteError> {
        http::get_json(&self.client, &self.url("status")).await
    }

    pub async fn logs(&self) -> Result<String, RemoteError> {
        http::get_text(&self.client, &self.url("logs")).await
    }

    pub async fn cancel(&self) -> Result<BuildTaskDescriptor, RemoteError> {
        let url = self.url("cancel");
        http::post_json(&self.client, &url, &serde_json::json!({})).await
    }

    pub async fn result(&self) -> Result<BuildResultDescriptor, RemoteError> {
        http::get_json(&self.client, &self.url("result")).await
    }

    /// Fetches one artifact, `path` being relative to the task's sources directory.
    pub async fn download(&self, path: &str) -> Result<Download, RemoteError> {
        http::get_bytes(&self.client, &self.url("download"), &[("path", path)]).await
    }
}
