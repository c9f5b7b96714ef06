use buildq_common::{BuilderDescriptor, BuilderServerAccessCriteria, ServerDescriptor, ServerState};
use reqwest::Client;
use tokio::sync::OnceCell;

use super::builder::RemoteBuilder;
use super::http::{self, join_url};
use crate::errors::RemoteError;

/// Proxy for a builder server's `/internal/builder` service.
///
/// The service descriptor is fetched at most once and shared by every caller.
/// Access criteria given at registration win over what the server advertises.
#[derive(Debug)]
pub struct RemoteBuilderServer {
    url: String,
    client: Client,
    assigned_workspace: Option<String>,
    assigned_project: Option<String>,
    infra: Option<String>,
    descriptor: OnceCell<ServerDescriptor>,
}

/// Strips trailing slashes so equal servers compare equal.
pub fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

impl RemoteBuilderServer {
    pub fn new(url: &str, client: Client) -> Self {
        Self {
            url: normalize_url(url),
            client,
            assigned_workspace: None,
            assigned_project: None,
            infra: None,
            descriptor: OnceCell::new(),
        }
    }

    pub fn with_access_criteria(mut self, criteria: Option<&BuilderServerAccessCriteria>) -> Self {
        if let Some(criteria) = criteria {
            self.assigned_workspace = criteria.workspace.clone();
            self.assigned_project = criteria.project.clone();
            self.infra = criteria.infra.clone();
        }
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn service_descriptor(&self) -> Result<&ServerDescriptor, RemoteError> {
        self.descriptor
            .get_or_try_init(|| async {
                tracing::debug!(server = %self.url, "fetching builder server descriptor");
                http::get_json::<ServerDescriptor>(&self.client, &self.url).await
            })
            .await
    }

    pub async fn assigned_workspace(&self) -> Result<Option<String>, RemoteError> {
        if self.assigned_workspace.is_some() {
            return Ok(self.assigned_workspace.clone());
        }
        Ok(self.service_descriptor().await?.assigned_workspace.clone())
    }

    pub async fn assigned_project(&self) -> Result<Option<String>, RemoteError> {
        if self.assigned_project.is_some() {
            return Ok(self.assigned_project.clone());
        }
        Ok(self.service_descriptor().await?.assigned_project.clone())
    }

    pub async fn infra(&self) -> Result<Option<String>, RemoteError> {
        if self.infra.is_some() {
            return Ok(self.infra.clone());
        }
        Ok(self.service_descriptor().await?.infra.clone())
    }

    pub async fn description(&self) -> Result<Option<String>, RemoteError> {
        Ok(self.service_descriptor().await?.description.clone())
    }

    /// A server is dedicated when it is assigned to a workspace.
    pub async fn is_dedicated(&self) -> Result<bool, RemoteError> {
        Ok(self.assigned_workspace().await?.is_some())
    }

    pub async fn available_builders(&self) -> Result<Vec<BuilderDescriptor>, RemoteError> {
        http::get_json(&self.client, &join_url(&self.url, "available")).await
    }

    pub async fn get_remote_builders(&self) -> Result<Vec<RemoteBuilder>, RemoteError> {
        Ok(self
            .available_builders()
            .await?
            .into_iter()
            .map(|d| RemoteBuilder::new(d, self.url.clone(), self.client.clone()))
            .collect())
    }

    pub async fn get_remote_builder(&self, name: &str) -> Result<RemoteBuilder, RemoteError> {
        self.available_builders()
            .await?
            .into_iter()
            .find(|d| d.name == name)
            .map(|d| RemoteBuilder::new(d, self.url.clone(), self.client.clone()))
            .ok_or_else(|| RemoteError::BuilderNotFound {
                name: name.to_string(),
                server: self.url.clone(),
            })
    }

    pub async fn server_state(&self) -> Result<ServerState, RemoteError> {
        http::get_json(&self.client, &join_url(&self.url, "state")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn stub_server(hits: Arc<AtomicUsize>) -> String {
        let router = Router::new()
            .route(
                "/internal/builder",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(ServerDescriptor {
                        assigned_workspace: Some("ws-remote".into()),
                        description: Some("stub".into()),
                        ..Default::default()
                    })
                }),
            )
            .route(
                "/internal/builder/available",
                get(|| async {
                    Json(vec![BuilderDescriptor {
                        name: "maven".into(),
                        description: "Apache Maven".into(),
                        environments: BTreeMap::new(),
                    }])
                }),
            )
            .with_state(hits);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/internal/builder/", addr)
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url(" http://h:1/x/ "), "http://h:1/x");
        assert_eq!(normalize_url("http://h:1/x//"), "http://h:1/x");
    }

    #[tokio::test]
    async fn test_descriptor_fetched_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = stub_server(hits.clone()).await;
        let server = Arc::new(RemoteBuilderServer::new(&url, http::client(http::DEFAULT_REQUEST_TIMEOUT)));
        assert!(!server.url().ends_with('/'));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let server = server.clone();
            handles.push(tokio::spawn(async move {
                server.assigned_workspace().await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().as_deref(), Some("ws-remote"));
        }
        assert!(server.is_dedicated().await.unwrap());
        assert_eq!(server.description().await.unwrap().as_deref(), Some("stub"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_local_criteria_win() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = stub_server(hits.clone()).await;
        let criteria = BuilderServerAccessCriteria {
            workspace: Some("ws-local".into()),
            project: Some("/p".into()),
            infra: None,
        };
        let server = RemoteBuilderServer::new(&url, http::client(http::DEFAULT_REQUEST_TIMEOUT)).with_access_criteria(Some(&criteria));

        assert_eq!(server.assigned_workspace().await.unwrap().as_deref(), Some("ws-local"));
        assert_eq!(server.assigned_project().await.unwrap().as_deref(), Some("/p"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_get_remote_builder() {
        let url = stub_server(Arc::new(AtomicUsize::new(0))).await;
        let server = RemoteBuilderServer::new(&url, http::client(http::DEFAULT_REQUEST_TIMEOUT));

        let builders = server.get_remote_builders().await.unwrap();
        assert_eq!(builders.len(), 1);
        assert_eq!(builders[0].server_url(), server.url());

        let maven = server.get_remote_builder("maven").await.unwrap();
        assert_eq!(maven.description(), "Apache Maven");
        assert!(matches!(
            server.get_remote_builder("gradle").await,
            Err(RemoteError::BuilderNotFound { name, .. }) if name == "gradle"
        ));
    }
}
