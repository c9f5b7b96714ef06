//! The build queue: admits workspace build requests, picks a builder on one of
//! the registered builder servers and keeps track of the dispatched tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use buildq_common::{
    BuildRequest, BuildResultDescriptor, BuildStatus, BuildTaskDescriptor, BuilderDescriptor,
    BuilderServer, BuilderServerLocation, BuilderServerRegistration,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use reqwest::Client;
use tokio::task::JoinHandle;

use crate::builder::configuration::validate_request;
use crate::errors::{QueueError, RemoteError};
use crate::events::{BuildEvent, EventService};
use crate::remote::http::{self, Download};
use crate::remote::{RemoteBuilder, RemoteBuilderServer, RemoteTask, normalize_url};
use crate::selection::BuilderSelectionStrategy;

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Non-terminal tasks allowed at once; further requests are rejected.
    pub max_pending: usize,
    /// Servers tried per request when dispatch fails on the transport level.
    pub dispatch_attempts: usize,
    /// Finished tasks are forgotten after this long.
    pub keep_results: Duration,
    /// Upper bound for any single call to a builder server.
    pub request_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_pending: 100,
            dispatch_attempts: 3,
            keep_results: Duration::from_secs(3600),
            request_timeout: http::DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

struct RegisteredServer {
    server: Arc<RemoteBuilderServer>,
    registration: BuilderServerRegistration,
    workspace: Option<String>,
    project: Option<String>,
    builders: Vec<Arc<RemoteBuilder>>,
}

impl RegisteredServer {
    fn serves(&self, workspace: &str, project: &str) -> bool {
        self.workspace.as_deref() == Some(workspace)
            && self.project.as_deref().is_none_or(|p| p == project)
    }
}

struct QueueTaskInner {
    id: u64,
    request: BuildRequest,
    created_at: DateTime<Utc>,
    remote: RemoteTask,
    last: Mutex<BuildTaskDescriptor>,
}

/// A build the queue has handed to a remote builder.
///
/// Keeps the last status seen from the remote side so the queue can count
/// pending work without a round trip per task.
#[derive(Clone)]
pub struct QueueTask {
    inner: Arc<QueueTaskInner>,
}

impl QueueTask {
    fn new(id: u64, request: BuildRequest, remote: RemoteTask) -> Self {
        let created_at = Utc::now();
        let last = BuildTaskDescriptor {
            task_id: id,
            builder: request.builder.clone(),
            status: BuildStatus::InQueue,
            workspace: request.workspace.clone(),
            project: request.project.clone(),
            created_at,
            started_at: None,
            ended_at: None,
            links: Vec::new(),
        };
        Self {
            inner: Arc::new(QueueTaskInner {
                id,
                request,
                created_at,
                remote,
                last: Mutex::new(last),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn request(&self) -> &BuildRequest {
        &self.inner.request
    }

    pub fn workspace(&self) -> &str {
        &self.inner.request.workspace
    }

    pub fn server_url(&self) -> &str {
        self.inner.remote.server_url()
    }

    pub fn remote(&self) -> &RemoteTask {
        &self.inner.remote
    }

    /// The last descriptor seen, without asking the remote server.
    pub fn descriptor(&self) -> BuildTaskDescriptor {
        match self.inner.last.lock() {
            Ok(last) => last.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn last_status(&self) -> BuildStatus {
        self.descriptor().status
    }

    /// Records a descriptor from the remote side under the queue's own id.
    fn update(&self, remote: BuildTaskDescriptor) -> BuildTaskDescriptor {
        let descriptor = BuildTaskDescriptor {
            task_id: self.inner.id,
            builder: remote.builder,
            status: remote.status,
            workspace: self.inner.request.workspace.clone(),
            project: self.inner.request.project.clone(),
            created_at: self.inner.created_at,
            started_at: remote.started_at,
            ended_at: remote.ended_at,
            links: Vec::new(),
        };
        if let Ok(mut last) = self.inner.last.lock() {
            *last = descriptor.clone();
        }
        descriptor
    }

    pub async fn refresh(&self) -> Result<BuildTaskDescriptor, RemoteError> {
        let remote = self.inner.remote.status().await?;
        Ok(self.update(remote))
    }
}

impl std::fmt::Debug for QueueTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueTask")
            .field("id", &self.inner.id)
            .field("workspace", &self.inner.request.workspace)
            .field("builder", &self.inner.request.builder)
            .field("server", &self.server_url())
            .finish()
    }
}

pub struct BuildQueue {
    servers: DashMap<String, RegisteredServer>,
    strategy: Arc<dyn BuilderSelectionStrategy>,
    tasks: DashMap<u64, QueueTask>,
    next_id: AtomicU64,
    settings: QueueSettings,
    events: EventService,
    client: Client,
}

impl BuildQueue {
    pub fn new(
        settings: QueueSettings,
        strategy: Arc<dyn BuilderSelectionStrategy>,
        events: EventService,
    ) -> Self {
        Self {
            servers: DashMap::new(),
            strategy,
            tasks: DashMap::new(),
            next_id: AtomicU64::new(1),
            client: http::client(settings.request_timeout),
            settings,
            events,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    // ── Server registration ──────────────────────────────────────────

    /// Registers a builder server, replacing an earlier registration of the
    /// same url. The server must be reachable: its builders are fetched now.
    pub async fn register_server(
        &self,
        registration: BuilderServerRegistration,
    ) -> Result<BuilderServer, QueueError> {
        let url = normalize_url(&registration.builder_server_location.url);
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(QueueError::InvalidRequest(format!(
                "builder server url must be http(s): '{}'",
                url
            )));
        }
        let criteria = registration.builder_server_options.as_ref();
        if let Some(c) = criteria
            && c.project.is_some()
            && c.workspace.is_none()
        {
            return Err(QueueError::InvalidRequest(
                "a server dedicated to a project must also name its workspace".into(),
            ));
        }

        let server = Arc::new(
            RemoteBuilderServer::new(&url, self.client.clone()).with_access_criteria(criteria),
        );
        let builders: Vec<Arc<RemoteBuilder>> = server
            .get_remote_builders()
            .await?
            .into_iter()
            .map(Arc::new)
            .collect();
        let workspace = server.assigned_workspace().await?;
        let project = server.assigned_project().await?;
        let infra = server.infra().await?;
        let description = server.description().await?;

        tracing::info!(
            server = %url,
            builders = builders.len(),
            workspace = workspace.as_deref().unwrap_or("-"),
            "builder server registered"
        );
        let listing = BuilderServer {
            url: url.clone(),
            description,
            dedicated: workspace.is_some(),
            assigned_workspace: workspace.clone(),
            assigned_project: project.clone(),
            infra,
            server_state: None,
            links: Vec::new(),
        };
        self.servers.insert(
            url,
            RegisteredServer {
                server,
                registration,
                workspace,
                project,
                builders,
            },
        );
        Ok(listing)
    }

    pub fn unregister_server(&self, location: &BuilderServerLocation) -> Result<(), QueueError> {
        let url = normalize_url(&location.url);
        match self.servers.remove(&url) {
            Some(_) => {
                tracing::info!(server = %url, "builder server unregistered");
                Ok(())
            }
            None => Err(QueueError::ServerNotRegistered(url)),
        }
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    /// The registrations as they were submitted, ordered by url.
    pub fn registrations(&self) -> Vec<BuilderServerRegistration> {
        let mut all: Vec<(String, BuilderServerRegistration)> = self
            .servers
            .iter()
            .map(|s| (s.key().clone(), s.value().registration.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all.into_iter().map(|(_, r)| r).collect()
    }

    /// Describes every registered server. Descriptors and states are fetched
    /// concurrently; a server that does not answer within the request timeout
    /// is still listed, without description and state.
    pub async fn server_listing(&self) -> Vec<BuilderServer> {
        let mut servers: Vec<(Arc<RemoteBuilderServer>, Option<String>, Option<String>)> = self
            .servers
            .iter()
            .map(|s| {
                (
                    Arc::clone(&s.value().server),
                    s.value().workspace.clone(),
                    s.value().project.clone(),
                )
            })
            .collect();
        servers.sort_by(|a, b| a.0.url().cmp(b.0.url()));

        let request_timeout = self.settings.request_timeout;
        join_all(servers.into_iter().map(|(server, workspace, project)| async move {
            let fetched = tokio::time::timeout(request_timeout, async {
                tokio::join!(server.service_descriptor(), server.server_state(), server.infra())
            })
            .await;
            let Ok((descriptor, state, infra)) = fetched else {
                tracing::warn!(
                    server = %server.url(),
                    timeout_secs = request_timeout.as_secs_f64(),
                    "builder server did not answer in time"
                );
                return BuilderServer {
                    url: server.url().to_string(),
                    description: None,
                    dedicated: workspace.is_some(),
                    assigned_workspace: workspace,
                    assigned_project: project,
                    infra: None,
                    server_state: None,
                    links: Vec::new(),
                };
            };
            let description = match descriptor {
                Ok(d) => d.description.clone(),
                Err(e) => {
                    tracing::warn!(server = %server.url(), "failed to fetch server descriptor: {}", e);
                    None
                }
            };
            let server_state = match state {
                Ok(s) => Some(s),
                Err(e) => {
                    tracing::warn!(server = %server.url(), "failed to fetch server state: {}", e);
                    None
                }
            };
            let infra = infra.ok().flatten();
            BuilderServer {
                url: server.url().to_string(),
                description,
                dedicated: workspace.is_some(),
                assigned_workspace: workspace,
                assigned_project: project,
                infra,
                server_state,
                links: Vec::new(),
            }
        }))
        .await
    }

    // ── Candidate lookup ─────────────────────────────────────────────

    /// Builders named `builder` that may run builds of `workspace`/`project`.
    ///
    /// Servers dedicated to the workspace (and project, when they name one)
    /// win; shared servers are only used when no dedicated server has it.
    fn candidates(&self, builder: &str, workspace: &str, project: &str) -> Vec<Arc<RemoteBuilder>> {
        let mut dedicated = Vec::new();
        let mut shared = Vec::new();
        for entry in self.servers.iter() {
            let server = entry.value();
            let matching = server.builders.iter().filter(|b| b.name() == builder).cloned();
            if server.workspace.is_none() {
                shared.extend(matching);
            } else if server.serves(workspace, project) {
                dedicated.extend(matching);
            }
        }
        if dedicated.is_empty() { shared } else { dedicated }
    }

    /// Builder types a workspace can use, by name.
    pub fn available_builders(&self, workspace: &str) -> Vec<BuilderDescriptor> {
        let mut found: Vec<BuilderDescriptor> = Vec::new();
        for entry in self.servers.iter() {
            let server = entry.value();
            let usable = server.workspace.is_none() || server.workspace.as_deref() == Some(workspace);
            if !usable {
                continue;
            }
            for builder in &server.builders {
                if !found.iter().any(|d| d.name == builder.name()) {
                    found.push(builder.descriptor());
                }
            }
        }
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }

    // ── Build dispatch ───────────────────────────────────────────────

    pub fn pending_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| !t.value().last_status().is_terminal())
            .count()
    }

    /// Dispatches a build for `workspace` to one of the matching builders.
    pub async fn build(&self, workspace: &str, mut request: BuildRequest) -> Result<QueueTask, QueueError> {
        if request.workspace.is_empty() {
            request.workspace = workspace.to_string();
        } else if request.workspace != workspace {
            return Err(QueueError::InvalidRequest(format!(
                "request is for workspace '{}', not '{}'",
                request.workspace, workspace
            )));
        }
        validate_request(&request).map_err(QueueError::InvalidRequest)?;

        if self.pending_count() >= self.settings.max_pending {
            // Cached statuses may be stale; look again before turning it down.
            self.refresh_pending().await;
            if self.pending_count() >= self.settings.max_pending {
                tracing::warn!(workspace, "build rejected: too many pending tasks");
                return Err(QueueError::QueueFull(self.settings.max_pending));
            }
        }

        let mut candidates = self.candidates(&request.builder, &request.workspace, &request.project);
        if candidates.is_empty() {
            return Err(QueueError::NoBuilderAvailable {
                builder: request.builder.clone(),
                workspace: request.workspace.clone(),
                project: request.project.clone(),
            });
        }

        let mut last_error = None;
        for attempt in 1..=self.settings.dispatch_attempts.max(1) {
            if candidates.is_empty() {
                break;
            }
            let chosen = self.strategy.select(&candidates)?;
            match chosen.perform(&request).await {
                Ok(remote) => return Ok(self.track(request, remote)),
                Err(e) if e.is_transport() => {
                    tracing::warn!(
                        server = %chosen.server_url(),
                        builder = %chosen.name(),
                        attempt,
                        "dispatch failed, trying another server: {}",
                        e
                    );
                    candidates.retain(|c| !Arc::ptr_eq(c, &chosen));
                    last_error = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(match last_error {
            Some(e) => e.into(),
            None => QueueError::NoBuilderAvailable {
                builder: request.builder.clone(),
                workspace: request.workspace.clone(),
                project: request.project.clone(),
            },
        })
    }

    fn track(&self, request: BuildRequest, remote: RemoteTask) -> QueueTask {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = QueueTask::new(id, request, remote);
        self.tasks.insert(id, task.clone());

        let request = task.request();
        tracing::info!(
            task_id = id,
            builder = %request.builder,
            server = %task.server_url(),
            remote_task_id = task.remote().id(),
            workspace = %request.workspace,
            "build dispatched"
        );
        self.events.publish(BuildEvent::Dispatched {
            queue_task_id: id,
            builder: request.builder.clone(),
            server: task.server_url().to_string(),
            workspace: request.workspace.clone(),
            project: request.project.clone(),
        });
        task
    }

    // ── Task access ──────────────────────────────────────────────────

    /// Looks a task up, hiding tasks of other workspaces.
    pub fn task(&self, workspace: &str, id: u64) -> Result<QueueTask, QueueError> {
        self.tasks
            .get(&id)
            .map(|t| t.value().clone())
            .filter(|t| t.workspace() == workspace)
            .ok_or(QueueError::TaskNotFound(id))
    }

    /// Tasks of a workspace, ordered by id.
    pub fn tasks(&self, workspace: &str) -> Vec<QueueTask> {
        let mut tasks: Vec<QueueTask> = self
            .tasks
            .iter()
            .filter(|t| t.value().workspace() == workspace)
            .map(|t| t.value().clone())
            .collect();
        tasks.sort_by_key(|t| t.id());
        tasks
    }

    pub async fn status(&self, workspace: &str, id: u64) -> Result<BuildTaskDescriptor, QueueError> {
        let task = self.task(workspace, id)?;
        Ok(task.refresh().await?)
    }

    pub async fn logs(&self, workspace: &str, id: u64) -> Result<String, QueueError> {
        let task = self.task(workspace, id)?;
        Ok(task.remote().logs().await?)
    }

    pub async fn cancel(&self, workspace: &str, id: u64) -> Result<BuildTaskDescriptor, QueueError> {
        let task = self.task(workspace, id)?;
        let remote = task.remote().cancel().await?;
        tracing::info!(task_id = id, server = %task.server_url(), "build cancelled");
        Ok(task.update(remote))
    }

    pub async fn result(&self, workspace: &str, id: u64) -> Result<BuildResultDescriptor, QueueError> {
        let task = self.task(workspace, id)?;
        Ok(task.remote().result().await?)
    }

    pub async fn download(&self, workspace: &str, id: u64, path: &str) -> Result<Download, QueueError> {
        let task = self.task(workspace, id)?;
        Ok(task.remote().download(path).await?)
    }

    // ── Housekeeping ─────────────────────────────────────────────────

    /// Polls the remote status of every task not known to be finished.
    pub async fn refresh_pending(&self) {
        let pending: Vec<QueueTask> = self
            .tasks
            .iter()
            .filter(|t| !t.value().last_status().is_terminal())
            .map(|t| t.value().clone())
            .collect();
        join_all(pending.iter().map(|task| async move {
            if let Err(e) = task.refresh().await {
                tracing::debug!(task_id = task.id(), server = %task.server_url(), "status refresh failed: {}", e);
            }
        }))
        .await;
    }

    /// Forgets finished tasks that ended more than `older_than` ago.
    pub fn purge_finished(&self, older_than: Duration) -> usize {
        let Ok(older_than) = chrono::Duration::from_std(older_than) else {
            return 0;
        };
        let cutoff = Utc::now() - older_than;
        let before = self.tasks.len();
        self.tasks.retain(|_, task| {
            let d = task.descriptor();
            !(d.status.is_terminal() && d.ended_at.unwrap_or(d.created_at) <= cutoff)
        });
        let purged = before.saturating_sub(self.tasks.len());
        if purged > 0 {
            tracing::debug!(purged, "purged finished queue tasks");
        }
        purged
    }

    /// Periodically refreshes pending tasks and purges old ones.
    pub fn spawn_maintenance(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                queue.refresh_pending().await;
                queue.purge_finished(queue.settings.keep_results);
            }
        })
    }
}
