//! Wires configuration into running components: the local builder registry,
//! the build queue and its maintenance task, and the HTTP services.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use buildq_common::{BuilderServerRegistration, ServerDescriptor};
use tokio::task::JoinHandle;

use crate::builder::{Builder, BuilderRegistry, DefaultSourcesManager, LocalSources};
use crate::config::{BuildqConfig, BuildqToml};
use crate::events::EventService;
use crate::queue::BuildQueue;
use crate::selection::LastInUseBuilderSelectionStrategy;
use crate::service::{HostState, Services};

/// Creates one `Builder` per `[builders.<name>]` table. Builders are not started.
pub fn build_registry(
    toml: &BuildqToml,
    work_dir: &Path,
    local_sources: LocalSources,
    events: &EventService,
) -> Result<BuilderRegistry> {
    let registry = BuilderRegistry::new();
    let sources = Arc::new(DefaultSourcesManager::new(local_sources));
    for (name, builder_toml) in &toml.builders {
        let builder = Builder::new(
            Arc::new(builder_toml.kind(name)),
            builder_toml.settings(work_dir),
            sources.clone(),
            events.clone(),
        )
        .with_context(|| format!("Failed to create builder '{}'", name))?;
        registry.add(Arc::new(builder))?;
    }
    Ok(registry)
}

pub struct App {
    events: EventService,
    registry: Option<Arc<BuilderRegistry>>,
    host_descriptor: ServerDescriptor,
    queue: Option<Arc<BuildQueue>>,
    refresh: Duration,
    maintenance: Option<JoinHandle<()>>,
}

impl App {
    /// Creates the components the configured server role asks for.
    pub fn from_config(config: &BuildqConfig) -> Result<Self> {
        let toml = &config.toml;
        let events = EventService::default();
        let registry = if toml.server.role.hosts_builders() {
            Some(Arc::new(build_registry(
                toml,
                &config.work_dir(),
                config.local_sources(),
                &events,
            )?))
        } else {
            None
        };
        let queue = toml.server.role.runs_queue().then(|| {
            Arc::new(BuildQueue::new(
                toml.queue.settings(),
                Arc::new(LastInUseBuilderSelectionStrategy),
                events.clone(),
            ))
        });
        Ok(Self {
            events,
            registry,
            host_descriptor: toml.host.descriptor(),
            queue,
            refresh: Duration::from_secs(toml.queue.refresh_secs.max(1)),
            maintenance: None,
        })
    }

    pub fn events(&self) -> &EventService {
        &self.events
    }

    pub fn registry(&self) -> Option<&Arc<BuilderRegistry>> {
        self.registry.as_ref()
    }

    pub fn queue(&self) -> Option<&Arc<BuildQueue>> {
        self.queue.as_ref()
    }

    /// Starts builder worker pools and queue maintenance. Needs a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if let Some(registry) = &self.registry {
            registry.start_all()?;
            tracing::info!(builders = ?registry.names(), "builders started");
        }
        if let Some(queue) = &self.queue
            && self.maintenance.is_none()
        {
            self.maintenance = Some(queue.spawn_maintenance(self.refresh));
        }
        Ok(())
    }

    pub fn services(&self) -> Services {
        Services {
            host: self
                .registry
                .as_ref()
                .map(|r| HostState::new(Arc::clone(r), self.host_descriptor.clone())),
            queue: self.queue.clone(),
        }
    }

    /// Registers each server with the queue. Failures are logged, not fatal.
    pub async fn register_servers(&self, registrations: &[BuilderServerRegistration]) -> usize {
        let Some(queue) = &self.queue else {
            return 0;
        };
        let mut registered = 0;
        for registration in registrations {
            let url = &registration.builder_server_location.url;
            match queue.register_server(registration.clone()).await {
                Ok(server) => {
                    registered += 1;
                    tracing::info!(url = %server.url, dedicated = server.dedicated, "builder server registered");
                }
                Err(e) => tracing::warn!(url = %url, error = %e, "failed to register builder server"),
            }
        }
        registered
    }

    pub async fn shutdown(mut self) {
        if let Some(handle) = self.maintenance.take() {
            handle.abort();
        }
        if let Some(registry) = &self.registry {
            registry.stop_all().await;
        }
        tracing::info!("buildq stopped");
    }
}
