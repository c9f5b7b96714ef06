use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use buildq_common::{BuildRequest, BuildStatus, BuilderDescriptor, BuilderState};
use dashmap::DashMap;
use futures::FutureExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use super::configuration::{BuilderConfiguration, validate_request};
use super::kind::BuilderKind;
use super::listener::{BuildListener, ListenerSet};
use super::logger::BuildLogger;
use super::result::BuildResult;
use super::sources::SourcesManager;
use super::task::BuildTask;
use crate::errors::BuilderError;
use crate::events::{BuildEvent, EventService};

/// How long output pumps may lag behind a killed process.
const PUMP_GRACE: Duration = Duration::from_secs(2);

/// Worker pool sizing and housekeeping for one builder.
#[derive(Debug, Clone)]
pub struct BuilderSettings {
    pub workers: usize,
    /// Tasks accepted but not yet picked up by a worker.
    pub queue_size: usize,
    /// Upper bound for a single build; requests may only shorten it.
    pub timeout: Duration,
    /// Task directories live in `<work_root>/<builder>/<task_id>`.
    pub work_root: PathBuf,
    /// Finished tasks are forgotten (and their directory removed) after this long.
    pub keep_results: Duration,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_size: 10,
            timeout: Duration::from_secs(600),
            work_root: PathBuf::from(".buildq/builds"),
            keep_results: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug)]
enum Outcome {
    Succeeded,
    Failed(String),
    Cancelled,
    TimedOut(Duration),
}

struct Shared {
    kind: Arc<dyn BuilderKind>,
    settings: BuilderSettings,
    sources: Arc<dyn SourcesManager>,
    listeners: ListenerSet,
    events: EventService,
    tasks: DashMap<u64, BuildTask>,
    active: AtomicUsize,
}

struct Pool {
    tx: mpsc::Sender<BuildTask>,
    workers: Vec<JoinHandle<()>>,
    cleaner: JoinHandle<()>,
}

/// Executes builds of one kind on a bounded worker pool.
///
/// `perform` never blocks: it either admits the task into the queue or
/// rejects it. Workers fire `begin` listeners, fetch sources, run the
/// command, compute the result, fire `end` listeners and only then mark the
/// task done.
pub struct Builder {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    pool: Mutex<Option<Pool>>,
}

impl Builder {
    pub fn new(
        kind: Arc<dyn BuilderKind>,
        settings: BuilderSettings,
        sources: Arc<dyn SourcesManager>,
        events: EventService,
    ) -> Result<Self, BuilderError> {
        if kind.name().trim().is_empty() {
            return Err(BuilderError::InvalidSettings("builder name is empty".into()));
        }
        if settings.workers == 0 {
            return Err(BuilderError::InvalidSettings(format!(
                "builder '{}' needs at least one worker",
                kind.name()
            )));
        }
        if settings.queue_size == 0 {
            return Err(BuilderError::InvalidSettings(format!(
                "builder '{}' needs a queue size of at least one",
                kind.name()
            )));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                kind,
                settings,
                sources,
                listeners: ListenerSet::default(),
                events,
                tasks: DashMap::new(),
                active: AtomicUsize::new(0),
            }),
            next_id: AtomicU64::new(1),
            pool: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        self.shared.kind.name()
    }

    pub fn settings(&self) -> &BuilderSettings {
        &self.shared.settings
    }

    pub fn add_listener(&self, listener: Arc<dyn BuildListener>) {
        self.shared.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn BuildListener>) -> bool {
        self.shared.listeners.remove(listener)
    }

    pub fn is_running(&self) -> bool {
        self.pool.lock().map(|p| p.is_some()).unwrap_or(false)
    }

    /// Spawns the workers. Calling it on a running builder does nothing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), BuilderError> {
        let mut pool = self
            .pool
            .lock()
            .map_err(|_| anyhow::anyhow!("builder pool lock poisoned"))?;
        if pool.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| anyhow::anyhow!("builder '{}' started outside a runtime: {}", self.name(), e))?;

        let (tx, rx) = mpsc::channel::<BuildTask>(self.shared.settings.queue_size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..self.shared.settings.workers)
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let shared = Arc::clone(&self.shared);
                runtime.spawn(worker_loop(worker, rx, shared))
            })
            .collect();
        let cleaner = runtime.spawn(cleaner_loop(Arc::clone(&self.shared)));

        *pool = Some(Pool {
            tx,
            workers,
            cleaner,
        });
        tracing::info!(
            builder = self.name(),
            workers = self.shared.settings.workers,
            queue_size = self.shared.settings.queue_size,
            "builder started"
        );
        Ok(())
    }

    /// Stops admission, cancels queued and running tasks and waits for the
    /// workers to drain. Calling it on a stopped builder does nothing.
    pub async fn stop(&self) {
        let pool = match self.pool.lock() {
            Ok(mut pool) => pool.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(pool) = pool else {
            return;
        };
        // Closing the sender lets workers exit once the queue is drained.
        drop(pool.tx);
        pool.cleaner.abort();
        for entry in self.shared.tasks.iter() {
            if !entry.value().is_done() {
                entry.value().cancel();
            }
        }
        for worker in pool.workers {
            if let Err(e) = worker.await {
                tracing::error!(builder = self.name(), "builder worker panicked: {}", e);
            }
        }
        tracing::info!(builder = self.name(), "builder stopped");
    }

    /// Admits a build. Returns immediately with the task handle.
    pub fn perform(&self, request: BuildRequest) -> Result<BuildTask, BuilderError> {
        validate_request(&request).map_err(BuilderError::InvalidRequest)?;
        if request.builder != self.name() {
            return Err(BuilderError::InvalidRequest(format!(
                "builder '{}' cannot run a request for '{}'",
                self.name(),
                request.builder
            )));
        }
        let environment = self.resolve_environment(request.environment.as_deref())?;

        let pool = self
            .pool
            .lock()
            .map_err(|_| anyhow::anyhow!("builder pool lock poisoned"))?;
        let Some(pool) = pool.as_ref() else {
            return Err(BuilderError::NotRunning(self.name().to_string()));
        };

        let settings = &self.shared.settings;
        let task_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let work_dir = settings
            .work_root
            .join(self.name())
            .join(task_id.to_string());
        let timeout = request
            .options
            .timeout_secs
            .map(|secs| Duration::from_secs(secs).min(settings.timeout))
            .unwrap_or(settings.timeout);
        let configuration = BuilderConfiguration {
            task_id,
            builder: self.name().to_string(),
            sources_dir: work_dir.join("sources"),
            work_dir,
            environment,
            timeout,
            request,
        };
        let logger = self.shared.kind.create_build_logger(&configuration)?;
        let task = BuildTask::new(configuration, logger);

        self.shared.tasks.insert(task_id, task.clone());
        match pool.tx.try_send(task.clone()) {
            Ok(()) => {
                tracing::debug!(builder = self.name(), task_id, "build task queued");
                Ok(task)
            }
            Err(err) => {
                self.shared.tasks.remove(&task_id);
                let _ = std::fs::remove_dir_all(&task.configuration().work_dir);
                match err {
                    TrySendError::Full(_) => {
                        tracing::warn!(builder = self.name(), "build rejected: queue is full");
                        Err(BuilderError::QueueFull {
                            builder: self.name().to_string(),
                            capacity: settings.queue_size,
                        })
                    }
                    TrySendError::Closed(_) => Err(BuilderError::NotRunning(self.name().to_string())),
                }
            }
        }
    }

    fn resolve_environment(&self, requested: Option<&str>) -> Result<Option<String>, BuilderError> {
        let environments = self.shared.kind.environments();
        match requested {
            Some(id) => {
                if environments.iter().any(|e| e.id == id) {
                    Ok(Some(id.to_string()))
                } else {
                    Err(BuilderError::InvalidRequest(format!(
                        "builder '{}' has no environment '{}'",
                        self.name(),
                        id
                    )))
                }
            }
            None => Ok(environments
                .into_iter()
                .find(|e| e.is_default)
                .map(|e| e.id)),
        }
    }

    pub fn task(&self, task_id: u64) -> Option<BuildTask> {
        self.shared.tasks.get(&task_id).map(|t| t.value().clone())
    }

    /// All tracked tasks ordered by id.
    pub fn tasks(&self) -> Vec<BuildTask> {
        let mut tasks: Vec<BuildTask> = self.shared.tasks.iter().map(|t| t.value().clone()).collect();
        tasks.sort_by_key(|t| t.id());
        tasks
    }

    pub fn state(&self) -> BuilderState {
        let queued = self
            .pool
            .lock()
            .ok()
            .and_then(|pool| {
                pool.as_ref()
                    .map(|p| p.tx.max_capacity() - p.tx.capacity())
            })
            .unwrap_or(0);
        BuilderState {
            name: self.name().to_string(),
            workers: self.shared.settings.workers,
            active_tasks: self.shared.active.load(Ordering::Relaxed),
            queued_tasks: queued,
            queue_capacity: self.shared.settings.queue_size,
            total_tasks: self.shared.tasks.len(),
        }
    }

    pub fn descriptor(&self) -> BuilderDescriptor {
        let environments: BTreeMap<_, _> = self
            .shared
            .kind
            .environments()
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();
        BuilderDescriptor {
            name: self.name().to_string(),
            description: self.shared.kind.description().to_string(),
            environments,
        }
    }

    /// Forgets finished tasks older than `older_than` and deletes their directories.
    pub async fn purge_finished(&self, older_than: Duration) -> usize {
        self.shared.purge_finished(older_than).await
    }
}

impl Shared {
    async fn run_task(&self, task: BuildTask) {
        let configuration = task.configuration();
        self.listeners.notify_begin(&task);
        self.events.publish(BuildEvent::Begun {
            builder: task.builder().to_string(),
            task_id: task.id(),
            workspace: configuration.request.workspace.clone(),
            project: configuration.request.project.clone(),
        });
        task.mark_started();

        let outcome = if task.is_cancelled() {
            Outcome::Cancelled
        } else {
            self.active.fetch_add(1, Ordering::Relaxed);
            let outcome = AssertUnwindSafe(self.execute(&task))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Outcome::Failed("build execution panicked".to_string()));
            self.active.fetch_sub(1, Ordering::Relaxed);
            outcome
        };

        let logger = task.logger();
        let mut status = match &outcome {
            Outcome::Succeeded => BuildStatus::Successful,
            Outcome::Failed(reason) => {
                let _ = logger.write_line(&format!("[buildq] Build failed: {}", reason));
                BuildStatus::Failed
            }
            Outcome::Cancelled => {
                let _ = logger.write_line("[buildq] Build cancelled");
                BuildStatus::Cancelled
            }
            Outcome::TimedOut(after) => {
                let _ = logger.write_line(&format!(
                    "[buildq] Build timed out after {}s",
                    after.as_secs()
                ));
                BuildStatus::Failed
            }
        };

        let successful = status == BuildStatus::Successful;
        let result = match catch_unwind(AssertUnwindSafe(|| {
            self.kind.task_result(configuration, successful)
        })) {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(builder = task.builder(), task_id = task.id(), "failed to compute build result: {:#}", e);
                BuildResult::failed()
            }
            Err(_) => {
                tracing::error!(builder = task.builder(), task_id = task.id(), "build result hook panicked");
                BuildResult::failed()
            }
        };
        if successful && !result.is_successful() {
            status = BuildStatus::Failed;
        }

        tracing::info!(
            builder = task.builder(),
            task_id = task.id(),
            status = %status,
            artifacts = result.results().len(),
            "build finished"
        );
        task.complete(status, result);
        self.listeners.notify_end(&task);
        self.events.publish(BuildEvent::Ended {
            builder: task.builder().to_string(),
            task_id: task.id(),
            workspace: configuration.request.workspace.clone(),
            project: configuration.request.project.clone(),
            status,
        });
        task.finish();
    }

    async fn execute(&self, task: &BuildTask) -> Outcome {
        let configuration = task.configuration();
        let logger = Arc::clone(task.logger());
        let cancel = task.cancellation();

        if let Err(e) = tokio::fs::create_dir_all(&configuration.work_dir).await {
            return Outcome::Failed(format!(
                "failed to create {}: {}",
                configuration.work_dir.display(),
                e
            ));
        }

        let fetched = tokio::select! {
            fetched = self.sources.get_sources(configuration, logger.as_ref()) => fetched,
            _ = cancel.cancelled() => return Outcome::Cancelled,
        };
        if let Err(e) = fetched {
            return Outcome::Failed(format!("failed to fetch sources: {:#}", e));
        }
        if let Err(e) = tokio::fs::create_dir_all(&configuration.sources_dir).await {
            return Outcome::Failed(format!("failed to create sources directory: {}", e));
        }

        let command = match self.kind.create_command_line(configuration) {
            Ok(command) => command,
            Err(e) => return Outcome::Failed(format!("failed to create command line: {:#}", e)),
        };
        let _ = logger.write_line(&format!("[buildq] Running: {}", command));
        tracing::debug!(builder = task.builder(), task_id = task.id(), command = %command, "spawning build process");

        let mut child = match command.to_command(&configuration.sources_dir).spawn() {
            Ok(child) => child,
            Err(e) => return Outcome::Failed(format!("failed to spawn '{}': {}", command.program, e)),
        };

        let pgid = child.id();
        let deadline = tokio::time::Instant::now() + configuration.timeout;

        let mut pumps: Vec<JoinHandle<()>> = [
            child.stdout.take().map(|out| spawn_pump(out, Arc::clone(&logger))),
            child.stderr.take().map(|err| spawn_pump(err, Arc::clone(&logger))),
        ]
        .into_iter()
        .flatten()
        .collect();

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => Outcome::Succeeded,
                Ok(status) => Outcome::Failed(format!("process exited with {}", status)),
                Err(e) => Outcome::Failed(format!("failed to wait for process: {}", e)),
            },
            _ = cancel.cancelled() => {
                kill(&mut child, pgid, task).await;
                Outcome::Cancelled
            }
            _ = tokio::time::sleep_until(deadline) => {
                kill(&mut child, pgid, task).await;
                Outcome::TimedOut(configuration.timeout)
            }
        };

        // Background processes forked by the build keep the pipes open after
        // the build process itself has exited.
        let exited = matches!(outcome, Outcome::Succeeded | Outcome::Failed(_));
        let outcome = if exited {
            tokio::select! {
                _ = futures::future::join_all(pumps.iter_mut()) => outcome,
                _ = cancel.cancelled() => {
                    kill_group(pgid, task);
                    Outcome::Cancelled
                }
                _ = tokio::time::sleep_until(deadline) => {
                    kill_group(pgid, task);
                    Outcome::TimedOut(configuration.timeout)
                }
            }
        } else {
            outcome
        };

        if matches!(outcome, Outcome::Cancelled | Outcome::TimedOut(_)) {
            for pump in pumps {
                if pump.is_finished() {
                    continue;
                }
                let abort = pump.abort_handle();
                if tokio::time::timeout(PUMP_GRACE, pump).await.is_err() {
                    abort.abort();
                }
            }
        }
        outcome
    }

    async fn purge_finished(&self, older_than: Duration) -> usize {
        let Ok(older_than) = chrono::Duration::from_std(older_than) else {
            return 0;
        };
        let cutoff = chrono::Utc::now() - older_than;
        let expired: Vec<u64> = self
            .tasks
            .iter()
            .filter(|t| t.is_done() && t.ended_at().is_some_and(|end| end <= cutoff))
            .map(|t| *t.key())
            .collect();
        let mut purged = 0;
        for task_id in expired {
            if let Some((_, task)) = self.tasks.remove(&task_id) {
                let work_dir = &task.configuration().work_dir;
                if let Err(e) = tokio::fs::remove_dir_all(work_dir).await
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    tracing::warn!(task_id, "failed to remove {}: {}", work_dir.display(), e);
                }
                purged += 1;
            }
        }
        if purged > 0 {
            tracing::debug!(builder = self.kind.name(), purged, "purged finished build tasks");
        }
        purged
    }
}

async fn worker_loop(
    worker: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<BuildTask>>>,
    shared: Arc<Shared>,
) {
    loop {
        let next = { rx.lock().await.recv().await };
        let Some(task) = next else {
            break;
        };
        shared.run_task(task).await;
    }
    tracing::debug!(builder = shared.kind.name(), worker, "builder worker exiting");
}

async fn cleaner_loop(shared: Arc<Shared>) {
    let keep = shared.settings.keep_results;
    let period = (keep / 2).clamp(Duration::from_secs(1), Duration::from_secs(60));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        shared.purge_finished(keep).await;
    }
}

fn spawn_pump<R>(reader: R, logger: Arc<dyn BuildLogger>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Err(e) = logger.write_line(&line) {
                tracing::warn!("failed to write build log line: {}", e);
                break;
            }
        }
    })
}

/// Kills the build process along with everything left in its process group.
async fn kill(child: &mut tokio::process::Child, pgid: Option<u32>, task: &BuildTask) {
    kill_group(pgid, task);
    if let Err(e) = child.kill().await {
        tracing::warn!(builder = task.builder(), task_id = task.id(), "failed to kill build process: {}", e);
    }
}

#[cfg(unix)]
fn kill_group(pgid: Option<u32>, task: &BuildTask) {
    let Some(pgid) = pgid.and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    // Negative pid targets the whole process group.
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
        let e = std::io::Error::last_os_error();
        if e.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(builder = task.builder(), task_id = task.id(), pgid, "failed to kill build process group: {}", e);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: Option<u32>, _task: &BuildTask) {}
