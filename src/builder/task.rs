use std::sync::{Arc, Mutex, OnceLock};

use buildq_common::{BuildStatus, BuildTaskDescriptor};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::configuration::BuilderConfiguration;
use super::logger::BuildLogger;
use super::result::BuildResult;

#[derive(Debug, Clone, Copy)]
struct Timeline {
    status: BuildStatus,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

struct TaskInner {
    configuration: BuilderConfiguration,
    logger: Arc<dyn BuildLogger>,
    created_at: DateTime<Utc>,
    timeline: Mutex<Timeline>,
    result: OnceLock<BuildResult>,
    done: watch::Sender<bool>,
    cancel: CancellationToken,
}

/// Handle to one accepted build.
///
/// Cheap to clone; every clone observes the same task. A task is never reused:
/// `is_done()` goes from `false` to `true` once and stays there.
#[derive(Clone)]
pub struct BuildTask {
    inner: Arc<TaskInner>,
}

impl BuildTask {
    pub(crate) fn new(configuration: BuilderConfiguration, logger: Arc<dyn BuildLogger>) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(TaskInner {
                configuration,
                logger,
                created_at: Utc::now(),
                timeline: Mutex::new(Timeline {
                    status: BuildStatus::InQueue,
                    started_at: None,
                    ended_at: None,
                }),
                result: OnceLock::new(),
                done,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.configuration.task_id
    }

    pub fn builder(&self) -> &str {
        &self.inner.configuration.builder
    }

    pub fn configuration(&self) -> &BuilderConfiguration {
        &self.inner.configuration
    }

    pub fn logger(&self) -> &Arc<dyn BuildLogger> {
        &self.inner.logger
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    fn timeline(&self) -> Timeline {
        match self.inner.timeline.lock() {
            Ok(t) => *t,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn status(&self) -> BuildStatus {
        self.timeline().status
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.timeline().started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.timeline().ended_at
    }

    pub fn is_done(&self) -> bool {
        *self.inner.done.borrow()
    }

    /// The terminal result, once the worker has produced it.
    pub fn result(&self) -> Option<&BuildResult> {
        self.inner.result.get()
    }

    /// Requests cancellation. A queued task is skipped, a running one has its
    /// process killed. Either way it still reaches a terminal state.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Resolves once the task is done.
    pub async fn wait(&self) {
        let mut rx = self.inner.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub(crate) fn mark_started(&self) {
        if let Ok(mut t) = self.inner.timeline.lock() {
            t.status = BuildStatus::InProgress;
            t.started_at = Some(Utc::now());
        }
    }

    /// Stores the terminal result. Returns `false` if one was already stored.
    pub(crate) fn complete(&self, status: BuildStatus, result: BuildResult) -> bool {
        debug_assert!(status.is_terminal());
        if self.inner.result.set(result).is_err() {
            return false;
        }
        if let Ok(mut t) = self.inner.timeline.lock() {
            t.status = status;
            t.ended_at = Some(Utc::now());
        }
        true
    }

    /// Flips the done flag. Called after end listeners have run.
    pub(crate) fn finish(&self) {
        self.inner.done.send_replace(true);
    }

    pub fn descriptor(&self) -> BuildTaskDescriptor {
        let timeline = self.timeline();
        let request = &self.inner.configuration.request;
        BuildTaskDescriptor {
            task_id: self.id(),
            builder: self.builder().to_string(),
            status: timeline.status,
            workspace: request.workspace.clone(),
            project: request.project.clone(),
            created_at: self.inner.created_at,
            started_at: timeline.started_at,
            ended_at: timeline.ended_at,
            links: Vec::new(),
        }
    }
}

impl std::fmt::Debug for BuildTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildTask")
            .field("id", &self.id())
            .field("builder", &self.builder())
            .field("status", &self.status())
            .field("done", &self.is_done())
            .finish()
    }
}
