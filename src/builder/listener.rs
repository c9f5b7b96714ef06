use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use anyhow::Result;

use super::task::BuildTask;

/// Callbacks around the execution of every task on a builder.
///
/// Both methods run on the worker executing the task, so they must not block
/// for long: a slow listener holds a worker slot.
pub trait BuildListener: Send + Sync {
    fn begin(&self, task: &BuildTask) -> Result<()>;
    fn end(&self, task: &BuildTask) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Begin,
    End,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Phase::Begin => "begin",
            Phase::End => "end",
        }
    }
}

/// Registered listeners of one builder.
///
/// A listener that fails or panics is logged and skipped; the others still run.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn BuildListener>>>,
}

impl ListenerSet {
    pub fn add(&self, listener: Arc<dyn BuildListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    /// Removes a listener previously added. Returns `false` if it was not registered.
    pub fn remove(&self, listener: &Arc<dyn BuildListener>) -> bool {
        let Ok(mut listeners) = self.listeners.write() else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify_begin(&self, task: &BuildTask) {
        self.notify(Phase::Begin, task);
    }

    pub fn notify_end(&self, task: &BuildTask) {
        self.notify(Phase::End, task);
    }

    fn notify(&self, phase: Phase, task: &BuildTask) {
        // Snapshot so listeners may (un)register from inside a callback.
        let listeners: Vec<_> = match self.listeners.read() {
            Ok(l) => l.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| match phase {
                Phase::Begin => listener.begin(task),
                Phase::End => listener.end(task),
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(
                    builder = task.builder(),
                    task_id = task.id(),
                    phase = phase.as_str(),
                    "build listener failed: {:#}",
                    e
                ),
                Err(_) => tracing::error!(
                    builder = task.builder(),
                    task_id = task.id(),
                    phase = phase.as_str(),
                    "build listener panicked"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::configuration::BuilderConfiguration;
    use crate::builder::logger::InMemoryBuildLogger;
    use buildq_common::BuildRequest;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    fn test_task() -> BuildTask {
        let configuration = BuilderConfiguration {
            task_id: 3,
            builder: "maven".into(),
            request: BuildRequest::new("maven", "/src", "ws", "/p"),
            work_dir: PathBuf::from("/tmp/b/3"),
            sources_dir: PathBuf::from("/tmp/b/3/sources"),
            environment: None,
            timeout: Duration::from_secs(60),
        };
        BuildTask::new(configuration, Arc::new(InMemoryBuildLogger::new()))
    }

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<String>>,
    }

    impl BuildListener for Recording {
        fn begin(&self, task: &BuildTask) -> Result<()> {
            self.events.lock().unwrap().push(format!("begin:{}", task.id()));
            Ok(())
        }
        fn end(&self, task: &BuildTask) -> Result<()> {
            self.events.lock().unwrap().push(format!("end:{}", task.id()));
            Ok(())
        }
    }

    struct Failing;

    impl BuildListener for Failing {
        fn begin(&self, _task: &BuildTask) -> Result<()> {
            anyhow::bail!("listener refused")
        }
        fn end(&self, _task: &BuildTask) -> Result<()> {
            panic!("listener exploded")
        }
    }

    #[test]
    fn test_failing_listener_does_not_stop_others() {
        let set = ListenerSet::default();
        let recording = Arc::new(Recording::default());
        set.add(Arc::new(Failing));
        set.add(recording.clone());

        let task = test_task();
        set.notify_begin(&task);
        set.notify_end(&task);

        assert_eq!(*recording.events.lock().unwrap(), vec!["begin:3", "end:3"]);
    }

    #[test]
    fn test_remove_listener() {
        let set = ListenerSet::default();
        let listener: Arc<dyn BuildListener> = Arc::new(Recording::default());
        set.add(listener.clone());
        assert_eq!(set.len(), 1);
        assert!(set.remove(&listener));
        assert!(!set.remove(&listener));
        assert!(set.is_empty());
    }
}
