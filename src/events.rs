//! Build lifecycle notifications for other subsystems.

use buildq_common::BuildStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BuildEvent {
    /// A local builder started working on a task.
    Begun {
        builder: String,
        task_id: u64,
        workspace: String,
        project: String,
    },
    /// A local builder finished a task (any terminal status).
    Ended {
        builder: String,
        task_id: u64,
        workspace: String,
        project: String,
        status: BuildStatus,
    },
    /// The build queue handed a request to a remote builder server.
    Dispatched {
        queue_task_id: u64,
        builder: String,
        server: String,
        workspace: String,
        project: String,
    },
}

/// Broadcasts `BuildEvent`s. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct EventService {
    tx: broadcast::Sender<BuildEvent>,
}

impl EventService {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishing with nobody subscribed is fine.
    pub fn publish(&self, event: BuildEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("no subscribers for build event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventService {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let events = EventService::new(8);
        let mut rx = events.subscribe();
        events.publish(BuildEvent::Begun {
            builder: "maven".into(),
            task_id: 1,
            workspace: "ws".into(),
            project: "/p".into(),
        });
        match rx.recv().await.unwrap() {
            BuildEvent::Begun { task_id, .. } => assert_eq!(task_id, 1),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let events = EventService::default();
        events.publish(BuildEvent::Ended {
            builder: "maven".into(),
            task_id: 1,
            workspace: "ws".into(),
            project: "/p".into(),
            status: BuildStatus::Failed,
        });
    }

    #[test]
    fn test_event_json_shape() {
        let event = BuildEvent::Ended {
            builder: "maven".into(),
            task_id: 2,
            workspace: "ws".into(),
            project: "/p".into(),
            status: BuildStatus::Successful,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Ended");
        assert_eq!(json["data"]["status"], "successful");
    }
}
