use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of a build task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    InQueue,
    InProgress,
    Successful,
    Failed,
    Cancelled,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::InQueue => "in_queue",
            BuildStatus::InProgress => "in_progress",
            BuildStatus::Successful => "successful",
            BuildStatus::Failed => "failed",
            BuildStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Successful | BuildStatus::Failed | BuildStatus::Cancelled
        )
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Invalid build status '{0}'")]
pub struct ParseStatusError(pub String);

impl std::str::FromStr for BuildStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_queue" => Ok(BuildStatus::InQueue),
            "in_progress" => Ok(BuildStatus::InProgress),
            "successful" => Ok(BuildStatus::Successful),
            "failed" => Ok(BuildStatus::Failed),
            "cancelled" => Ok(BuildStatus::Cancelled),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Link relations used in task descriptors.
pub mod rel {
    pub const STATUS: &str = "get status";
    pub const LOGS: &str = "view build log";
    pub const CANCEL: &str = "cancel";
    pub const RESULT: &str = "get result";
    pub const DOWNLOAD: &str = "download result";
}

/// Hypermedia link advertised by a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub rel: String,
    pub href: String,
    pub method: String,
}

impl Link {
    pub fn get(rel: impl Into<String>, href: impl Into<String>) -> Self {
        Self {
            rel: rel.into(),
            href: href.into(),
            method: "GET".to_string(),
        }
    }

    pub fn post(rel: impl Into<String>, href: impl Into<String>) -> Self {
        Self {
            rel: rel.into(),
            href: href.into(),
            method: "POST".to_string(),
        }
    }
}

/// Snapshot of a build task as reported over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTaskDescriptor {
    pub task_id: u64,
    pub builder: String,
    pub status: BuildStatus,
    pub workspace: String,
    pub project: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub links: Vec<Link>,
}

impl BuildTaskDescriptor {
    pub fn link(&self, rel: &str) -> Option<&Link> {
        self.links.iter().find(|l| l.rel == rel)
    }
}

/// Terminal outcome of a build as reported over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResultDescriptor {
    pub success: bool,
    /// Artifact paths relative to the task's sources directory.
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub report: Option<String>,
}
