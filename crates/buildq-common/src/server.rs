use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::task::Link;

/// A named execution environment advertised by a builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderEnvironment {
    pub id: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub environments: BTreeMap<String, BuilderEnvironment>,
}

/// Load snapshot of a single builder's worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderState {
    pub name: String,
    pub workers: usize,
    pub active_tasks: usize,
    pub queued_tasks: usize,
    pub queue_capacity: usize,
    pub total_tasks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    pub builders: Vec<BuilderState>,
    pub uptime_secs: u64,
}

/// What a builder host says about itself at `GET /internal/builder`.
///
/// `assigned_workspace == None` means the host belongs to the shared pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    #[serde(default)]
    pub assigned_workspace: Option<String>,
    #[serde(default)]
    pub assigned_project: Option<String>,
    #[serde(default)]
    pub infra: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub links: Vec<Link>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderServerAccessCriteria {
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub infra: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderServerLocation {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderServerRegistration {
    pub builder_server_location: BuilderServerLocation,
    #[serde(default)]
    pub builder_server_options: Option<BuilderServerAccessCriteria>,
}

impl BuilderServerRegistration {
    pub fn shared(url: impl Into<String>) -> Self {
        Self {
            builder_server_location: BuilderServerLocation { url: url.into() },
            builder_server_options: None,
        }
    }

    pub fn dedicated(
        url: impl Into<String>,
        workspace: impl Into<String>,
        project: Option<String>,
    ) -> Self {
        Self {
            builder_server_location: BuilderServerLocation { url: url.into() },
            builder_server_options: Some(BuilderServerAccessCriteria {
                workspace: Some(workspace.into()),
                project,
                infra: None,
            }),
        }
    }
}

/// Admin listing entry for one registered builder server.
///
/// `description` and `server_state` are omitted when the server could not be
/// reached while building the listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderServer {
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    pub dedicated: bool,
    #[serde(default)]
    pub assigned_workspace: Option<String>,
    #[serde(default)]
    pub assigned_project: Option<String>,
    #[serde(default)]
    pub infra: Option<String>,
    #[serde(default)]
    pub server_state: Option<ServerState>,
    #[serde(default)]
    pub links: Vec<Link>,
}
