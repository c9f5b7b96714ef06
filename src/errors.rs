//! Typed error hierarchy for buildq.
//!
//! Four top-level enums cover the four subsystems:
//! - `BuilderError`: request validation and admission on a local builder
//! - `SelectionError`: caller contract violations of selection strategies
//! - `RemoteError`: communication with a remote builder server
//! - `QueueError`: build queue admission, dispatch and task lookup
//!
//! In-flight build failures are never errors: they end up in
//! `BuildResult::is_successful() == false`.

use thiserror::Error;

/// Errors from a local builder, reported synchronously by `Builder::perform`.
#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("Invalid build request: {0}")]
    InvalidRequest(String),

    #[error("Builder '{0}' not found")]
    UnknownBuilder(String),

    #[error("Builder '{builder}' rejected the build: queue is full ({capacity} tasks waiting)")]
    QueueFull { builder: String, capacity: usize },

    #[error("Builder '{0}' is not running")]
    NotRunning(String),

    #[error("Build task {0} not found")]
    TaskNotFound(u64),

    #[error("Invalid builder settings: {0}")]
    InvalidSettings(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Selection strategies only fail when the caller breaks their contract.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("No candidate builders to select from")]
    NoCandidates,
}

/// Communication failures with a remote builder server.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Remote service error ({status}): {message}")]
    Service {
        status: u16,
        message: String,
        payload: Option<serde_json::Value>,
    },

    #[error("Builder '{name}' is not available on {server}")]
    BuilderNotFound { name: String, server: String },

    #[error("Invalid response from {url}: {message}")]
    InvalidResponse { url: String, message: String },
}

impl RemoteError {
    /// Transport failures are the ones worth retrying on another server.
    pub fn is_transport(&self) -> bool {
        matches!(self, RemoteError::Transport { .. })
    }
}

/// Errors from the build queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Invalid build request: {0}")]
    InvalidRequest(String),

    #[error("Build queue is full ({0} pending tasks)")]
    QueueFull(usize),

    #[error(
        "No builder server available for builder '{builder}' (workspace '{workspace}', project '{project}')"
    )]
    NoBuilderAvailable {
        builder: String,
        workspace: String,
        project: String,
    },

    #[error("Build task {0} not found")]
    TaskNotFound(u64),

    #[error("Builder server {0} is not registered")]
    ServerNotRegistered(String),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}
