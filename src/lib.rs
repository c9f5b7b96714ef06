//! buildq: bounded local builder pools, a workspace-aware build queue that
//! dispatches to remote builder servers, and the HTTP surfaces tying them
//! together.

pub mod app;
pub mod builder;
pub mod client;
pub mod config;
pub mod errors;
pub mod events;
pub mod logging;
pub mod queue;
pub mod remote;
pub mod selection;
pub mod service;

pub use app::App;
pub use client::BuilderServiceClient;
pub use config::{BuildqConfig, BuildqToml};
pub use errors::{BuilderError, QueueError, RemoteError, SelectionError};
pub use events::{BuildEvent, EventService};
pub use queue::{BuildQueue, QueueSettings, QueueTask};
