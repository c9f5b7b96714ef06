//! Shared domain types for buildq.
//!
//! These are the JSON shapes exchanged between the builder host
//! (`/internal/builder`), the build queue (`/builder/{workspace}`), the admin
//! surface (`/admin/builder/server`) and the command-line client.

pub mod request;
pub mod server;
pub mod task;

pub use request::{BuildOptions, BuildRequest, ProjectDescriptor};
pub use server::{
    BuilderDescriptor, BuilderEnvironment, BuilderServer, BuilderServerAccessCriteria,
    BuilderServerLocation, BuilderServerRegistration, BuilderState, ServerDescriptor, ServerState,
};
pub use task::{
    BuildResultDescriptor, BuildStatus, BuildTaskDescriptor, Link, ParseStatusError, rel,
};
