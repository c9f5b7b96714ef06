//! Local build execution: builder kinds, the worker pool and task handles.

pub mod configuration;
pub mod engine;
pub mod kind;
pub mod listener;
pub mod logger;
pub mod registry;
pub mod result;
pub mod sources;
pub mod task;

pub use configuration::BuilderConfiguration;
pub use engine::{Builder, BuilderSettings};
pub use kind::{BuilderKind, CommandBuilderKind, CommandLine};
pub use listener::BuildListener;
pub use logger::{BuildLogger, FileBuildLogger, InMemoryBuildLogger};
pub use registry::BuilderRegistry;
pub use result::BuildResult;
pub use sources::{DefaultSourcesManager, LocalSources, SourcesManager};
pub use task::BuildTask;
