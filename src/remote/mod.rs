//! HTTP proxies for builder servers registered with the build queue.

pub mod builder;
pub mod http;
pub mod server;

pub use builder::{RemoteBuilder, RemoteTask};
pub use server::{RemoteBuilderServer, normalize_url};
