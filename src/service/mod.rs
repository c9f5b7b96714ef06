//! HTTP surface: builder host, workspace build queue and admin routes.

pub mod admin;
pub mod api;
pub mod host;
pub mod server;
pub mod workspace;

pub use api::ApiError;
pub use host::HostState;
pub use server::{ServerConfig, Services, build_router, serve, start_server};
