//! Builder host and build queue server: `buildq serve`.

use anyhow::{Context, Result};
use buildq::App;
use buildq::config::{BuildqConfig, ServerRole};
use buildq::service::host::HOST_PREFIX;
use buildq::service::server::{ServerConfig, bind, serve, shutdown_signal};
use buildq_common::BuilderServerRegistration;

pub async fn cmd_serve(
    mut config: BuildqConfig,
    bind_addr: Option<String>,
    port: Option<u16>,
    role: Option<ServerRole>,
    cors: bool,
) -> Result<()> {
    if let Some(role) = role {
        config.toml.server.role = role;
    }
    for warning in config.toml.validate() {
        tracing::warn!("config: {}", warning);
    }

    let server_config = ServerConfig {
        bind: bind_addr.unwrap_or_else(|| config.toml.server.bind.clone()),
        port: port.unwrap_or_else(|| config.toml.port()),
        cors: cors || config.toml.server.cors,
    };

    let mut app = App::from_config(&config)?;
    app.start()?;

    let listener = bind(&server_config).await?;
    let local_addr = listener.local_addr()?;
    let server = tokio::spawn(serve(
        listener,
        server_config.cors,
        app.services(),
        shutdown_signal(),
    ));

    let mut registrations: Vec<BuilderServerRegistration> = config
        .toml
        .queue
        .servers
        .iter()
        .map(|s| s.registration())
        .collect();
    if config.toml.server.role == ServerRole::All && config.toml.queue.register_local {
        let host = match local_addr.ip() {
            ip if ip.is_unspecified() => "127.0.0.1".to_string(),
            ip => ip.to_string(),
        };
        registrations.push(BuilderServerRegistration::shared(format!(
            "http://{}:{}{}",
            host,
            local_addr.port(),
            HOST_PREFIX
        )));
    }
    let registered = app.register_servers(&registrations).await;
    if !registrations.is_empty() {
        tracing::info!(registered, configured = registrations.len(), "builder servers registered");
    }

    let result = server.await.context("Server task failed")?;
    app.shutdown().await;
    result
}
