//! Configuration view and validation commands: `buildq config`.

use std::path::Path;

use anyhow::Result;
use buildq::config::{BuildqToml, CONFIG_DIR, CONFIG_FILE};

use crate::ConfigCommands;

pub fn cmd_config(
    project_dir: &Path,
    config_file: Option<&Path>,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let config_path = match config_file {
        Some(path) => path.to_path_buf(),
        None => project_dir.join(CONFIG_DIR).join(CONFIG_FILE),
    };

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("buildq Configuration");
            println!("====================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                BuildqToml::load(&config_path)?
            } else {
                println!("No buildq.toml found at {}", config_path.display());
                println!("Using default configuration.");
                BuildqToml::default()
            };
            println!();

            println!("[server]");
            println!("  bind = \"{}\"", toml.server.bind);
            println!("  port = {}", toml.port());
            println!("  role = \"{}\"", toml.server.role);
            println!("  cors = {}", toml.server.cors);
            println!();

            println!("[queue]");
            println!("  max_pending = {}", toml.queue.max_pending);
            println!("  dispatch_attempts = {}", toml.queue.dispatch_attempts);
            println!("  keep_results_secs = {}", toml.queue.keep_results_secs);
            println!("  request_timeout_secs = {}", toml.queue.request_timeout_secs);
            for server in &toml.queue.servers {
                match &server.workspace {
                    Some(ws) => println!("  server {} (workspace {})", server.url, ws),
                    None => println!("  server {}", server.url),
                }
            }
            println!();

            println!("[host]");
            println!("  work_dir = \"{}\"", toml.work_dir().display());
            match &toml.host.sources_root {
                Some(root) => println!("  sources_root = \"{}\"", root.display()),
                None => println!("  sources_root not set: only git sources are accepted"),
            }
            if let Some(ws) = &toml.host.assigned_workspace {
                println!("  assigned_workspace = \"{}\"", ws);
            }
            println!();

            for (name, builder) in &toml.builders {
                println!("[builders.{}]", name);
                println!("  program = \"{}\"", builder.program);
                if !builder.args.is_empty() {
                    println!("  args = {:?}", builder.args);
                }
                println!(
                    "  workers = {}, queue_size = {}, timeout_secs = {}",
                    builder.workers, builder.queue_size, builder.timeout_secs
                );
                for env in &builder.environments {
                    let marker = if env.default { " (default)" } else { "" };
                    println!("  environment {}{}", env.id, marker);
                }
                println!();
            }

            if !config_path.exists() {
                println!("Run 'buildq config init' to create a buildq.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let toml = if config_path.exists() {
                BuildqToml::load(&config_path)?
            } else {
                println!("No buildq.toml found. Checking defaults.");
                BuildqToml::default()
            };
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("buildq.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            BuildqToml::sample().save(&config_path)?;

            println!("Created buildq.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] bind, port, role");
            println!("  - [queue] limits and [[queue.servers]] registrations");
            println!("  - [builders.<name>] program, args, artifacts, environments");
            println!();
        }
    }

    Ok(())
}
