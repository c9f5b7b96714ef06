//! Builder server registration: `buildq servers`.

use anyhow::Result;
use buildq_common::{BuilderServerAccessCriteria, BuilderServerLocation, BuilderServerRegistration};

use super::remote::{client, print_json};
use crate::{ServerArgs, ServersCommands};

pub async fn cmd_servers(server: &ServerArgs, command: Option<ServersCommands>) -> Result<()> {
    let client = client(server)?;
    match command {
        None | Some(ServersCommands::List) => {
            let servers = client.registered_servers().await?;
            if servers.is_empty() {
                println!("No builder servers registered.");
                return Ok(());
            }
            for server in servers {
                let scope = match (&server.assigned_workspace, &server.assigned_project) {
                    (Some(ws), Some(project)) => format!("dedicated to {}{}", ws, project),
                    (Some(ws), None) => format!("dedicated to {}", ws),
                    _ => "shared".to_string(),
                };
                println!("{}  [{}]", server.url, scope);
                match &server.server_state {
                    Some(state) => {
                        for builder in &state.builders {
                            println!(
                                "    {}  active {}/{}  queued {}/{}",
                                builder.name,
                                builder.active_tasks,
                                builder.workers,
                                builder.queued_tasks,
                                builder.queue_capacity
                            );
                        }
                    }
                    None => println!("    (unreachable)"),
                }
            }
        }
        Some(ServersCommands::Register {
            url,
            workspace,
            project,
            infra,
        }) => {
            let options = (workspace.is_some() || project.is_some() || infra.is_some()).then(|| {
                BuilderServerAccessCriteria {
                    workspace,
                    project,
                    infra,
                }
            });
            let registration = BuilderServerRegistration {
                builder_server_location: BuilderServerLocation { url },
                builder_server_options: options,
            };
            print_json(&client.register_server(&registration).await?)?;
        }
        Some(ServersCommands::Unregister { url }) => {
            client
                .unregister_server(&BuilderServerLocation { url: url.clone() })
                .await?;
            println!("Unregistered {}", url);
        }
    }
    Ok(())
}
