//! Build queue client commands: `buildq submit`, `buildq task`, `buildq builders`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use buildq::BuilderServiceClient;
use buildq_common::BuildStatus;
use serde::Serialize;

use super::build_request;
use crate::{BuildArgs, ServerArgs, TaskCommands};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub fn client(server: &ServerArgs) -> Result<BuilderServiceClient> {
    BuilderServiceClient::new(&server.server, server.roles.as_deref())
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn cmd_submit(
    server: &ServerArgs,
    args: &BuildArgs,
    wait: bool,
    wait_timeout: u64,
) -> Result<()> {
    let client = client(server)?;
    let request = build_request(args)?;
    let task = client
        .build(&args.workspace, &request)
        .await
        .context("Failed to submit build")?;

    if !wait {
        return print_json(&task);
    }

    println!("Build task {} submitted, waiting...", task.task_id);
    let done = client
        .wait(
            &args.workspace,
            task.task_id,
            POLL_INTERVAL,
            Duration::from_secs(wait_timeout),
        )
        .await?;
    print!("{}", client.logs(&args.workspace, task.task_id).await?);

    if done.status != BuildStatus::Successful {
        anyhow::bail!("Build {} {}", done.task_id, done.status);
    }
    let result = client.result(&args.workspace, task.task_id).await?;
    print_json(&result)
}

pub async fn cmd_task(server: &ServerArgs, workspace: &str, command: TaskCommands) -> Result<()> {
    let client = client(server)?;
    match command {
        TaskCommands::Status { id } => print_json(&client.status(workspace, id).await?)?,
        TaskCommands::Logs { id } => print!("{}", client.logs(workspace, id).await?),
        TaskCommands::Cancel { id } => print_json(&client.cancel(workspace, id).await?)?,
        TaskCommands::Result { id } => print_json(&client.result(workspace, id).await?)?,
        TaskCommands::Download { id, path, output } => {
            let download = client.download(workspace, id, &path).await?;
            let output = match output {
                Some(output) => output,
                None => PathBuf::from(&path)
                    .file_name()
                    .map(PathBuf::from)
                    .with_context(|| format!("Cannot derive a file name from '{}'", path))?,
            };
            std::fs::write(&output, &download.bytes)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!(
                "Saved {} ({} bytes, {})",
                output.display(),
                download.bytes.len(),
                download.content_type.as_deref().unwrap_or("unknown type")
            );
        }
    }
    Ok(())
}

pub async fn cmd_builders(server: &ServerArgs, workspace: &str) -> Result<()> {
    let builders = client(server)?.builders(workspace).await?;
    if builders.is_empty() {
        println!("No builders available to workspace '{}'", workspace);
        return Ok(());
    }
    for builder in builders {
        println!("{}  {}", builder.name, builder.description);
        for env in builder.environments.values() {
            let marker = if env.is_default { " (default)" } else { "" };
            println!("    {}  {}{}", env.id, env.display_name, marker);
        }
    }
    Ok(())
}
