//! One-shot local build: `buildq run`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use buildq::builder::{Builder, DefaultSourcesManager};
use buildq::config::BuildqConfig;
use buildq::events::EventService;
use buildq_common::BuildStatus;

use super::build_request;
use crate::BuildArgs;

pub async fn cmd_run(config: &BuildqConfig, args: &BuildArgs) -> Result<()> {
    let builder_toml = config.toml.builders.get(&args.builder).with_context(|| {
        let known: Vec<&str> = config.toml.builders.keys().map(String::as_str).collect();
        format!(
            "No builder '{}' configured. Known builders: {}",
            args.builder,
            if known.is_empty() { "none".to_string() } else { known.join(", ") }
        )
    })?;

    let builder = Builder::new(
        Arc::new(builder_toml.kind(&args.builder)),
        builder_toml.settings(&config.work_dir()),
        Arc::new(DefaultSourcesManager::default()),
        EventService::default(),
    )?;
    builder.start()?;

    let mut request = build_request(args)?;
    let sources = Path::new(&request.sources_url);
    if sources.is_dir() {
        request.sources_url = sources
            .canonicalize()
            .context("Failed to resolve sources directory")?
            .to_string_lossy()
            .to_string();
    }

    let task = builder.perform(request)?;
    println!("Build task {} on builder '{}'", task.id(), task.builder());
    task.wait().await;

    println!();
    for line in task.logger().lines() {
        println!("{}", line);
    }
    println!();

    let status = task.status();
    if let Some(result) = task.result() {
        if !result.results().is_empty() {
            println!("Artifacts:");
            for artifact in result.results() {
                println!("  {}", artifact.display());
            }
        }
        if let Some(report) = result.build_report() {
            println!("Report: {}", report.display());
        }
    }
    builder.stop().await;

    if status != BuildStatus::Successful {
        anyhow::bail!("Build {} {}", task.id(), status);
    }
    println!("Build {} {}", task.id(), status);
    Ok(())
}
