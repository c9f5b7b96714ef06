use anyhow::{Context, Result};
use buildq::config::{BuildqConfig, ServerRole};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "buildq")]
#[command(version, about = "Remote build queue and builder host")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Config file to use instead of .buildq/buildq.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Where a running buildq server is reached.
#[derive(Args, Clone)]
pub struct ServerArgs {
    #[arg(long, env = "BUILDQ_SERVER", default_value = "http://127.0.0.1:8480")]
    pub server: String,

    /// Comma-separated roles sent with each request
    #[arg(long, env = "BUILDQ_ROLES")]
    pub roles: Option<String>,
}

/// Describes one build request.
#[derive(Args, Clone)]
pub struct BuildArgs {
    /// Builder name (e.g. maven)
    #[arg(short, long)]
    pub builder: String,

    /// Directory, file:// url or git url with the sources
    #[arg(short, long)]
    pub sources: String,

    #[arg(short, long, default_value = "local")]
    pub workspace: String,

    #[arg(short, long, default_value = "/project")]
    pub project: String,

    /// Build target, may be repeated
    #[arg(short, long = "target")]
    pub targets: Vec<String>,

    #[arg(long)]
    pub skip_test: bool,

    /// Builder environment id; the builder default when omitted
    #[arg(long)]
    pub environment: Option<String>,

    /// KEY=VALUE option exported to the build, may be repeated
    #[arg(short = 'o', long = "option")]
    pub options: Vec<String>,

    /// Shortens the builder's timeout for this build
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the builder host and/or build queue HTTP server
    Serve {
        #[arg(long)]
        bind: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Which services to run: host, queue or all
        #[arg(long)]
        role: Option<ServerRole>,

        /// Enable permissive CORS
        #[arg(long)]
        cors: bool,
    },
    /// Run a single build with a locally configured builder
    Run {
        #[command(flatten)]
        build: BuildArgs,
    },
    /// Submit a build to a server's build queue
    Submit {
        #[command(flatten)]
        server: ServerArgs,

        #[command(flatten)]
        build: BuildArgs,

        /// Wait for the build to finish and print its log
        #[arg(long)]
        wait: bool,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "3600")]
        wait_timeout: u64,
    },
    /// Inspect or control a queued build task
    Task {
        #[command(flatten)]
        server: ServerArgs,

        #[arg(short, long, default_value = "local")]
        workspace: String,

        #[command(subcommand)]
        command: TaskCommands,
    },
    /// List the builders available to a workspace
    Builders {
        #[command(flatten)]
        server: ServerArgs,

        #[arg(short, long, default_value = "local")]
        workspace: String,
    },
    /// Manage the builder servers registered with a build queue
    Servers {
        #[command(flatten)]
        server: ServerArgs,

        #[command(subcommand)]
        command: Option<ServersCommands>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum TaskCommands {
    Status { id: u64 },
    Logs { id: u64 },
    Cancel { id: u64 },
    Result { id: u64 },
    /// Download a build artifact
    Download {
        id: u64,
        /// Artifact path relative to the build's sources directory
        path: String,
        /// Where to write it (defaults to the artifact's file name)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ServersCommands {
    /// List registered builder servers and their state
    List,
    /// Register a builder server
    Register {
        /// Builder service url, e.g. http://host:8480/internal/builder
        url: String,
        #[arg(long)]
        workspace: Option<String>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        infra: Option<String>,
    },
    /// Unregister a builder server
    Unregister { url: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a sample buildq.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // Config commands must work even when the config file is broken.
    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&project_dir, cli.config.as_deref(), command.clone());
    }

    let config = match &cli.config {
        Some(path) => BuildqConfig::from_file(project_dir, path)?,
        None => BuildqConfig::new(project_dir)?,
    };
    let _log_guard = buildq::logging::init(
        &config.toml.logging,
        config.log_dir().as_deref(),
        cli.verbose,
    )?;

    match cli.command {
        Commands::Serve {
            bind,
            port,
            role,
            cors,
        } => cmd::cmd_serve(config, bind, port, role, cors).await?,
        Commands::Run { build } => cmd::cmd_run(&config, &build).await?,
        Commands::Submit {
            server,
            build,
            wait,
            wait_timeout,
        } => cmd::cmd_submit(&server, &build, wait, wait_timeout).await?,
        Commands::Task {
            server,
            workspace,
            command,
        } => cmd::cmd_task(&server, &workspace, command).await?,
        Commands::Builders { server, workspace } => cmd::cmd_builders(&server, &workspace).await?,
        Commands::Servers { server, command } => cmd::cmd_servers(&server, command).await?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
