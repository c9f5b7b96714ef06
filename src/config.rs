//! Configuration for buildq, read from `.buildq/buildq.toml`.
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1"
//! port = 8480
//! role = "all"          # "host", "queue" or "all"
//!
//! [logging]
//! level = "info"
//! format = "pretty"     # or "json"
//! directory = ".buildq/logs"
//!
//! [queue]
//! max_pending = 100
//! dispatch_attempts = 3
//! request_timeout_secs = 60
//!
//! [[queue.servers]]
//! url = "http://build-1:8480/internal/builder"
//! workspace = "ws-vip"
//!
//! [host]
//! description = "linux x86_64 builder"
//! work_dir = ".buildq/builds"
//! sources_root = "/srv/checkouts"
//!
//! [builders.maven]
//! program = "mvn"
//! args = ["-B"]
//! skip_test_args = ["-DskipTests"]
//! artifacts = ["target/*.jar"]
//! report = "target/surefire-reports"
//! workers = 2
//! queue_size = 10
//!
//! [[builders.maven.environments]]
//! id = "jdk17"
//! display_name = "Java 17"
//! default = true
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use buildq_common::{
    BuilderEnvironment, BuilderServerAccessCriteria, BuilderServerLocation,
    BuilderServerRegistration, ServerDescriptor,
};
use serde::{Deserialize, Serialize};

use crate::builder::{BuilderSettings, CommandBuilderKind, LocalSources};
use crate::queue::QueueSettings;

pub const CONFIG_DIR: &str = ".buildq";
pub const CONFIG_FILE: &str = "buildq.toml";

const DEFAULT_PORT: u16 = 8480;

/// Which services `buildq serve` starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    /// Only hosts builders under `/internal/builder`.
    Host,
    /// Only runs the build queue and admin routes.
    Queue,
    #[default]
    All,
}

impl ServerRole {
    pub fn hosts_builders(self) -> bool {
        matches!(self, ServerRole::Host | ServerRole::All)
    }

    pub fn runs_queue(self) -> bool {
        matches!(self, ServerRole::Queue | ServerRole::All)
    }
}

impl std::fmt::Display for ServerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerRole::Host => write!(f, "host"),
            ServerRole::Queue => write!(f, "queue"),
            ServerRole::All => write!(f, "all"),
        }
    }
}

impl std::str::FromStr for ServerRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "host" => Ok(ServerRole::Host),
            "queue" => Ok(ServerRole::Queue),
            "all" => Ok(ServerRole::All),
            _ => anyhow::bail!("Invalid server role '{}'. Valid values: host, queue, all", s),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerToml {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Falls back to `BUILDQ_PORT`, then 8480.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub cors: bool,
    #[serde(default)]
    pub role: ServerRole,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingToml {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// When set, JSON logs are also written to a daily rolling file here.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingToml {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            directory: None,
        }
    }
}

/// A builder server registered with the queue at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueServerToml {
    pub url: String,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub infra: Option<String>,
}

impl QueueServerToml {
    pub fn registration(&self) -> BuilderServerRegistration {
        let dedicated = self.workspace.is_some() || self.project.is_some() || self.infra.is_some();
        BuilderServerRegistration {
            builder_server_location: BuilderServerLocation {
                url: self.url.clone(),
            },
            builder_server_options: dedicated.then(|| BuilderServerAccessCriteria {
                workspace: self.workspace.clone(),
                project: self.project.clone(),
                infra: self.infra.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueToml {
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "default_dispatch_attempts")]
    pub dispatch_attempts: usize,
    #[serde(default = "default_keep_results_secs")]
    pub keep_results_secs: u64,
    /// How often pending task statuses are refreshed from the builder servers.
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
    /// Upper bound for one call to a builder server, artifact downloads included.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// With role "all", register this process's own builders as a shared server.
    #[serde(default = "default_true")]
    pub register_local: bool,
    #[serde(default)]
    pub servers: Vec<QueueServerToml>,
}

fn default_max_pending() -> usize {
    100
}

fn default_dispatch_attempts() -> usize {
    3
}

fn default_keep_results_secs() -> u64 {
    3600
}

fn default_refresh_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for QueueToml {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            dispatch_attempts: default_dispatch_attempts(),
            keep_results_secs: default_keep_results_secs(),
            refresh_secs: default_refresh_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            register_local: true,
            servers: Vec::new(),
        }
    }
}

impl QueueToml {
    pub fn settings(&self) -> QueueSettings {
        QueueSettings {
            max_pending: self.max_pending,
            dispatch_attempts: self.dispatch_attempts,
            keep_results: Duration::from_secs(self.keep_results_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostToml {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub assigned_workspace: Option<String>,
    #[serde(default)]
    pub assigned_project: Option<String>,
    #[serde(default)]
    pub infra: Option<String>,
    /// Falls back to `BUILDQ_WORK_DIR`, then `.buildq/builds`.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// Directory that local sources served builds may be copied from.
    /// Without it the host only accepts remote git repositories.
    #[serde(default)]
    pub sources_root: Option<PathBuf>,
}

impl HostToml {
    pub fn descriptor(&self) -> ServerDescriptor {
        ServerDescriptor {
            assigned_workspace: self.assigned_workspace.clone(),
            assigned_project: self.assigned_project.clone(),
            infra: self.infra.clone(),
            description: self.description.clone(),
            links: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentToml {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub default: bool,
}

/// One `[builders.<name>]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderToml {
    pub program: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub skip_test_args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub report: Option<String>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_keep_results_secs")]
    pub keep_results_secs: u64,
    #[serde(default)]
    pub environments: Vec<EnvironmentToml>,
}

fn default_workers() -> usize {
    2
}

fn default_queue_size() -> usize {
    10
}

fn default_timeout_secs() -> u64 {
    600
}

impl BuilderToml {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            description: None,
            args: Vec::new(),
            skip_test_args: Vec::new(),
            env: BTreeMap::new(),
            artifacts: Vec::new(),
            report: None,
            workers: default_workers(),
            queue_size: default_queue_size(),
            timeout_secs: default_timeout_secs(),
            keep_results_secs: default_keep_results_secs(),
            environments: Vec::new(),
        }
    }

    pub fn settings(&self, work_root: &Path) -> BuilderSettings {
        BuilderSettings {
            workers: self.workers,
            queue_size: self.queue_size,
            timeout: Duration::from_secs(self.timeout_secs),
            work_root: work_root.to_path_buf(),
            keep_results: Duration::from_secs(self.keep_results_secs),
        }
    }

    pub fn kind(&self, name: &str) -> CommandBuilderKind {
        let environments = self
            .environments
            .iter()
            .map(|e| BuilderEnvironment {
                id: e.id.clone(),
                is_default: e.default,
                display_name: e.display_name.clone().unwrap_or_else(|| e.id.clone()),
            })
            .collect();
        CommandBuilderKind::new(name, &self.program)
            .with_description(self.description.clone().unwrap_or_default())
            .with_args(self.args.clone())
            .with_env(self.env.clone())
            .with_skip_test_args(self.skip_test_args.clone())
            .with_artifacts(self.artifacts.clone())
            .with_report(self.report.clone())
            .with_environments(environments)
    }
}

/// Contents of `.buildq/buildq.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildqToml {
    #[serde(default)]
    pub server: ServerToml,
    #[serde(default)]
    pub logging: LoggingToml,
    #[serde(default)]
    pub queue: QueueToml,
    #[serde(default)]
    pub host: HostToml,
    #[serde(default)]
    pub builders: BTreeMap<String, BuilderToml>,
}

impl BuildqToml {
    /// Load configuration from a specific file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse buildq.toml")
    }

    /// Load `<config_dir>/buildq.toml`, or defaults if it does not exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize buildq.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// A starting point for `buildq config init`.
    pub fn sample() -> Self {
        let mut make = BuilderToml::new("make");
        make.description = Some("GNU make".to_string());
        make.artifacts = vec!["build/*".to_string()];
        let mut config = Self::default();
        config.builders.insert("make".to_string(), make);
        config
    }

    /// Port to listen on (file, then `BUILDQ_PORT`, then 8480).
    pub fn port(&self) -> u16 {
        self.server
            .port
            .or_else(|| std::env::var("BUILDQ_PORT").ok().and_then(|p| p.parse().ok()))
            .unwrap_or(DEFAULT_PORT)
    }

    /// Root of per-task build directories (file, then `BUILDQ_WORK_DIR`, then `.buildq/builds`).
    pub fn work_dir(&self) -> PathBuf {
        self.host
            .work_dir
            .clone()
            .or_else(|| std::env::var("BUILDQ_WORK_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join("builds"))
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.role.hosts_builders() && self.builders.is_empty() {
            warnings.push(format!(
                "Server role '{}' hosts builders but no [builders.<name>] table is configured",
                self.server.role
            ));
        }
        if self.host.assigned_project.is_some() && self.host.assigned_workspace.is_none() {
            warnings.push("[host] assigned_project requires assigned_workspace".to_string());
        }

        if self.queue.max_pending == 0 {
            warnings.push("[queue] max_pending is 0: every build will be rejected".to_string());
        }
        if self.queue.refresh_secs == 0 {
            warnings.push("[queue] refresh_secs is 0: treated as 1".to_string());
        }
        if self.queue.dispatch_attempts == 0 {
            warnings.push("[queue] dispatch_attempts is 0: treated as 1".to_string());
        }
        if self.queue.request_timeout_secs == 0 {
            warnings.push("[queue] request_timeout_secs is 0: treated as 1".to_string());
        }
        for server in &self.queue.servers {
            if !(server.url.starts_with("http://") || server.url.starts_with("https://")) {
                warnings.push(format!("Queue server url '{}' is not http(s)", server.url));
            }
            if server.project.is_some() && server.workspace.is_none() {
                warnings.push(format!(
                    "Queue server '{}' names a project without a workspace",
                    server.url
                ));
            }
        }

        for (name, builder) in &self.builders {
            if builder.program.trim().is_empty() {
                warnings.push(format!("Builder '{}' has an empty program", name));
            }
            if builder.workers == 0 {
                warnings.push(format!("Builder '{}' has 0 workers", name));
            }
            if builder.queue_size == 0 {
                warnings.push(format!("Builder '{}' has queue_size 0", name));
            }
            if builder.timeout_secs == 0 {
                warnings.push(format!("Builder '{}' has timeout_secs 0", name));
            }
            for pattern in &builder.artifacts {
                if let Err(e) = glob::Pattern::new(pattern) {
                    warnings.push(format!(
                        "Builder '{}' has invalid artifact pattern '{}': {}",
                        name, pattern, e
                    ));
                }
            }
            let defaults = builder.environments.iter().filter(|e| e.default).count();
            if defaults > 1 {
                warnings.push(format!(
                    "Builder '{}' marks {} environments as default",
                    name, defaults
                ));
            }
        }

        warnings
    }
}

/// Resolved configuration for a project directory.
#[derive(Debug, Clone)]
pub struct BuildqConfig {
    pub project_dir: PathBuf,
    pub config_dir: PathBuf,
    pub toml: BuildqToml,
}

impl BuildqConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let toml = BuildqToml::load_or_default(&config_dir)?;
        Ok(Self {
            project_dir,
            config_dir,
            toml,
        })
    }

    /// Uses an explicit config file instead of `.buildq/buildq.toml`.
    pub fn from_file(project_dir: PathBuf, path: &Path) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.toml = BuildqToml::load(path)?;
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Build directory root, relative paths resolved against the project.
    pub fn work_dir(&self) -> PathBuf {
        self.resolve(self.toml.work_dir())
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.toml.logging.directory.clone().map(|d| self.resolve(d))
    }

    /// Local paths a served builder host may take sources from.
    pub fn local_sources(&self) -> LocalSources {
        match self.toml.host.sources_root.clone() {
            Some(root) => LocalSources::Under(self.resolve(root)),
            None => LocalSources::Disabled,
        }
    }

    fn resolve(&self, path: PathBuf) -> PathBuf {
        if path.is_absolute() {
            path
        } else {
            self.project_dir.join(path)
        }
    }
}
