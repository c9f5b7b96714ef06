use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use buildq_common::BuilderEnvironment;
use regex::Regex;

use super::configuration::BuilderConfiguration;
use super::logger::{BuildLogger, FileBuildLogger};
use super::result::BuildResult;

/// Environment variable carrying the selected builder environment id.
pub const ENVIRONMENT_VAR: &str = "BUILDQ_ENVIRONMENT";

static ENV_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid env name regex"));

/// A process to launch for a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Piped stdout/stderr, killed when dropped. On unix the process leads
    /// its own process group so everything it forks can be signalled at once.
    pub fn to_command(&self, working_dir: &Path) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Per builder-type behaviour plugged into a `Builder`.
pub trait BuilderKind: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn environments(&self) -> Vec<BuilderEnvironment> {
        Vec::new()
    }

    fn create_command_line(&self, configuration: &BuilderConfiguration) -> Result<CommandLine>;

    fn create_build_logger(
        &self,
        configuration: &BuilderConfiguration,
    ) -> Result<Arc<dyn BuildLogger>> {
        Ok(Arc::new(FileBuildLogger::create(configuration.log_file())?))
    }

    /// Computes the terminal result once the command has exited.
    fn task_result(
        &self,
        _configuration: &BuilderConfiguration,
        successful: bool,
    ) -> Result<BuildResult> {
        Ok(BuildResult::new(successful, &[]))
    }
}

/// A builder that runs a configured program in the sources directory.
///
/// Build targets from the request are appended to `args`; `skip_test_args` are
/// appended when the request asks to skip tests. Artifacts are collected from
/// glob patterns relative to the sources directory.
#[derive(Debug, Clone)]
pub struct CommandBuilderKind {
    name: String,
    description: String,
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    skip_test_args: Vec<String>,
    artifacts: Vec<String>,
    report: Option<String>,
    environments: Vec<BuilderEnvironment>,
}

impl CommandBuilderKind {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            skip_test_args: Vec::new(),
            artifacts: Vec::new(),
            report: None,
            environments: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_skip_test_args(mut self, args: Vec<String>) -> Self {
        self.skip_test_args = args;
        self
    }

    pub fn with_artifacts(mut self, patterns: Vec<String>) -> Self {
        self.artifacts = patterns;
        self
    }

    pub fn with_report(mut self, report: Option<String>) -> Self {
        self.report = report;
        self
    }

    pub fn with_environments(mut self, environments: Vec<BuilderEnvironment>) -> Self {
        self.environments = environments;
        self
    }

    fn collect_artifacts(&self, sources_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for pattern in &self.artifacts {
            let full = sources_dir.join(pattern);
            let full = full.to_string_lossy();
            let mut matches: Vec<PathBuf> = glob::glob(&full)
                .with_context(|| format!("Invalid artifact pattern '{}'", pattern))?
                .filter_map(|entry| entry.ok())
                .filter(|path| path.is_file())
                .collect();
            matches.sort();
            for path in matches {
                if !found.contains(&path) {
                    found.push(path);
                }
            }
        }
        Ok(found)
    }
}

impl BuilderKind for CommandBuilderKind {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn environments(&self) -> Vec<BuilderEnvironment> {
        self.environments.clone()
    }

    fn create_command_line(&self, configuration: &BuilderConfiguration) -> Result<CommandLine> {
        let mut command = CommandLine::new(&self.program).args(self.args.iter().cloned());
        command = command.args(configuration.targets().iter().cloned());
        if configuration.skip_test() {
            command = command.args(self.skip_test_args.iter().cloned());
        }
        for (key, value) in &self.env {
            command = command.env(key, value);
        }
        for (key, value) in &configuration.request.options.options {
            if ENV_NAME.is_match(key) {
                command = command.env(key, value);
            } else {
                tracing::debug!(option = %key, "skipping build option that is not a valid env name");
            }
        }
        if let Some(ref environment) = configuration.environment {
            command = command.env(ENVIRONMENT_VAR, environment);
        }
        Ok(command)
    }

    fn task_result(
        &self,
        configuration: &BuilderConfiguration,
        successful: bool,
    ) -> Result<BuildResult> {
        let artifacts = if successful {
            self.collect_artifacts(&configuration.sources_dir)?
        } else {
            Vec::new()
        };
        let mut result = BuildResult::new(successful, &artifacts);
        // Test reports are worth keeping for failed builds too.
        if let Some(ref report) = self.report {
            let path = configuration.sources_dir.join(report);
            if path.exists() {
                result.set_build_report(Some(path));
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildq_common::{BuildOptions, BuildRequest};
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn configuration(dir: &Path, options: BuildOptions) -> BuilderConfiguration {
        BuilderConfiguration {
            task_id: 9,
            builder: "maven".into(),
            request: BuildRequest::new("maven", "/src", "ws", "/p").with_options(options),
            work_dir: dir.to_path_buf(),
            sources_dir: dir.join("sources"),
            environment: Some("jdk17".into()),
            timeout: Duration::from_secs(30),
        }
    }

    fn maven() -> CommandBuilderKind {
        CommandBuilderKind::new("maven", "mvn")
            .with_args(vec!["-B".into()])
            .with_skip_test_args(vec!["-DskipTests".into()])
            .with_artifacts(vec!["target/*.jar".into()])
            .with_report(Some("target/surefire-reports".into()))
    }

    #[test]
    fn test_command_line_appends_targets_and_skip_tests() {
        let dir = tempdir().unwrap();
        let mut options = BuildOptions {
            targets: vec!["clean".into(), "install".into()],
            skip_test: true,
            ..Default::default()
        };
        options.options.insert("MAVEN_OPTS".into(), "-Xmx1g".into());
        options.options.insert("not a var".into(), "x".into());

        let cmd = maven()
            .create_command_line(&configuration(dir.path(), options))
            .unwrap();

        assert_eq!(cmd.program, "mvn");
        assert_eq!(cmd.args, vec!["-B", "clean", "install", "-DskipTests"]);
        assert_eq!(cmd.env.get("MAVEN_OPTS").map(String::as_str), Some("-Xmx1g"));
        assert_eq!(cmd.env.get(ENVIRONMENT_VAR).map(String::as_str), Some("jdk17"));
        assert!(!cmd.env.contains_key("not a var"));
        assert_eq!(cmd.to_string(), "mvn -B clean install -DskipTests");
    }

    #[test]
    fn test_task_result_collects_artifacts_in_order() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("sources/target");
        fs::create_dir_all(target.join("surefire-reports")).unwrap();
        fs::write(target.join("b.jar"), "b").unwrap();
        fs::write(target.join("a.jar"), "a").unwrap();
        fs::write(target.join("notes.txt"), "n").unwrap();

        let config = configuration(dir.path(), BuildOptions::default());
        let result = maven().task_result(&config, true).unwrap();

        assert!(result.is_successful());
        assert_eq!(result.results(), &[target.join("a.jar"), target.join("b.jar")]);
        assert!(result.has_build_report());
    }

    #[test]
    fn test_failed_task_result_has_no_artifacts() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("sources/target");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("a.jar"), "a").unwrap();

        let config = configuration(dir.path(), BuildOptions::default());
        let result = maven().task_result(&config, false).unwrap();

        assert!(!result.is_successful());
        assert!(result.results().is_empty());
        assert!(!result.has_build_report());
    }
}
