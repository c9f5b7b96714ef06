use std::path::PathBuf;
use std::time::Duration;

use buildq_common::BuildRequest;

/// Everything a worker needs to execute one task.
///
/// Owned by the builder for the lifetime of the task; the working directory
/// belongs to this task alone.
#[derive(Debug, Clone)]
pub struct BuilderConfiguration {
    pub task_id: u64,
    pub builder: String,
    pub request: BuildRequest,
    /// `<work_root>/<builder>/<task_id>`
    pub work_dir: PathBuf,
    /// Sources are fetched here and the build command runs here.
    pub sources_dir: PathBuf,
    pub environment: Option<String>,
    pub timeout: Duration,
}

impl BuilderConfiguration {
    pub fn targets(&self) -> &[String] {
        &self.request.options.targets
    }

    pub fn skip_test(&self) -> bool {
        self.request.options.skip_test
    }

    pub fn log_file(&self) -> PathBuf {
        self.work_dir.join("build.log")
    }
}

/// Checks the parts of a request that do not depend on builder state.
pub fn validate_request(request: &BuildRequest) -> Result<(), String> {
    if request.builder.trim().is_empty() {
        return Err("builder name is required".to_string());
    }
    if request.sources_url.trim().is_empty() {
        return Err("sources_url is required".to_string());
    }
    if request.workspace.trim().is_empty() {
        return Err("workspace is required".to_string());
    }
    if request.project.trim().is_empty() {
        return Err("project is required".to_string());
    }
    if request.options.timeout_secs == Some(0) {
        return Err("timeout_secs must be greater than zero".to_string());
    }
    Ok(())
}
