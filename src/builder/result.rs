use std::path::{Path, PathBuf};

/// Terminal outcome of one build task.
///
/// Produced once per task. The artifact list is copied at construction so the
/// caller's buffer can be reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    success: bool,
    results: Vec<PathBuf>,
    build_report: Option<PathBuf>,
}

impl BuildResult {
    pub fn new(success: bool, results: &[PathBuf]) -> Self {
        Self {
            success,
            results: results.to_vec(),
            build_report: None,
        }
    }

    pub fn with_report(success: bool, results: &[PathBuf], report: PathBuf) -> Self {
        Self {
            success,
            results: results.to_vec(),
            build_report: Some(report),
        }
    }

    /// A failed result with no artifacts.
    pub fn failed() -> Self {
        Self::new(false, &[])
    }

    pub fn is_successful(&self) -> bool {
        self.success
    }

    /// Artifacts in the order they were supplied.
    pub fn results(&self) -> &[PathBuf] {
        &self.results
    }

    pub fn has_build_report(&self) -> bool {
        self.build_report.is_some()
    }

    pub fn build_report(&self) -> Option<&Path> {
        self.build_report.as_deref()
    }

    pub fn set_build_report(&mut self, report: Option<PathBuf>) {
        self.build_report = report;
    }
}
