use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Minimal description of the project being built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub project_type: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Vec<String>>,
}

/// Caller supplied knobs for a single build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Build targets appended to the builder's command line (e.g. `install`).
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub skip_test: bool,
    /// Free-form `KEY=VALUE` options exported to the build process environment.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Overrides the builder's default timeout when shorter.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// A request to build one project with one builder.
///
/// Created by the caller and never mutated once handed to a builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Name of the builder to use (e.g. `maven`).
    pub builder: String,
    /// Where the builder fetches sources from: a directory, `file://` url or git url.
    pub sources_url: String,
    pub workspace: String,
    pub project: String,
    #[serde(default)]
    pub project_descriptor: ProjectDescriptor,
    #[serde(default)]
    pub options: BuildOptions,
    /// Environment id advertised by the builder. `None` selects the default.
    #[serde(default)]
    pub environment: Option<String>,
}

impl BuildRequest {
    pub fn new(
        builder: impl Into<String>,
        sources_url: impl Into<String>,
        workspace: impl Into<String>,
        project: impl Into<String>,
    ) -> Self {
        Self {
            builder: builder.into(),
            sources_url: sources_url.into(),
            workspace: workspace.into(),
            project: project.into(),
            project_descriptor: ProjectDescriptor::default(),
            options: BuildOptions::default(),
            environment: None,
        }
    }

    pub fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_when_fields_missing() {
        let json = r#"{
            "builder": "maven",
            "sources_url": "/tmp/src",
            "workspace": "ws-1",
            "project": "/hello"
        }"#;
        let req: BuildRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.builder, "maven");
        assert!(req.options.targets.is_empty());
        assert!(!req.options.skip_test);
        assert_eq!(req.environment, None);
    }

    #[test]
    fn test_request_builders() {
        let req = BuildRequest::new("maven", "/src", "ws", "/p")
            .with_environment("jdk8")
            .with_options(BuildOptions {
                targets: vec!["install".into()],
                ..Default::default()
            });
        assert_eq!(req.environment.as_deref(), Some("jdk8"));
        assert_eq!(req.options.targets, vec!["install".to_string()]);
    }
}
