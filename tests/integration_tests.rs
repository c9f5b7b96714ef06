//! Integration tests for buildq
//!
//! CLI behaviour through the compiled binary, and end-to-end dispatch from a
//! build queue to a builder host over real HTTP.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a buildq Command
fn buildq() -> Command {
    cargo_bin_cmd!("buildq")
}

/// Helper to create a temporary project directory
fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

/// Writes `.buildq/buildq.toml` into the project.
fn write_config(dir: &TempDir, content: &str) {
    let config_dir = dir.path().join(".buildq");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(config_dir.join("buildq.toml"), content).unwrap();
}

/// A sources directory holding a README.
fn create_sources() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("README"), "hello buildq\n").unwrap();
    dir
}

const LOCAL_BUILDERS: &str = r#"
[builders.copy]
program = "sh"
args = ["-c", "cp README out.txt && cat README"]
artifacts = ["out.txt"]

[builders.broken]
program = "false"
"#;

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_buildq_help() {
        buildq()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("submit"));
    }

    #[test]
    fn test_buildq_version() {
        buildq().arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_command_fails() {
        buildq().arg("frobnicate").assert().failure();
    }
}

// =============================================================================
// Config Command Tests
// =============================================================================

mod config_command {
    use super::*;

    #[test]
    fn test_config_init_creates_file() {
        let dir = create_temp_project();

        buildq()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created buildq.toml"));

        let content = fs::read_to_string(dir.path().join(".buildq/buildq.toml")).unwrap();
        assert!(content.contains("[builders.make]"));
    }

    #[test]
    fn test_config_init_does_not_overwrite() {
        let dir = create_temp_project();
        write_config(&dir, LOCAL_BUILDERS);

        buildq()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        let content = fs::read_to_string(dir.path().join(".buildq/buildq.toml")).unwrap();
        assert!(content.contains("[builders.copy]"));
    }

    #[test]
    fn test_config_show_lists_builders() {
        let dir = create_temp_project();
        write_config(&dir, LOCAL_BUILDERS);

        buildq()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[builders.copy]"))
            .stdout(predicate::str::contains("port = "));
    }

    #[test]
    fn test_config_validate_clean() {
        let dir = create_temp_project();
        write_config(&dir, LOCAL_BUILDERS);

        buildq()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = create_temp_project();
        write_config(
            &dir,
            r#"
[builders.bad]
program = "make"
workers = 0

[[queue.servers]]
url = "build-1:8480"
"#,
        );

        buildq()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("0 workers"))
            .stdout(predicate::str::contains("not http(s)"));
    }

    #[test]
    fn test_broken_config_is_reported() {
        let dir = create_temp_project();
        write_config(&dir, "[server\nport =");

        buildq()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse buildq.toml"));
    }
}

// =============================================================================
// Local Run Tests
// =============================================================================

mod local_run {
    use super::*;

    #[test]
    fn test_run_successful_build() {
        let dir = create_temp_project();
        write_config(&dir, LOCAL_BUILDERS);
        let sources = create_sources();

        buildq()
            .current_dir(dir.path())
            .args(["run", "-b", "copy", "-s"])
            .arg(sources.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("hello buildq"))
            .stdout(predicate::str::contains("out.txt"))
            .stdout(predicate::str::contains("successful"));

        assert!(dir.path().join(".buildq/builds/copy").exists());
    }

    #[test]
    fn test_run_failed_build_exits_nonzero() {
        let dir = create_temp_project();
        write_config(&dir, LOCAL_BUILDERS);
        let sources = create_sources();

        buildq()
            .current_dir(dir.path())
            .args(["run", "-b", "broken", "-s"])
            .arg(sources.path())
            .assert()
            .failure()
            .stderr(predicate::str::contains("failed"));
    }

    #[test]
    fn test_run_unknown_builder() {
        let dir = create_temp_project();
        write_config(&dir, LOCAL_BUILDERS);

        buildq()
            .current_dir(dir.path())
            .args(["run", "-b", "maven", "-s", "."])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No builder 'maven' configured"))
            .stderr(predicate::str::contains("broken, copy"));
    }

    #[test]
    fn test_run_rejects_bad_option() {
        let dir = create_temp_project();
        write_config(&dir, LOCAL_BUILDERS);
        let sources = create_sources();

        buildq()
            .current_dir(dir.path())
            .args(["run", "-b", "copy", "-o", "NOEQUALS", "-s"])
            .arg(sources.path())
            .assert()
            .failure()
            .stderr(predicate::str::contains("expected KEY=VALUE"));
    }
}

// =============================================================================
// End-to-end Dispatch Tests
// =============================================================================

mod dispatch {
    use super::*;
    use buildq::config::{BuilderToml, BuildqConfig, ServerRole};
    use buildq::errors::RemoteError;
    use buildq::service::{Services, serve};
    use buildq::{App, BuilderServiceClient};
    use buildq_common::{BuildRequest, BuildStatus, BuilderServerRegistration, rel};
    use std::time::Duration;

    struct Cluster {
        queue_url: String,
        host_url: String,
        _apps: Vec<App>,
        _dirs: Vec<TempDir>,
    }

    async fn spawn(services: Services) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, false, services, std::future::pending()));
        format!("http://{}", addr)
    }

    fn app(dir: &TempDir, role: ServerRole) -> App {
        let mut config = BuildqConfig::new(dir.path().to_path_buf()).unwrap();
        config.toml.server.role = role;
        // Sources are created with TempDir::new()
        config.toml.host.sources_root = Some(std::env::temp_dir());
        let mut copy = BuilderToml::new("sh");
        copy.args = vec!["-c".into(), "cp README out.txt && cat README".into()];
        copy.artifacts = vec!["out.txt".into()];
        config.toml.builders.insert("copy".into(), copy);
        let mut sleep = BuilderToml::new("sleep");
        sleep.args = vec!["30".into()];
        config.toml.builders.insert("sleep".into(), sleep);
        let mut app = App::from_config(&config).unwrap();
        app.start().unwrap();
        app
    }

    /// A builder host and a build queue with the host registered as shared.
    async fn cluster() -> Cluster {
        let host_dir = TempDir::new().unwrap();
        let host = app(&host_dir, ServerRole::Host);
        let host_url = spawn(host.services()).await;

        let queue_dir = TempDir::new().unwrap();
        let queue = app(&queue_dir, ServerRole::Queue);
        let queue_url = spawn(queue.services()).await;

        let admin = BuilderServiceClient::new(&queue_url, Some("system/admin")).unwrap();
        let server = admin
            .register_server(&BuilderServerRegistration::shared(format!(
                "{}/internal/builder",
                host_url
            )))
            .await
            .unwrap();
        assert!(!server.dedicated);

        Cluster {
            queue_url,
            host_url,
            _apps: vec![host, queue],
            _dirs: vec![host_dir, queue_dir],
        }
    }

    #[tokio::test]
    async fn test_build_through_queue() {
        let cluster = cluster().await;
        let sources = create_sources();
        let client = BuilderServiceClient::new(&cluster.queue_url, None).unwrap();

        let request = BuildRequest::new("copy", sources.path().to_string_lossy(), "ws-1", "/app");
        let task = client.build("ws-1", &request).await.unwrap();
        assert_eq!(task.workspace, "ws-1");
        assert_eq!(
            task.link(rel::STATUS).unwrap().href,
            format!("/builder/ws-1/status/{}", task.task_id)
        );

        let done = client
            .wait("ws-1", task.task_id, Duration::from_millis(50), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(done.status, BuildStatus::Successful);
        assert!(done.link(rel::RESULT).is_some());

        let logs = client.logs("ws-1", task.task_id).await.unwrap();
        assert!(logs.contains("hello buildq"));

        let result = client.result("ws-1", task.task_id).await.unwrap();
        assert!(result.success);
        assert_eq!(result.artifacts, vec!["out.txt".to_string()]);

        let download = client.download("ws-1", task.task_id, "out.txt").await.unwrap();
        assert_eq!(download.bytes, b"hello buildq\n");

        // Tasks are only visible to their own workspace.
        match client.status("ws-2", task.task_id).await {
            Err(RemoteError::Service { status, .. }) => assert_eq!(status, 404),
            other => panic!("expected 404, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_through_queue() {
        let cluster = cluster().await;
        let sources = create_sources();
        let client = BuilderServiceClient::new(&cluster.queue_url, None).unwrap();

        let request = BuildRequest::new("sleep", sources.path().to_string_lossy(), "ws-1", "/app");
        let task = client.build("ws-1", &request).await.unwrap();
        client.cancel("ws-1", task.task_id).await.unwrap();

        let done = client
            .wait("ws-1", task.task_id, Duration::from_millis(50), Duration::from_secs(20))
            .await
            .unwrap();
        assert_eq!(done.status, BuildStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_available_builders_and_missing_builder() {
        let cluster = cluster().await;
        let client = BuilderServiceClient::new(&cluster.queue_url, None).unwrap();

        let names: Vec<String> = client
            .builders("ws-1")
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["copy".to_string(), "sleep".to_string()]);

        let request = BuildRequest::new("maven", "/tmp", "ws-1", "/app");
        match client.build("ws-1", &request).await {
            Err(RemoteError::Service { status, .. }) => assert_eq!(status, 503),
            other => panic!("expected 503, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_admin_routes_need_admin_role() {
        let cluster = cluster().await;

        let anonymous = BuilderServiceClient::new(&cluster.queue_url, None).unwrap();
        match anonymous.registered_servers().await {
            Err(RemoteError::Service { status, .. }) => assert_eq!(status, 403),
            other => panic!("expected 403, got {:?}", other),
        }

        let admin = BuilderServiceClient::new(&cluster.queue_url, Some("system/admin")).unwrap();
        let servers = admin.registered_servers().await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].url, format!("{}/internal/builder", cluster.host_url));
        let state = servers[0].server_state.as_ref().unwrap();
        assert_eq!(state.builders.len(), 2);

        admin
            .unregister_server(&buildq_common::BuilderServerLocation {
                url: servers[0].url.clone(),
            })
            .await
            .unwrap();
        assert!(admin.registered_servers().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cli_submit_and_wait() {
        let cluster = cluster().await;
        let sources = create_sources();
        let queue_url = cluster.queue_url.clone();
        let sources_path = sources.path().to_path_buf();

        tokio::task::spawn_blocking(move || {
            let dir = create_temp_project();
            buildq()
                .current_dir(dir.path())
                .args(["submit", "--server", &queue_url, "-b", "copy", "-w", "ws-1", "--wait", "-s"])
                .arg(&sources_path)
                .assert()
                .success()
                .stdout(predicate::str::contains("hello buildq"))
                .stdout(predicate::str::contains("out.txt"));

            buildq()
                .current_dir(dir.path())
                .args(["servers", "list", "--server", &queue_url])
                .env_remove("BUILDQ_ROLES")
                .assert()
                .failure()
                .stderr(predicate::str::contains("403"));
        })
        .await
        .unwrap();
    }
}
