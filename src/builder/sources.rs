use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use walkdir::WalkDir;

use super::configuration::BuilderConfiguration;
use super::logger::BuildLogger;

/// Build option naming the git branch to check out.
pub const BRANCH_OPTION: &str = "branch";

/// Materialises a project's sources into `configuration.sources_dir`.
///
/// Runs on the worker before the build command; an error fails the task.
#[async_trait]
pub trait SourcesManager: Send + Sync {
    async fn get_sources(
        &self,
        configuration: &BuilderConfiguration,
        logger: &dyn BuildLogger,
    ) -> Result<()>;
}

/// Where a `sources_url` points to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    Directory(PathBuf),
    Git(String),
}

impl SourceLocation {
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        if let Some(path) = url.strip_prefix("file://") {
            return Ok(SourceLocation::Directory(PathBuf::from(path)));
        }
        if let Some(rest) = url.strip_prefix("git+") {
            return Ok(SourceLocation::Git(rest.to_string()));
        }
        if url.starts_with("git@") || url.starts_with("git://") || url.ends_with(".git") {
            return Ok(SourceLocation::Git(url.to_string()));
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            anyhow::bail!(
                "Unsupported sources url '{}': use a git url (ending in .git or prefixed with git+)",
                url
            );
        }
        Ok(SourceLocation::Directory(PathBuf::from(url)))
    }
}

/// Which local paths a sources manager may read from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LocalSources {
    /// Any directory the process can read. Used for local `buildq run`.
    #[default]
    Any,
    /// Only paths that resolve to somewhere below this directory.
    Under(PathBuf),
    /// Local paths are refused; only remote git repositories can be built.
    Disabled,
}

impl LocalSources {
    /// Checks that `path` may be read and returns the path to read from.
    /// Restricted paths are canonicalized so symlinks cannot leave the root.
    pub fn check(&self, path: &Path) -> Result<PathBuf> {
        match self {
            LocalSources::Any => Ok(path.to_path_buf()),
            LocalSources::Disabled => anyhow::bail!(
                "Local sources are not accepted by this host: {}",
                path.display()
            ),
            LocalSources::Under(root) => {
                let root = root
                    .canonicalize()
                    .with_context(|| format!("Sources root not found: {}", root.display()))?;
                let canonical = path
                    .canonicalize()
                    .with_context(|| format!("Sources directory not found: {}", path.display()))?;
                if !canonical.starts_with(&root) {
                    anyhow::bail!(
                        "Sources {} are outside the sources root {}",
                        path.display(),
                        root.display()
                    );
                }
                Ok(canonical)
            }
        }
    }
}

/// The filesystem path behind a git url that points at a local repository.
fn local_git_path(url: &str) -> Option<&Path> {
    if let Some(path) = url.strip_prefix("file://") {
        return Some(Path::new(path));
    }
    (url.starts_with('/') || url.starts_with('.')).then(|| Path::new(url))
}

/// Copies local directories and clones git repositories.
#[derive(Debug, Default, Clone)]
pub struct DefaultSourcesManager {
    local: LocalSources,
}

impl DefaultSourcesManager {
    pub fn new(local: LocalSources) -> Self {
        Self { local }
    }

    pub fn local_sources(&self) -> &LocalSources {
        &self.local
    }
}

#[async_trait]
impl SourcesManager for DefaultSourcesManager {
    async fn get_sources(
        &self,
        configuration: &BuilderConfiguration,
        logger: &dyn BuildLogger,
    ) -> Result<()> {
        let dest = configuration.sources_dir.clone();
        let local = self.local.clone();
        match SourceLocation::parse(&configuration.request.sources_url)? {
            SourceLocation::Directory(src) => {
                let _ = logger.write_line(&format!("[buildq] Copying sources from {}", src.display()));
                let copied = tokio::task::spawn_blocking(move || {
                    let src = local.check(&src)?;
                    copy_tree(&src, &dest)
                })
                .await
                .context("Sources copy task panicked")??;
                tracing::debug!(task_id = configuration.task_id, files = copied, "sources copied");
            }
            SourceLocation::Git(url) => {
                let _ = logger.write_line(&format!("[buildq] Cloning {}", url));
                let branch = configuration
                    .request
                    .options
                    .options
                    .get(BRANCH_OPTION)
                    .cloned();
                tokio::task::spawn_blocking(move || {
                    if let Some(path) = local_git_path(&url) {
                        local.check(path)?;
                    }
                    clone_repo(&url, branch.as_deref(), &dest)
                })
                .await
                .context("Git clone task panicked")??;
            }
        }
        Ok(())
    }
}

/// Recursively copies `src` into `dest`, skipping `.git`. Returns the number of files copied.
///
/// Symbolic links are not followed and not copied; each skipped link is logged at debug level.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<usize> {
    if !src.is_dir() {
        anyhow::bail!("Sources directory not found: {}", src.display());
    }
    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create sources directory: {}", dest.display()))?;

    let mut copied = 0;
    let walker = WalkDir::new(src)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");
    for entry in walker {
        let entry = entry.context("Failed to walk sources directory")?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .context("Sources entry outside of sources directory")?;
        let target = dest.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
            copied += 1;
        } else if file_type.is_symlink() {
            tracing::debug!(path = %entry.path().display(), "skipping symbolic link in sources");
        }
    }
    Ok(copied)
}

fn clone_repo(url: &str, branch: Option<&str>, dest: &Path) -> Result<()> {
    let mut builder = git2::build::RepoBuilder::new();
    if let Some(branch) = branch {
        builder.branch(branch);
    }
    builder
        .clone(url, dest)
        .with_context(|| format!("Failed to clone {}", url))?;
    Ok(())
}
