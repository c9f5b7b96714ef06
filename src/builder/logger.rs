use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

/// Sink for the output of one build.
///
/// Lines are observable through `lines()` while the build is still running.
pub trait BuildLogger: Send + Sync {
    fn write_line(&self, line: &str) -> io::Result<()>;

    /// Snapshot of everything written so far.
    fn lines(&self) -> Vec<String>;

    fn content_type(&self) -> &str {
        "text/plain"
    }
}

/// Keeps the log in memory. Used for tests and very short builds.
#[derive(Debug, Default)]
pub struct InMemoryBuildLogger {
    lines: Mutex<Vec<String>>,
}

impl InMemoryBuildLogger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BuildLogger for InMemoryBuildLogger {
    fn write_line(&self, line: &str) -> io::Result<()> {
        self.lines
            .lock()
            .map_err(|_| io::Error::other("build log lock poisoned"))?
            .push(line.to_string());
        Ok(())
    }

    fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

/// Appends the log to a file owned by the task, flushing every line.
pub struct FileBuildLogger {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileBuildLogger {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create log directory: {}", parent.display())
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open build log: {}", path.display()))?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BuildLogger for FileBuildLogger {
    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| io::Error::other("build log lock poisoned"))?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    fn lines(&self) -> Vec<String> {
        // Holding the writer lock keeps us from reading half a line.
        let _guard = self.writer.lock();
        std::fs::read_to_string(&self.path)
            .map(|content| content.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}
