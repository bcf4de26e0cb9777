//! Where rendered configs go.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{RoutingError, RoutingResult};
use crate::render::ConfigDocument;

/// Applies a validated document. Failure must leave the previous config
/// in effect.
#[async_trait]
pub trait ConfigSink: Send + Sync + 'static {
    async fn apply(&self, doc: &ConfigDocument) -> RoutingResult<()>;
}

/// Writes the config file atomically, then runs the reload command.
///
/// If the reload fails or times out the previous file is put back.
pub struct FileSink {
    path: PathBuf,
    reload_command: Vec<String>,
    reload_timeout: Duration,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reload_command: Vec::new(),
            reload_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_reload_command(mut self, argv: Vec<String>) -> Self {
        self.reload_command = argv;
        self
    }

    pub fn with_reload_timeout(mut self, timeout: Duration) -> Self {
        self.reload_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn reload(&self) -> RoutingResult<()> {
        let Some((program, args)) = self.reload_command.split_first() else {
            return Ok(());
        };
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RoutingError::Apply(format!("could not spawn {program}: {e}")))?;

        match tokio::time::timeout(self.reload_timeout, child.wait_with_output()).await {
            Err(_) => Err(RoutingError::ApplyTimeout(self.reload_timeout)),
            Ok(Err(e)) => Err(RoutingError::Apply(e.to_string())),
            Ok(Ok(out)) if out.status.success() => Ok(()),
            Ok(Ok(out)) => Err(RoutingError::Apply(format!(
                "reload exited with {:?}: {}",
                out.status.code(),
                String::from_utf8_lossy(&out.stderr).trim()
            ))),
        }
    }
}

/// Replace `path` with `contents` via a temp file in the same directory.
fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl ConfigSink for FileSink {
    async fn apply(&self, doc: &ConfigDocument) -> RoutingResult<()> {
        let previous = match std::fs::read(&self.path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        write_atomic(&self.path, doc.text.as_bytes())?;
        if let Err(e) = self.reload().await {
            warn!(path = %self.path.display(), error = %e, "reload failed, restoring previous config");
            match previous {
                Some(bytes) => write_atomic(&self.path, &bytes)?,
                None => std::fs::remove_file(&self.path)?,
            }
            return Err(e);
        }
        info!(path = %self.path.display(), digest = %doc.digest, "proxy config applied");
        Ok(())
    }
}

/// Keeps applied documents in memory.
#[derive(Default)]
pub struct MemorySink {
    applied: Mutex<Vec<ConfigDocument>>,
    fail_next: Mutex<Option<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next apply fail with `reason`.
    pub fn fail_next(&self, reason: &str) {
        if let Ok(mut slot) = self.fail_next.lock() {
            *slot = Some(reason.to_string());
        }
    }

    pub fn applied(&self) -> Vec<ConfigDocument> {
        self.applied.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn current(&self) -> Option<ConfigDocument> {
        self.applied().pop()
    }
}

#[async_trait]
impl ConfigSink for MemorySink {
    async fn apply(&self, doc: &ConfigDocument) -> RoutingResult<()> {
        let failure = self.fail_next.lock().ok().and_then(|mut s| s.take());
        if let Some(reason) = failure {
            return Err(RoutingError::Apply(reason));
        }
        if let Ok(mut applied) = self.applied.lock() {
            applied.push(doc.clone());
        }
        Ok(())
    }
}
