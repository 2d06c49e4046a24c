use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Filesystem and command-execution surface used by built-in tools.
/// Path confinement is the implementation's contract; the kernel only
/// consumes this interface.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Resolve a path against the sandbox root, rejecting escapes.
    fn resolve_path(&self, path: &str) -> Result<PathBuf, SandboxError>;

    async fn read(&self, path: &str) -> Result<Vec<u8>, SandboxError>;
    async fn write(&self, path: &str, data: &[u8]) -> Result<(), SandboxError>;
    async fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>, SandboxError>;
    async fn grep(&self, pattern: &str, path: &str) -> Result<Vec<GrepMatch>, SandboxError>;
    async fn exec(&self, command: &str, opts: ExecOptions) -> Result<ExecResult, SandboxError>;

    /// Observe the given paths; the callback fires on external change.
    /// Watching stops when the returned handle is dropped.
    fn watch_files(
        &self,
        paths: &[PathBuf],
        callback: WatchCallback,
    ) -> Result<WatchHandle, SandboxError>;

    fn dispose(&self);
}

pub type WatchCallback = Arc<dyn Fn(&Path) + Send + Sync>;

/// Dropping the handle cancels the watch.
pub struct WatchHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

#[derive(Clone, Debug)]
pub struct GrepMatch {
    pub path: PathBuf,
    pub line_number: u64,
    pub line: String,
}

#[derive(Clone, Debug, Default)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub env: Vec<(String, String)>,
}

#[derive(Clone, Debug)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("path escapes sandbox boundary: {0}")]
    BoundaryViolation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("exec failed: {0}")]
    Exec(String),
    #[error("watch unsupported: {0}")]
    WatchUnsupported(String),
}
