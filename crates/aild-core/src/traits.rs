//! Core traits for the build engine and the local console.

use std::{
    collections::HashMap,
    fmt, io,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::progress::ProgressSender;

/// Opaque handle to a solved filesystem snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference(String);

impl Reference {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Copy of a local mount into the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOp {
    /// Name of the local mount to copy from.
    pub mount: String,
    /// Path inside the mount.
    pub source: String,
    /// Destination path inside the snapshot.
    pub dest: String,
    /// Optional display name for progress reporting.
    pub name: Option<String>,
}

impl CopyOp {
    /// Name shown in progress events.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("copy {}:{} {}", self.mount, self.source, self.dest))
    }
}

/// Declarative build description: a base image plus local copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    pub image: String,
    pub copies: Vec<CopyOp>,
}

impl Definition {
    /// Start from a base image.
    #[must_use]
    pub fn image(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            copies: Vec::new(),
        }
    }

    /// Copy `source` from local mount `mount` to `dest`.
    #[must_use]
    pub fn copy_local(
        mut self,
        mount: impl Into<String>,
        source: impl Into<String>,
        dest: impl Into<String>,
    ) -> Self {
        self.copies.push(CopyOp {
            mount: mount.into(),
            source: source.into(),
            dest: dest.into(),
            name: None,
        });
        self
    }

    /// Name the most recently added copy.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        if let Some(last) = self.copies.last_mut() {
            last.name = Some(name.into());
        }
        self
    }
}

/// Options for a build submission.
#[derive(Debug, Clone, Default)]
pub struct SolveOptions {
    /// Local directories exposed to the engine, by name.
    pub local_mounts: HashMap<String, PathBuf>,
}

impl SolveOptions {
    /// Expose a local directory under `name`.
    #[must_use]
    pub fn with_local(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.local_mounts.insert(name.into(), path.into());
        self
    }
}

/// Result of solving a definition.
#[derive(Debug, Clone, Default)]
pub struct SolveResult {
    pub refs: Vec<Reference>,
}

impl SolveResult {
    #[must_use]
    pub fn single(reference: Reference) -> Self {
        Self {
            refs: vec![reference],
        }
    }

    /// The only reference of the result.
    ///
    /// # Errors
    /// Returns error unless exactly one reference is present.
    pub fn single_ref(self) -> Result<Reference, EngineError> {
        let count = self.refs.len();
        let mut refs = self.refs.into_iter();
        match (refs.next(), count) {
            (Some(reference), 1) => Ok(reference),
            _ => Err(EngineError::Solve(format!(
                "expected a single reference, got {count}"
            ))),
        }
    }
}

/// A snapshot mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub dest: String,
    pub reference: Reference,
}

/// Request for a new container.
#[derive(Debug, Clone, Default)]
pub struct NewContainerRequest {
    pub mounts: Vec<Mount>,
}

impl NewContainerRequest {
    /// Container whose root filesystem is `reference`.
    #[must_use]
    pub fn root(reference: Reference) -> Self {
        Self {
            mounts: vec![Mount {
                dest: "/".to_string(),
                reference,
            }],
        }
    }

    /// Reference mounted at `/`, if any.
    #[must_use]
    pub fn root_reference(&self) -> Option<&Reference> {
        self.mounts
            .iter()
            .find(|m| m.dest == "/")
            .map(|m| &m.reference)
    }
}

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl TerminalSize {
    #[must_use]
    pub const fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

/// Shared buffer collecting a process's standard output.
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer(Arc<Mutex<Vec<u8>>>);

impl CaptureBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes.
    pub fn extend(&self, data: &[u8]) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
    }

    /// Take everything collected so far.
    #[must_use]
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Standard stream wiring for a container process.
#[derive(Debug, Clone, Default)]
pub enum Stdio {
    /// No input, output discarded.
    #[default]
    Null,
    /// Attached to the local terminal (stdin, stdout and stderr).
    Terminal,
    /// Stdout collected into the buffer, stderr discarded.
    Capture(CaptureBuffer),
}

/// Request to start a process inside a container.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: String,
    pub tty: bool,
    pub stdio: Stdio,
}

impl StartRequest {
    /// Create a request for the given argument vector, run from `/`.
    #[must_use]
    pub fn new<I>(args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            cwd: "/".to_string(),
            ..Self::default()
        }
    }

    /// Set an environment variable, replacing an earlier value for `key`.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.env.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.env.push((key, value));
        }
        self
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = cwd.into();
        self
    }

    #[must_use]
    pub const fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    #[must_use]
    pub fn stdio(mut self, stdio: Stdio) -> Self {
        self.stdio = stdio;
        self
    }

    /// Render `env` as `KEY=VALUE` strings.
    #[must_use]
    pub fn env_pairs(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

/// Build engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to connect to {address}: {message}")]
    Connect { address: String, message: String },
    #[error("solve failed: {0}")]
    Solve(String),
    #[error("container error: {0}")]
    Container(String),
    #[error("failed to start process: {0}")]
    Start(String),
    #[error("process exited with status {0}")]
    ExitCode(i32),
    #[error("process terminated by signal")]
    Killed,
    #[error("operation cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Handle exposed to the build closure while a build is open.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Resolve a build description into snapshot references.
    async fn solve(&self, definition: &Definition) -> Result<SolveResult, EngineError>;

    /// Create a container backed by the mounted references.
    async fn new_container(
        &self,
        request: NewContainerRequest,
    ) -> Result<Box<dyn Container>, EngineError>;
}

/// Ephemeral execution environment.
#[async_trait]
pub trait Container: Send + Sync {
    /// Start a process. Cancelling `cancel` terminates it.
    async fn start(
        &self,
        request: StartRequest,
        cancel: CancellationToken,
    ) -> Result<Box<dyn ContainerProcess>, EngineError>;

    /// Tear the container down. Never reused afterwards.
    async fn release(&self) -> Result<(), EngineError>;
}

/// A running process inside a container.
#[async_trait]
pub trait ContainerProcess: Send + Sync {
    /// Wait for the process to exit. Non-zero exit is an error.
    async fn wait(&self) -> Result<(), EngineError>;

    /// Propagate a terminal size change.
    async fn resize(&self, size: TerminalSize) -> Result<(), EngineError>;
}

/// Build engine capability.
#[async_trait]
pub trait BuildEngine: Send + Sync + Sized {
    /// Remediation shown when the engine cannot be reached.
    const START_HINT: &'static str;

    /// Connect to the engine at `address`.
    async fn connect(address: &str, cancel: &CancellationToken) -> Result<Self, EngineError>;

    /// Open a build, stream progress into `progress` and run `build`
    /// against the gateway. `progress` is dropped once the build returns.
    async fn build<T, E, F>(
        &self,
        options: SolveOptions,
        progress: ProgressSender,
        cancel: CancellationToken,
        build: F,
    ) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<EngineError> + Send + 'static,
        F: for<'g> FnOnce(&'g dyn Gateway) -> BoxFuture<'g, Result<T, E>> + Send + 'static;
}

/// Local terminal capability.
pub trait Console: Send + Sync {
    /// Whether a terminal is attached.
    fn is_terminal(&self) -> bool;

    /// Current terminal size.
    ///
    /// # Errors
    /// Returns error if the size cannot be queried.
    fn size(&self) -> io::Result<TerminalSize>;

    /// Switch the terminal into raw mode.
    ///
    /// # Errors
    /// Returns error if the mode cannot be changed.
    fn enable_raw_mode(&self) -> io::Result<()>;

    /// Restore the mode captured by `enable_raw_mode`.
    ///
    /// # Errors
    /// Returns error if the mode cannot be restored.
    fn restore_mode(&self) -> io::Result<()>;

    /// Blocking yes/no question. `false` if input cannot be read.
    fn ask_yes_no(&self, question: &str) -> bool;
}
