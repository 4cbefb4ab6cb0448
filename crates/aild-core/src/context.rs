//! Per-invocation session context.

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use crate::Config;

/// The top-level unit of work for one invocation.
///
/// Owned exclusively by the orchestrator. Every suspendable operation
/// receives the session token (or a child of it) explicitly.
#[derive(Debug, Clone)]
pub struct BuildSession {
    /// Local directory mirrored into the environment and patched afterwards.
    pub working_dir: PathBuf,

    /// Agent identifier passed to the interactive process.
    pub agent: String,

    /// Root cancellation signal for the whole session.
    pub cancel: CancellationToken,

    /// Resolved configuration.
    pub config: Config,
}

impl BuildSession {
    /// Create a session with a fresh cancellation token.
    #[must_use]
    pub fn new(working_dir: PathBuf, agent: impl Into<String>, config: Config) -> Self {
        Self::with_cancel(working_dir, agent, config, CancellationToken::new())
    }

    /// Create a session bound to an existing cancellation token.
    #[must_use]
    pub fn with_cancel(
        working_dir: PathBuf,
        agent: impl Into<String>,
        config: Config,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            working_dir,
            agent: agent.into(),
            cancel,
            config,
        }
    }

    /// Token for a scoped operation that may be cancelled on its own.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }
}

/// In-memory tar snapshot of a directory subtree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveBlob(Vec<u8>);

impl ArchiveBlob {
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for ArchiveBlob {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}
