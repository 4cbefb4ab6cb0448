//! Build progress events.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Capacity of the progress channel.
pub const PROGRESS_CAPACITY: usize = 64;

/// Sending half handed to the build engine.
pub type ProgressSender = mpsc::Sender<SolveStatus>;

/// Receiving half consumed by [`drain`].
pub type ProgressReceiver = mpsc::Receiver<SolveStatus>;

/// State of a single build vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VertexState {
    Started,
    Completed,
    Cached,
    Errored,
}

/// One progress event emitted by the engine while solving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolveStatus {
    /// Human-readable vertex name.
    pub vertex: String,
    /// New state of the vertex.
    pub state: VertexState,
}

impl SolveStatus {
    #[must_use]
    pub fn new(vertex: impl Into<String>, state: VertexState) -> Self {
        Self {
            vertex: vertex.into(),
            state,
        }
    }

    #[must_use]
    pub fn started(vertex: impl Into<String>) -> Self {
        Self::new(vertex, VertexState::Started)
    }

    #[must_use]
    pub fn completed(vertex: impl Into<String>) -> Self {
        Self::new(vertex, VertexState::Completed)
    }

    #[must_use]
    pub fn errored(vertex: impl Into<String>) -> Self {
        Self::new(vertex, VertexState::Errored)
    }
}

/// Create the progress channel pair.
#[must_use]
pub fn channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::channel(PROGRESS_CAPACITY)
}

/// Report an event, ignoring a receiver that has gone away.
pub async fn report(progress: &ProgressSender, status: SolveStatus) {
    if progress.send(status).await.is_err() {
        tracing::trace!("progress receiver dropped");
    }
}

/// Consume progress events until every sender is dropped.
///
/// Events are only traced, never shown to the user. Returns the number
/// of events seen.
pub async fn drain(mut rx: ProgressReceiver) -> usize {
    let mut seen = 0;
    while let Some(status) = rx.recv().await {
        seen += 1;
        match status.state {
            VertexState::Errored => {
                tracing::debug!(vertex = %status.vertex, "build step failed");
            }
            state => tracing::trace!(vertex = %status.vertex, ?state, "build progress"),
        }
    }
    seen
}
