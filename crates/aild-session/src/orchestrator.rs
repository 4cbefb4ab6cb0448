//! Session lifecycle: build, keep-alive, relay, confirm, extract, apply.

use std::{io, path::PathBuf, sync::Arc};

use aild_core::{
    ArchiveBlob, BuildEngine, BuildSession, Config, Console, Container, Definition, EngineError,
    Gateway, NewContainerRequest, SolveOptions, StartRequest,
    config::{CONTAINER_PATH, CONTAINER_WORKDIR, LOCAL_CONTEXT_MOUNT},
    progress,
};
use aild_pty::{ShellError, interactive_request, run_interactive_shell};
use futures::{FutureExt, future::BoxFuture};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{
    apply::{ApplyError, ApplyReport, apply_archive},
    extract::{ExtractError, extract_changes},
};

/// Progress name of the step that copies the working directory.
pub const COPY_CONTEXT_NAME: &str = "copying local context to container";

/// Question asked once the interactive process has exited.
pub const APPLY_QUESTION: &str = "Do you want to apply the changes made in the container locally?";

/// Session error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{source}\n{hint}")]
    Connection {
        address: String,
        #[source]
        source: EngineError,
        hint: &'static str,
    },
    #[error("failed to build environment: {0}")]
    Build(#[source] EngineError),
    #[error("container error: {0}")]
    Container(#[source] EngineError),
    #[error(transparent)]
    Shell(#[from] ShellError),
    #[error("failed to extract changes: {0}")]
    Extraction(#[from] ExtractError),
    #[error("failed to apply changes: {0}")]
    Apply(#[from] ApplyError),
    #[error("invalid working directory {}: {source}", path.display())]
    WorkingDir { path: PathBuf, source: io::Error },
    #[error("interrupted")]
    Interrupted,
}

impl From<EngineError> for SessionError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Cancelled => Self::Interrupted,
            other => Self::Build(other),
        }
    }
}

/// How a session ended when nothing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The user confirmed and the archive was applied.
    Applied(ApplyReport),
    /// The user declined; the local directory is untouched.
    Discarded,
}

/// Run a whole session against engine `E`.
///
/// # Errors
/// Returns error if any step fails; see [`SessionError`].
pub async fn run_session<E: BuildEngine>(
    session: &BuildSession,
    console: Arc<dyn Console>,
) -> Result<SessionOutcome, SessionError> {
    if session.cancel.is_cancelled() {
        return Err(SessionError::Interrupted);
    }

    let address = session.config.engine_host.as_str();
    let engine = E::connect(address, &session.cancel)
        .await
        .map_err(|source| match source {
            EngineError::Cancelled => SessionError::Interrupted,
            source => SessionError::Connection {
                address: address.to_string(),
                source,
                hint: E::START_HINT,
            },
        })?;

    run_with_engine(&engine, session, console).await
}

/// Run a session on an already connected engine.
///
/// # Errors
/// Returns error if any step fails; see [`SessionError`].
pub async fn run_with_engine<E: BuildEngine>(
    engine: &E,
    session: &BuildSession,
    console: Arc<dyn Console>,
) -> Result<SessionOutcome, SessionError> {
    let working_dir = tokio::fs::canonicalize(&session.working_dir)
        .await
        .map_err(|source| SessionError::WorkingDir {
            path: session.working_dir.clone(),
            source,
        })?;

    let options = SolveOptions::default().with_local(LOCAL_CONTEXT_MOUNT, &working_dir);
    let plan = SessionPlan {
        config: session.config.clone(),
        agent: session.agent.clone(),
        console,
        cancel: session.cancel.clone(),
    };

    let (progress_tx, progress_rx) = progress::channel();
    let build = engine.build(
        options,
        progress_tx,
        session.child_token(),
        move |gateway| plan.run(gateway).boxed(),
    );
    let drain = async move { Ok::<_, SessionError>(progress::drain(progress_rx).await) };

    let result = tokio::try_join!(drain, build);
    let (events, blob) = match result {
        Err(_) if session.cancel.is_cancelled() => return Err(SessionError::Interrupted),
        other => other?,
    };
    tracing::debug!(events, "build finished");

    let Some(blob) = blob else {
        return Ok(SessionOutcome::Discarded);
    };
    let report = tokio::task::spawn_blocking(move || apply_archive(blob.as_bytes(), &working_dir))
        .await
        .map_err(|e| ApplyError::Archive(io::Error::other(e)))??;
    Ok(SessionOutcome::Applied(report))
}

/// Run `body` against `container` and release it afterwards.
///
/// The container is released whether `body` succeeds or fails. A release
/// failure is logged and never replaces the body's result.
pub async fn with_container<T, E, F>(container: Box<dyn Container>, body: F) -> Result<T, E>
where
    F: for<'c> FnOnce(&'c dyn Container) -> BoxFuture<'c, Result<T, E>>,
{
    let result = body(container.as_ref()).await;
    if let Err(err) = container.release().await {
        tracing::warn!(%err, "failed to release container");
    }
    result
}

/// Request for the process that keeps the container alive.
#[must_use]
pub fn keep_alive_request() -> StartRequest {
    StartRequest::new(["/bin/sh", "-c", "sleep infinity"]).env("PATH", CONTAINER_PATH)
}

/// Everything the build closure owns.
struct SessionPlan {
    config: Config,
    agent: String,
    console: Arc<dyn Console>,
    cancel: CancellationToken,
}

impl SessionPlan {
    async fn run(self, gateway: &dyn Gateway) -> Result<Option<ArchiveBlob>, SessionError> {
        let definition = Definition::image(self.config.image.as_str())
            .copy_local(LOCAL_CONTEXT_MOUNT, "/", CONTAINER_WORKDIR)
            .named(COPY_CONTEXT_NAME);

        let reference = gateway
            .solve(&definition)
            .await?
            .single_ref()?;
        tracing::debug!(%reference, "environment built");

        let container = gateway
            .new_container(NewContainerRequest::root(reference))
            .await
            .map_err(container_error)?;

        with_container(container, move |container| self.drive(container).boxed()).await
    }

    async fn drive(self, container: &dyn Container) -> Result<Option<ArchiveBlob>, SessionError> {
        let keep_alive_cancel = self.cancel.child_token();
        let keep_alive = container
            .start(keep_alive_request(), keep_alive_cancel.clone())
            .await
            .map_err(container_error)?;
        let keep_alive = KeepAlive {
            task: tokio::spawn(async move {
                match keep_alive.wait().await {
                    Ok(()) => tracing::debug!("keep-alive process exited"),
                    Err(err) => tracing::debug!(%err, "keep-alive process ended"),
                }
            }),
            _stop: keep_alive_cancel.clone().drop_guard(),
            cancel: keep_alive_cancel,
        };

        let request = interactive_request(&self.config, &self.agent);
        run_interactive_shell(Arc::clone(&self.console), container, request, &self.cancel).await?;

        if !self.confirm().await? {
            keep_alive.stop().await;
            return Ok(None);
        }

        let blob = extract_changes(container, CONTAINER_WORKDIR, &self.cancel).await?;
        keep_alive.stop().await;
        Ok(Some(blob))
    }

    async fn confirm(&self) -> Result<bool, SessionError> {
        let console = Arc::clone(&self.console);
        let answer = tokio::task::spawn_blocking(move || console.ask_yes_no(APPLY_QUESTION));
        tokio::select! {
            answer = answer => Ok(answer.unwrap_or(false)),
            () = self.cancel.cancelled() => Err(SessionError::Interrupted),
        }
    }
}

/// The keep-alive task; cancelled when dropped.
struct KeepAlive {
    task: JoinHandle<()>,
    cancel: CancellationToken,
    _stop: DropGuard,
}

impl KeepAlive {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            tracing::debug!(%err, "keep-alive task ended abnormally");
        }
    }
}

fn container_error(err: EngineError) -> SessionError {
    match err {
        EngineError::Cancelled => SessionError::Interrupted,
        other => SessionError::Container(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_alive_request() {
        let req = keep_alive_request();
        assert_eq!(req.args, ["/bin/sh", "-c", "sleep infinity"]);
        assert!(!req.tty);
        assert_eq!(req.cwd, "/");
    }

    #[test]
    fn test_engine_error_conversion() {
        assert!(matches!(
            SessionError::from(EngineError::Cancelled),
            SessionError::Interrupted
        ));
        assert!(matches!(
            SessionError::from(EngineError::Solve("bad".into())),
            SessionError::Build(_)
        ));
        assert!(matches!(
            container_error(EngineError::Container("gone".into())),
            SessionError::Container(_)
        ));
    }

    #[test]
    fn test_connection_error_includes_hint() {
        let err = SessionError::Connection {
            address: "unix:///var/run/docker.sock".into(),
            source: EngineError::Connect {
                address: "unix:///var/run/docker.sock".into(),
                message: "no such file".into(),
            },
            hint: "Start the daemon.",
        };
        let text = err.to_string();
        assert_eq!(
            text,
            "failed to connect to unix:///var/run/docker.sock: no such file\nStart the daemon."
        );
        assert_eq!(text.matches("docker.sock").count(), 1);
    }
}
