//! Process handles for docker-backed containers.

use std::{process::Stdio as ProcessStdio, sync::Arc};

use aild_core::{CaptureBuffer, ContainerProcess, EngineError, Stdio, TerminalSize};
use aild_pty::PtyProcess;
use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use tokio::{io::AsyncReadExt, sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::command::{CommandParts, DockerCli};

/// Size a PTY starts with before the first resize arrives.
const INITIAL_PTY_SIZE: TerminalSize = TerminalSize::new(24, 80);

fn exit_result(code: Option<i32>) -> Result<(), EngineError> {
    match code {
        Some(0) => Ok(()),
        Some(code) => Err(EngineError::ExitCode(code)),
        None => Err(EngineError::Killed),
    }
}

/// The container's main process, started with `docker run -d`.
///
/// Cancelling its token kills the whole container.
pub struct DetachedProcess {
    cli: DockerCli,
    name: String,
    cancel: CancellationToken,
}

impl DetachedProcess {
    /// Start `parts` (a `docker run -d` command) and watch `cancel`.
    ///
    /// # Errors
    /// Returns error if the container cannot be started.
    pub async fn start(
        cli: DockerCli,
        name: String,
        parts: &CommandParts,
        cancel: CancellationToken,
    ) -> Result<Self, EngineError> {
        let id = parts
            .output(&cancel)
            .await
            .map_err(|e| e.into_engine(EngineError::Start))?;
        tracing::debug!(%name, %id, "container main process started");

        let killer = cli.clone();
        let target = name.clone();
        let watch = cancel.clone();
        tokio::spawn(async move {
            watch.cancelled().await;
            // The session may already be cancelled; the kill must still run.
            if let Err(err) = killer
                .command(["kill", target.as_str()])
                .output(&CancellationToken::new())
                .await
            {
                tracing::debug!(%err, name = %target, "container kill failed");
            }
        });

        Ok(Self { cli, name, cancel })
    }
}

#[async_trait]
impl ContainerProcess for DetachedProcess {
    async fn wait(&self) -> Result<(), EngineError> {
        let status = self
            .cli
            .command(["wait", self.name.as_str()])
            .output(&CancellationToken::new())
            .await
            .map_err(|e| e.into_engine(EngineError::Container))?;

        let code = status
            .lines()
            .last()
            .and_then(|line| line.trim().parse::<i32>().ok());
        match exit_result(code) {
            Err(_) if self.cancel.is_cancelled() => Err(EngineError::Cancelled),
            result => result,
        }
    }

    async fn resize(&self, _size: TerminalSize) -> Result<(), EngineError> {
        Ok(())
    }
}

/// A `docker exec` process without a terminal, run as its own process group.
pub struct PipedProcess {
    exit: Mutex<Option<JoinHandle<Result<(), EngineError>>>>,
}

impl PipedProcess {
    /// Spawn `parts` wired according to `stdio`.
    ///
    /// # Errors
    /// Returns error if the process cannot be spawned.
    pub fn spawn(
        parts: &CommandParts,
        stdio: Stdio,
        cancel: CancellationToken,
    ) -> Result<Self, EngineError> {
        let mut cmd = parts.to_tokio();
        let capture = match stdio {
            Stdio::Null => {
                cmd.stdin(ProcessStdio::null())
                    .stdout(ProcessStdio::null())
                    .stderr(ProcessStdio::piped());
                None
            }
            Stdio::Terminal => {
                cmd.stdin(ProcessStdio::inherit())
                    .stdout(ProcessStdio::inherit())
                    .stderr(ProcessStdio::inherit());
                None
            }
            Stdio::Capture(buffer) => {
                cmd.stdin(ProcessStdio::null())
                    .stdout(ProcessStdio::piped())
                    .stderr(ProcessStdio::piped());
                Some(buffer)
            }
        };

        tracing::debug!(command = %parts.display(), "spawning docker exec");
        let child = cmd
            .group_spawn()
            .map_err(|e| EngineError::Start(e.to_string()))?;

        Ok(Self {
            exit: Mutex::new(Some(tokio::spawn(drive(child, capture, cancel)))),
        })
    }
}

async fn drive(
    mut child: AsyncGroupChild,
    capture: Option<CaptureBuffer>,
    cancel: CancellationToken,
) -> Result<(), EngineError> {
    let stdout = child.inner().stdout.take();
    let stderr = child.inner().stderr.take();

    let copier = tokio::spawn(async move {
        let (Some(mut stdout), Some(buffer)) = (stdout, capture) else {
            return Ok(());
        };
        let mut chunk = [0u8; 8192];
        loop {
            let n = stdout.read(&mut chunk).await?;
            if n == 0 {
                return Ok::<_, std::io::Error>(());
            }
            buffer.extend(&chunk[..n]);
        }
    });
    let diagnostics = tokio::spawn(async move {
        let mut text = String::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_string(&mut text).await;
        }
        text
    });

    let status = tokio::select! {
        status = child.wait() => status?,
        () = cancel.cancelled() => {
            if let Err(err) = child.start_kill() {
                tracing::debug!(%err, "failed to kill process group");
            }
            let _ = child.wait().await;
            return Err(EngineError::Cancelled);
        }
    };

    match copier.await {
        Ok(result) => result?,
        Err(err) => return Err(EngineError::Io(std::io::Error::other(err))),
    }
    if let Ok(text) = diagnostics.await {
        if !status.success() && !text.trim().is_empty() {
            tracing::debug!(stderr = %text.trim(), "process reported errors");
        }
    }

    exit_result(status.code())
}

#[async_trait]
impl ContainerProcess for PipedProcess {
    async fn wait(&self) -> Result<(), EngineError> {
        let handle = self
            .exit
            .lock()
            .await
            .take()
            .ok_or_else(|| EngineError::Container("process was already waited on".into()))?;
        handle
            .await
            .map_err(|e| EngineError::Io(std::io::Error::other(e)))?
    }

    async fn resize(&self, _size: TerminalSize) -> Result<(), EngineError> {
        Ok(())
    }
}

/// A `docker exec -it` process attached to the local terminal.
pub struct TerminalProcess {
    pty: Arc<PtyProcess>,
    cancel: CancellationToken,
}

impl TerminalProcess {
    /// Spawn `parts` on a PTY wired to the local terminal.
    ///
    /// # Errors
    /// Returns error if the PTY cannot be opened or the command fails to spawn.
    pub fn spawn(parts: &CommandParts, cancel: CancellationToken) -> Result<Self, EngineError> {
        tracing::debug!(command = %parts.display(), "spawning interactive docker exec");
        let pty = Arc::new(
            PtyProcess::spawn(parts.to_pty(), INITIAL_PTY_SIZE)
                .map_err(|e| EngineError::Start(e.to_string()))?,
        );

        let watched = Arc::clone(&pty);
        let watch = cancel.clone();
        tokio::spawn(async move {
            watch.cancelled().await;
            if let Err(err) = watched.kill() {
                tracing::debug!(%err, "failed to kill interactive process");
            }
        });

        Ok(Self { pty, cancel })
    }
}

#[async_trait]
impl ContainerProcess for TerminalProcess {
    async fn wait(&self) -> Result<(), EngineError> {
        let status = self
            .pty
            .wait()
            .await
            .map_err(|e| EngineError::Container(e.to_string()))?;
        if status.success() {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Err(EngineError::ExitCode(
            i32::try_from(status.exit_code()).unwrap_or(i32::MAX),
        ))
    }

    async fn resize(&self, size: TerminalSize) -> Result<(), EngineError> {
        self.pty
            .resize(size)
            .map_err(|e| EngineError::Container(e.to_string()))
    }
}
