//! Capture a directory of the remote environment as a tar stream.

use aild_core::{
    ArchiveBlob, CaptureBuffer, Container, EngineError, StartRequest, Stdio,
    config::CONTAINER_PATH,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Change extraction error.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("path cannot be quoted for the shell: {0}")]
    InvalidPath(String),
    #[error("failed to start extraction: {0}")]
    Start(#[source] EngineError),
    #[error("extraction failed: {0}")]
    Failed(#[source] EngineError),
}

/// Shell command that writes `path` as a tar stream to stdout.
///
/// # Errors
/// Returns error if `path` contains a NUL byte.
pub fn capture_command(path: &str) -> Result<String, ExtractError> {
    let quoted =
        shlex::try_quote(path).map_err(|_| ExtractError::InvalidPath(path.to_string()))?;
    Ok(format!("cd {quoted} && tar cf - ."))
}

/// Archive `path` inside `container`.
///
/// All of the process's stdout is the archive; a non-zero exit fails the
/// whole extraction.
///
/// # Errors
/// Returns error if the capture process cannot start or exits unsuccessfully.
pub async fn extract_changes(
    container: &dyn Container,
    path: &str,
    cancel: &CancellationToken,
) -> Result<ArchiveBlob, ExtractError> {
    let buffer = CaptureBuffer::new();
    let request = StartRequest::new(["/bin/sh".to_string(), "-c".to_string(), capture_command(path)?])
        .env("PATH", CONTAINER_PATH)
        .stdio(Stdio::Capture(buffer.clone()));

    let process = container
        .start(request, cancel.child_token())
        .await
        .map_err(ExtractError::Start)?;
    process.wait().await.map_err(ExtractError::Failed)?;

    let blob = ArchiveBlob::new(buffer.take());
    tracing::debug!(%path, bytes = blob.len(), "changes extracted");
    Ok(blob)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use aild_core::{ContainerProcess, TerminalSize};
    use async_trait::async_trait;

    use super::*;

    /// Container whose processes write `output` and exit with `code`.
    struct ScriptedContainer {
        output: Vec<u8>,
        code: i32,
        requests: Mutex<Vec<StartRequest>>,
    }

    struct Exited(i32);

    #[async_trait]
    impl ContainerProcess for Exited {
        async fn wait(&self) -> Result<(), EngineError> {
            match self.0 {
                0 => Ok(()),
                code => Err(EngineError::ExitCode(code)),
            }
        }

        async fn resize(&self, _size: TerminalSize) -> Result<(), EngineError> {
            Ok(())
        }
    }

    #[async_trait]
    impl Container for ScriptedContainer {
        async fn start(
            &self,
            request: StartRequest,
            _cancel: CancellationToken,
        ) -> Result<Box<dyn ContainerProcess>, EngineError> {
            if let Stdio::Capture(buffer) = &request.stdio {
                buffer.extend(&self.output);
            }
            self.requests.lock().unwrap().push(request);
            Ok(Box::new(Exited(self.code)))
        }

        async fn release(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn container(output: &[u8], code: i32) -> ScriptedContainer {
        ScriptedContainer {
            output: output.to_vec(),
            code,
            requests: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn test_capture_command_quotes_path() {
        let cmd = capture_command("/my dir/x").unwrap();
        let words = shlex::split(&cmd).unwrap();
        assert_eq!(words, ["cd", "/my dir/x", "&&", "tar", "cf", "-", "."]);
        assert!(capture_command("/bad\0path").is_err());
    }

    #[tokio::test]
    async fn test_extract_collects_stdout() {
        let c = container(b"tarbytes", 0);
        let blob = extract_changes(&c, "/workspace", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(blob.as_bytes(), b"tarbytes");

        let requests = c.requests.lock().unwrap();
        assert_eq!(requests[0].args[..2], ["/bin/sh", "-c"]);
        assert_eq!(requests[0].cwd, "/");
        assert!(!requests[0].tty);
        assert!(requests[0].env_pairs().contains(&format!("PATH={CONTAINER_PATH}")));
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails_extraction() {
        let c = container(b"partial", 2);
        let err = extract_changes(&c, "/workspace", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Failed(EngineError::ExitCode(2))));
    }
}
