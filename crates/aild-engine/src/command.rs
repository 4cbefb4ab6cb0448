//! Docker command building utilities.

use std::{
    ffi::OsStr,
    fmt, io,
    path::{Path, PathBuf},
    process::Stdio,
};

use aild_core::{EngineError, StartRequest};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Command execution error.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("docker executable not found on PATH")]
    NotFound,
    #[error("`{command}` failed: {stderr}")]
    Failed { command: String, stderr: String },
    #[error("`{command}` was cancelled")]
    Cancelled { command: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CommandError {
    /// Convert into an engine error, wrapping failures with `wrap`.
    pub fn into_engine(self, wrap: fn(String) -> EngineError) -> EngineError {
        match self {
            Self::Cancelled { .. } => EngineError::Cancelled,
            other => wrap(other.to_string()),
        }
    }
}

/// Parsed command parts (program + args).
///
/// `env` is set on the spawned process only. It never appears in `args`,
/// in [`CommandParts::display`] or in the `Debug` output.
#[derive(Clone)]
pub struct CommandParts {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl fmt::Debug for CommandParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandParts")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .finish()
    }
}

impl CommandParts {
    /// Create new command parts.
    #[must_use]
    pub const fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self {
            program,
            args,
            env: Vec::new(),
        }
    }

    /// Add variables to the spawned process's environment.
    #[must_use]
    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    /// Shell-quoted rendering for logs.
    #[must_use]
    pub fn display(&self) -> String {
        let program = self.program.to_string_lossy();
        let words = std::iter::once(program.as_ref()).chain(self.args.iter().map(String::as_str));
        shlex::try_join(words).unwrap_or_else(|_| format!("{program} {}", self.args.join(" ")))
    }

    /// Build a Tokio command.
    #[must_use]
    pub fn to_tokio(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd
    }

    /// Build a command for spawning on a PTY.
    #[must_use]
    pub fn to_pty(&self) -> portable_pty::CommandBuilder {
        let mut cmd = portable_pty::CommandBuilder::new(self.program.as_os_str());
        cmd.args(self.args.iter().map(OsStr::new));
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }
        cmd
    }

    /// Run to completion and return trimmed stdout.
    ///
    /// The child is killed if `cancel` fires first.
    ///
    /// # Errors
    /// Returns error if the command cannot run, exits non-zero, or is cancelled.
    pub async fn output(&self, cancel: &CancellationToken) -> Result<String, CommandError> {
        let mut cmd = self.to_tokio();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let command = self.display();
        tracing::debug!(%command, "running docker command");

        let child = cmd.spawn()?;
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            () = cancel.cancelled() => return Err(CommandError::Cancelled { command }),
        };

        if !output.status.success() {
            return Err(CommandError::Failed {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// The docker CLI bound to one engine address.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
    host: String,
}

impl DockerCli {
    /// Use an explicit docker binary.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>, host: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            host: host.into(),
        }
    }

    /// Find `docker` on the current PATH.
    ///
    /// # Errors
    /// Returns error if no docker executable can be found.
    pub async fn locate(host: &str) -> Result<Self, CommandError> {
        let binary = tokio::task::spawn_blocking(|| which::which("docker"))
            .await
            .ok()
            .and_then(Result::ok)
            .ok_or(CommandError::NotFound)?;
        Ok(Self::new(binary, host))
    }

    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// `docker -H <host> <args..>`.
    #[must_use]
    pub fn command<I>(&self, args: I) -> CommandParts
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut all = vec!["-H".to_string(), self.host.clone()];
        all.extend(args.into_iter().map(Into::into));
        CommandParts::new(self.binary.clone(), all)
    }

    /// `docker run -d --init` for the first process of a container.
    ///
    /// The first argument becomes the entrypoint so the image's own
    /// entrypoint never wraps the requested command.
    #[must_use]
    pub fn run_detached(&self, name: &str, image: &str, request: &StartRequest) -> CommandParts {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--init".to_string(),
            "--name".to_string(),
            name.to_string(),
        ];
        push_process_flags(&mut args, request);
        let mut argv = request.args.iter();
        if let Some(entrypoint) = argv.next() {
            args.push("--entrypoint".to_string());
            args.push(entrypoint.clone());
        }
        args.push(image.to_string());
        args.extend(argv.cloned());
        self.command(args).with_env(request.env.iter().cloned())
    }

    /// `docker exec` of `request` inside container `name`.
    #[must_use]
    pub fn exec(&self, name: &str, request: &StartRequest) -> CommandParts {
        let mut args = vec!["exec".to_string()];
        if request.tty {
            args.push("-it".to_string());
        }
        push_process_flags(&mut args, request);
        args.push(name.to_string());
        args.extend(request.args.iter().cloned());
        self.command(args).with_env(request.env.iter().cloned())
    }
}

/// Working directory and `-e KEY` flags.
///
/// Values stay out of the argument list; docker reads each named variable
/// from its own environment, which the caller sets from `request.env`.
fn push_process_flags(args: &mut Vec<String>, request: &StartRequest) {
    if !request.cwd.is_empty() {
        args.push("-w".to_string());
        args.push(request.cwd.clone());
    }
    for (key, _) in &request.env {
        args.push("-e".to_string());
        args.push(key.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> DockerCli {
        DockerCli::new("/usr/bin/docker", "unix:///var/run/docker.sock")
    }

    #[test]
    fn test_command_prefixes_host() {
        let parts = cli().command(["version"]);
        assert_eq!(parts.program, PathBuf::from("/usr/bin/docker"));
        assert_eq!(parts.args, vec!["-H", "unix:///var/run/docker.sock", "version"]);
    }

    #[test]
    fn test_run_detached_overrides_entrypoint() {
        let req = StartRequest::new(["/bin/sh", "-c", "sleep infinity"]).env("PATH", "/bin");
        let parts = cli().run_detached("aild-1", "sha256:abc", &req);
        assert_eq!(
            parts.args[2..],
            [
                "run",
                "-d",
                "--init",
                "--name",
                "aild-1",
                "-w",
                "/",
                "-e",
                "PATH",
                "--entrypoint",
                "/bin/sh",
                "sha256:abc",
                "-c",
                "sleep infinity",
            ]
        );
    }

    #[test]
    fn test_exec_with_tty() {
        let req = StartRequest::new(["/cagent", "run", "coder"])
            .cwd("/workspace")
            .tty(true);
        let parts = cli().exec("aild-1", &req);
        assert_eq!(
            parts.args[2..],
            ["exec", "-it", "-w", "/workspace", "aild-1", "/cagent", "run", "coder"]
        );
    }

    #[test]
    fn test_display_quotes_arguments() {
        let req = StartRequest::new(["/bin/sh", "-c", "cd /workspace && tar cf - ."]);
        let parts = cli().exec("aild-1", &req);
        let words = shlex::split(&parts.display()).unwrap();
        assert_eq!(words.last().map(String::as_str), Some("cd /workspace && tar cf - ."));
        assert_eq!(words.len(), parts.args.len() + 1);
    }

    #[test]
    fn test_env_values_stay_out_of_argv() {
        let req = StartRequest::new(["/cagent", "run", "coder"])
            .cwd("/workspace")
            .tty(true)
            .env("TERM", "xterm-256color")
            .env("ANTHROPIC_API_KEY", "sk-secret-value");
        let parts = cli().exec("aild-1", &req);

        assert!(parts.args.iter().all(|arg| !arg.contains("sk-secret-value")));
        assert!(!parts.display().contains("sk-secret-value"));
        assert!(!format!("{parts:?}").contains("sk-secret-value"));
        assert_eq!(
            parts.args[2..],
            [
                "exec",
                "-it",
                "-w",
                "/workspace",
                "-e",
                "TERM",
                "-e",
                "ANTHROPIC_API_KEY",
                "aild-1",
                "/cagent",
                "run",
                "coder",
            ]
        );
        assert!(
            parts
                .env
                .contains(&("ANTHROPIC_API_KEY".to_string(), "sk-secret-value".to_string()))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_reaches_spawned_process() {
        let parts = CommandParts::new(
            PathBuf::from("sh"),
            vec!["-c".into(), "printf %s \"$AILD_TEST_VALUE\"".into()],
        )
        .with_env([("AILD_TEST_VALUE".to_string(), "from-env".to_string())]);
        let out = parts.output(&CancellationToken::new()).await.unwrap();
        assert_eq!(out, "from-env");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_reports_failure() {
        let parts = CommandParts::new(
            PathBuf::from("sh"),
            vec!["-c".into(), "echo boom >&2; exit 4".into()],
        );
        let err = parts.output(&CancellationToken::new()).await.unwrap_err();
        match err {
            CommandError::Failed { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_cancelled() {
        let parts = CommandParts::new(PathBuf::from("sleep"), vec!["30".into()]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = parts.output(&cancel).await.unwrap_err();
        assert!(matches!(err, CommandError::Cancelled { .. }));
        assert!(matches!(err.into_engine(EngineError::Solve), EngineError::Cancelled));
    }
}
