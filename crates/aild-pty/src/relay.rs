//! Interactive terminal relay with live resize forwarding.

use std::{io, sync::Arc, time::Duration};

use aild_core::{
    Config, Console, Container, ContainerProcess, EngineError, StartRequest, Stdio, TerminalSize,
    config::{CONTAINER_PATH, CONTAINER_WORKDIR},
};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::terminal::RawModeGuard;

/// How often the local terminal size is sampled.
pub const RESIZE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Shell error.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("no console available")]
    NoConsole,
    #[error("failed to set terminal raw mode: {0}")]
    RawMode(io::Error),
    #[error("failed to start shell: {0}")]
    Start(EngineError),
    #[error("shell exited with error: {0}")]
    Exited(EngineError),
}

/// Request for the interactive agent process.
///
/// Only `TERM`, `COLORTERM` and the configured API key variable are copied
/// from the local environment; `PATH` is the container default.
#[must_use]
pub fn interactive_request(config: &Config, agent: &str) -> StartRequest {
    interactive_request_with(config, agent, |key| std::env::var(key).ok())
}

/// [`interactive_request`] with an explicit environment lookup.
#[must_use]
pub fn interactive_request_with<F>(config: &Config, agent: &str, lookup: F) -> StartRequest
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| lookup(key).unwrap_or_default();

    StartRequest::new([config.agent_binary.as_str(), "run", agent])
        .env("TERM", var("TERM"))
        .env("PATH", CONTAINER_PATH)
        .env(config.api_key_var.as_str(), var(&config.api_key_var))
        .env("COLORTERM", var("COLORTERM"))
        .cwd(CONTAINER_WORKDIR)
        .tty(true)
        .stdio(Stdio::Terminal)
}

/// Run `request` attached to the local terminal until it exits.
///
/// The terminal is in raw mode for the duration and is restored on every
/// exit path. Size changes are forwarded while the process runs.
///
/// # Errors
/// Returns error if no terminal is attached, raw mode fails, the process
/// cannot be started, or it exits unsuccessfully.
pub async fn run_interactive_shell(
    console: Arc<dyn Console>,
    container: &dyn Container,
    request: StartRequest,
    cancel: &CancellationToken,
) -> Result<(), ShellError> {
    if !console.is_terminal() {
        return Err(ShellError::NoConsole);
    }

    let raw_mode = RawModeGuard::enter(console.as_ref()).map_err(ShellError::RawMode)?;

    let process: Arc<dyn ContainerProcess> = container
        .start(request, cancel.child_token())
        .await
        .map_err(ShellError::Start)?
        .into();

    let resize_cancel = cancel.child_token();
    let resizer = tokio::spawn(forward_resizes(
        Arc::clone(&console),
        Arc::clone(&process),
        resize_cancel.clone(),
        RESIZE_POLL_INTERVAL,
    ));

    let result = process.wait().await;

    resize_cancel.cancel();
    match resizer.await {
        Ok(forwarded) => tracing::debug!(forwarded, "resize forwarding stopped"),
        Err(err) => tracing::debug!(%err, "resize task ended abnormally"),
    }
    drop(raw_mode);

    result.map_err(ShellError::Exited)
}

/// Forward the local terminal size to `process` until cancelled.
///
/// The size is sampled every `interval` and only sent when it differs from
/// the last size that was delivered, so a failed delivery is retried on the
/// next tick. Stops early if the size query fails. Returns the number of
/// sizes delivered.
pub async fn forward_resizes(
    console: Arc<dyn Console>,
    process: Arc<dyn ContainerProcess>,
    cancel: CancellationToken,
    interval: Duration,
) -> usize {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut delivered: Option<TerminalSize> = None;
    let mut forwarded = 0;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let size = match console.size() {
            Ok(size) => size,
            Err(err) => {
                tracing::debug!(%err, "terminal size unavailable");
                break;
            }
        };
        if delivered == Some(size) {
            continue;
        }

        match process.resize(size).await {
            Ok(()) => {
                delivered = Some(size);
                forwarded += 1;
            }
            Err(err) => tracing::debug!(%err, ?size, "failed to forward terminal size"),
        }
    }

    forwarded
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;

    struct FakeConsole {
        terminal: bool,
        size: Mutex<Option<TerminalSize>>,
        raw: AtomicBool,
        restores: AtomicUsize,
    }

    impl FakeConsole {
        fn new(terminal: bool) -> Arc<Self> {
            Arc::new(Self {
                terminal,
                size: Mutex::new(Some(TerminalSize::new(24, 80))),
                raw: AtomicBool::new(false),
                restores: AtomicUsize::new(0),
            })
        }

        fn set_size(&self, size: Option<TerminalSize>) {
            *self.size.lock().unwrap() = size;
        }
    }

    impl Console for FakeConsole {
        fn is_terminal(&self) -> bool {
            self.terminal
        }

        fn size(&self) -> io::Result<TerminalSize> {
            (*self.size.lock().unwrap()).ok_or_else(|| io::Error::other("closed"))
        }

        fn enable_raw_mode(&self) -> io::Result<()> {
            self.raw.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn restore_mode(&self) -> io::Result<()> {
            self.raw.store(false, Ordering::SeqCst);
            self.restores.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn ask_yes_no(&self, _question: &str) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct FakeProcess {
        exit: Notify,
        fail: bool,
        resizes: Mutex<Vec<TerminalSize>>,
        reject_resizes: AtomicUsize,
    }

    #[async_trait]
    impl ContainerProcess for FakeProcess {
        async fn wait(&self) -> Result<(), EngineError> {
            self.exit.notified().await;
            if self.fail {
                Err(EngineError::ExitCode(2))
            } else {
                Ok(())
            }
        }

        async fn resize(&self, size: TerminalSize) -> Result<(), EngineError> {
            if self.reject_resizes.load(Ordering::SeqCst) > 0 {
                self.reject_resizes.fetch_sub(1, Ordering::SeqCst);
                return Err(EngineError::Container("busy".into()));
            }
            self.resizes.lock().unwrap().push(size);
            Ok(())
        }
    }

    struct FakeContainer {
        process: Arc<FakeProcess>,
        fail_start: bool,
        started: Mutex<Vec<StartRequest>>,
    }

    struct SharedProcess(Arc<FakeProcess>);

    #[async_trait]
    impl ContainerProcess for SharedProcess {
        async fn wait(&self) -> Result<(), EngineError> {
            self.0.wait().await
        }

        async fn resize(&self, size: TerminalSize) -> Result<(), EngineError> {
            self.0.resize(size).await
        }
    }

    #[async_trait]
    impl Container for FakeContainer {
        async fn start(
            &self,
            request: StartRequest,
            _cancel: CancellationToken,
        ) -> Result<Box<dyn ContainerProcess>, EngineError> {
            self.started.lock().unwrap().push(request);
            if self.fail_start {
                return Err(EngineError::Start("no such binary".into()));
            }
            Ok(Box::new(SharedProcess(Arc::clone(&self.process))))
        }

        async fn release(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn container(process: Arc<FakeProcess>, fail_start: bool) -> FakeContainer {
        FakeContainer {
            process,
            fail_start,
            started: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn test_interactive_request_env_allow_list() {
        let config = Config::default();
        let req = interactive_request_with(&config, "coder", |key| match key {
            "TERM" => Some("xterm-256color".into()),
            "ANTHROPIC_API_KEY" => Some("sk-test".into()),
            "HOME" => Some("/home/me".into()),
            _ => None,
        });

        assert_eq!(req.args, vec!["/cagent", "run", "coder"]);
        assert_eq!(req.cwd, CONTAINER_WORKDIR);
        assert!(req.tty);
        assert!(matches!(req.stdio, Stdio::Terminal));
        assert_eq!(
            req.env_pairs(),
            vec![
                "TERM=xterm-256color".to_string(),
                format!("PATH={CONTAINER_PATH}"),
                "ANTHROPIC_API_KEY=sk-test".to_string(),
                "COLORTERM=".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_no_console_fails_before_raw_mode() {
        let console = FakeConsole::new(false);
        let ctr = container(Arc::new(FakeProcess::default()), false);

        let err = run_interactive_shell(
            console.clone(),
            &ctr,
            StartRequest::new(["sh"]),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ShellError::NoConsole));
        assert_eq!(console.restores.load(Ordering::SeqCst), 0);
        assert!(ctr.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_failure_restores_terminal() {
        let console = FakeConsole::new(true);
        let ctr = container(Arc::new(FakeProcess::default()), true);

        let err = run_interactive_shell(
            console.clone(),
            &ctr,
            StartRequest::new(["sh"]),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ShellError::Start(_)));
        assert!(!console.raw.load(Ordering::SeqCst));
        assert_eq!(console.restores.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_process_error_surfaces_and_restores() {
        let console = FakeConsole::new(true);
        let process = Arc::new(FakeProcess {
            fail: true,
            ..FakeProcess::default()
        });
        let ctr = container(Arc::clone(&process), false);
        process.exit.notify_one();

        let err = run_interactive_shell(
            console.clone(),
            &ctr,
            StartRequest::new(["sh"]),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ShellError::Exited(EngineError::ExitCode(2))));
        assert_eq!(console.restores.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clean_exit_restores_terminal() {
        let console = FakeConsole::new(true);
        let process = Arc::new(FakeProcess::default());
        let ctr = container(Arc::clone(&process), false);
        process.exit.notify_one();

        run_interactive_shell(
            console.clone(),
            &ctr,
            StartRequest::new(["sh"]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(!console.raw.load(Ordering::SeqCst));
        assert_eq!(console.restores.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_only_forwards_changes() {
        let console = FakeConsole::new(true);
        let process = Arc::new(FakeProcess::default());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(forward_resizes(
            console.clone(),
            Arc::clone(&process) as Arc<dyn ContainerProcess>,
            cancel.clone(),
            Duration::from_millis(250),
        ));

        tokio::time::sleep(Duration::from_secs(2)).await;
        console.set_size(Some(TerminalSize::new(50, 200)));
        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), 2);
        assert_eq!(
            *process.resizes.lock().unwrap(),
            vec![TerminalSize::new(24, 80), TerminalSize::new(50, 200)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_retries_after_rejection() {
        let console = FakeConsole::new(true);
        let process = Arc::new(FakeProcess::default());
        process.reject_resizes.store(2, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(forward_resizes(
            console.clone(),
            Arc::clone(&process) as Arc<dyn ContainerProcess>,
            cancel.clone(),
            Duration::from_millis(250),
        ));

        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), 1);
        assert_eq!(*process.resizes.lock().unwrap(), vec![TerminalSize::new(24, 80)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_stops_when_size_unavailable() {
        let console = FakeConsole::new(true);
        console.set_size(None);
        let process = Arc::new(FakeProcess::default());

        let forwarded = forward_resizes(
            console.clone(),
            Arc::clone(&process) as Arc<dyn ContainerProcess>,
            CancellationToken::new(),
            Duration::from_millis(250),
        )
        .await;

        assert_eq!(forwarded, 0);
        assert!(process.resizes.lock().unwrap().is_empty());
    }
}
