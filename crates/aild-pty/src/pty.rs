//! Commands attached to the local terminal through a pseudo terminal.

use std::{
    io::{self, Read, Write},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use aild_core::TerminalSize;
use portable_pty::{ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize, native_pty_system};
use thiserror::Error;
use tokio::task::JoinHandle;

/// How long the input pump blocks before re-checking its stop flag.
const INPUT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// PTY error.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open PTY: {0}")]
    Open(String),
    #[error("failed to spawn command: {0}")]
    Spawn(String),
    #[error("failed to resize PTY: {0}")]
    Resize(String),
    #[error("process was already waited on")]
    AlreadyWaited,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

const fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// A child running on a PTY whose other end is wired to the local terminal.
///
/// Local stdin is pumped into the PTY and PTY output is copied to local
/// stdout until the child exits.
pub struct PtyProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    exit: tokio::sync::Mutex<Option<JoinHandle<io::Result<ExitStatus>>>>,
    stop_input: Arc<AtomicBool>,
    input_pump: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PtyProcess {
    /// Spawn `command` on a new PTY of the given size.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// Returns error if the PTY cannot be opened or the command fails to spawn.
    pub fn spawn(command: CommandBuilder, size: TerminalSize) -> Result<Self, PtyError> {
        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let mut child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        // Only the child may hold the slave, so the reader sees EOF on exit.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Open(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let stop_input = Arc::new(AtomicBool::new(false));
        thread::Builder::new()
            .name("aild-pty-output".into())
            .spawn(move || pump_output(reader))?;
        let stop = Arc::clone(&stop_input);
        let input_pump = thread::Builder::new()
            .name("aild-pty-input".into())
            .spawn(move || match LocalInput::open() {
                Ok(input) => pump_input(input, writer, &stop),
                Err(err) => tracing::debug!(%err, "cannot read local input"),
            })?;

        let killer = child.clone_killer();
        let exit = tokio::task::spawn_blocking(move || child.wait());

        Ok(Self {
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            exit: tokio::sync::Mutex::new(Some(exit)),
            stop_input,
            input_pump: Mutex::new(Some(input_pump)),
        })
    }

    /// Wait for the child to exit and stop pumping local input.
    ///
    /// Local input is no longer consumed once this returns, so the next
    /// reader of stdin sees everything typed after the exit.
    ///
    /// # Errors
    /// Returns error if the child cannot be reaped or was already waited on.
    pub async fn wait(&self) -> Result<ExitStatus, PtyError> {
        let handle = self
            .exit
            .lock()
            .await
            .take()
            .ok_or(PtyError::AlreadyWaited)?;
        let status = handle.await.map_err(io::Error::other);
        self.stop_input.store(true, Ordering::SeqCst);
        self.join_input_pump().await;
        Ok(status??)
    }

    async fn join_input_pump(&self) {
        let pump = self
            .input_pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // Without readiness polling the pump only notices the flag after its next read.
        let Some(pump) = pump.filter(|_| cfg!(unix)) else {
            return;
        };
        let joined = tokio::task::spawn_blocking(move || pump.join()).await;
        if !matches!(joined, Ok(Ok(()))) {
            tracing::debug!("pty input pump ended abnormally");
        }
    }

    /// Kill the child.
    ///
    /// # Errors
    /// Returns error if the signal cannot be delivered.
    pub fn kill(&self) -> io::Result<()> {
        self.killer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .kill()
    }

    /// Resize the PTY; the child receives `SIGWINCH`.
    ///
    /// # Errors
    /// Returns error if the PTY rejects the new size.
    pub fn resize(&self, size: TerminalSize) -> Result<(), PtyError> {
        self.master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(pty_size(size))
            .map_err(|e| PtyError::Resize(e.to_string()))
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.stop_input.store(true, Ordering::SeqCst);
    }
}

fn pump_output(mut reader: Box<dyn Read + Send>) {
    let mut stdout = io::stdout();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if stdout.write_all(&buf[..n]).and_then(|()| stdout.flush()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            // EIO once the child side is closed
            Err(_) => break,
        }
    }
    tracing::trace!("pty output pump finished");
}

fn pump_input(mut input: LocalInput, mut writer: impl Write, stop: &AtomicBool) {
    let mut buf = [0u8; 4096];
    while !stop.load(Ordering::SeqCst) {
        match input.poll_read(&mut buf, INPUT_POLL_INTERVAL, stop) {
            Ok(Some(0)) => break,
            Ok(Some(n)) => {
                if writer.write_all(&buf[..n]).and_then(|()| writer.flush()).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                tracing::debug!(%err, "local input pump stopped");
                break;
            }
        }
    }
    tracing::trace!("pty input pump finished");
}

/// Unbuffered handle on local stdin that can wait with a timeout.
///
/// Reading bypasses `io::Stdin`'s buffer so nothing typed after the child
/// exits is swallowed before the next reader sees it.
#[cfg(unix)]
struct LocalInput(std::fs::File);

#[cfg(unix)]
impl LocalInput {
    fn open() -> io::Result<Self> {
        use std::os::fd::AsFd;

        let fd = io::stdin().as_fd().try_clone_to_owned()?;
        Ok(Self(std::fs::File::from(fd)))
    }

    /// Read once input is ready, unless `stop` was raised while waiting.
    fn poll_read(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
        stop: &AtomicBool,
    ) -> io::Result<Option<usize>> {
        use std::os::fd::AsFd;

        use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.0.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) | Err(nix::errno::Errno::EINTR) => Ok(None),
            // leave pending bytes for whoever reads stdin next
            Ok(_) if stop.load(Ordering::SeqCst) => Ok(None),
            Ok(_) => self.0.read(buf).map(Some),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }
}

#[cfg(not(unix))]
struct LocalInput(io::Stdin);

#[cfg(not(unix))]
impl LocalInput {
    fn open() -> io::Result<Self> {
        Ok(Self(io::stdin()))
    }

    // No readiness polling here; the read blocks until input arrives.
    fn poll_read(
        &mut self,
        buf: &mut [u8],
        _timeout: Duration,
        _stop: &AtomicBool,
    ) -> io::Result<Option<usize>> {
        self.0.read(buf).map(Some)
    }
}
