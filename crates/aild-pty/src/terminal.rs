//! Local console: raw mode, size queries and the yes/no prompt.

use std::io::{self, BufRead, IsTerminal, Write};

use aild_core::{Console, TerminalSize};

/// Console backed by the process's own stdin/stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalConsole;

impl LocalConsole {
    /// The console of the current process.
    #[must_use]
    pub const fn current() -> Self {
        Self
    }
}

impl Console for LocalConsole {
    fn is_terminal(&self) -> bool {
        io::stdin().is_terminal() && io::stdout().is_terminal()
    }

    fn size(&self) -> io::Result<TerminalSize> {
        let (cols, rows) = crossterm::terminal::size()?;
        Ok(TerminalSize::new(rows, cols))
    }

    fn enable_raw_mode(&self) -> io::Result<()> {
        crossterm::terminal::enable_raw_mode()
    }

    // crossterm keeps the termios captured by `enable_raw_mode` and puts it back here.
    fn restore_mode(&self) -> io::Result<()> {
        crossterm::terminal::disable_raw_mode()
    }

    fn ask_yes_no(&self, question: &str) -> bool {
        let stdin = io::stdin();
        let mut stdout = io::stdout().lock();
        // the relayed session may have left the cursor mid-line
        let _ = writeln!(stdout);
        ask_yes_no(&mut stdin.lock(), &mut stdout, question)
    }
}

/// Raw mode held for the lifetime of the guard.
///
/// The previous mode is restored on drop, whichever way the scope is left.
pub struct RawModeGuard<'a> {
    console: &'a dyn Console,
}

impl<'a> RawModeGuard<'a> {
    /// Switch `console` into raw mode.
    ///
    /// # Errors
    /// Returns error if raw mode cannot be entered; nothing is restored then.
    pub fn enter(console: &'a dyn Console) -> io::Result<Self> {
        console.enable_raw_mode()?;
        Ok(Self { console })
    }
}

impl Drop for RawModeGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.console.restore_mode() {
            tracing::warn!(%err, "failed to restore terminal mode");
        }
    }
}

/// Ask `question` until the answer is yes or no.
///
/// Accepts `y`, `yes`, `n` and `no` in any case. Returns `false` when the
/// input ends or cannot be read.
pub fn ask_yes_no<R, W>(input: &mut R, output: &mut W, question: &str) -> bool
where
    R: BufRead,
    W: Write,
{
    let mut line = String::new();
    loop {
        let _ = write!(output, "{question} [y/n]: ");
        let _ = output.flush();

        line.clear();
        match input.read_line(&mut line) {
            Ok(_) if line.ends_with('\n') => {}
            Ok(_) | Err(_) => return false,
        }

        match line.trim().to_lowercase().as_str() {
            "y" | "yes" => return true,
            "n" | "no" => return false,
            _ => {
                let _ = writeln!(output, "Please enter 'y' or 'n'");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Cursor,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    fn ask(input: &str) -> (bool, String) {
        let mut reader = Cursor::new(input.as_bytes().to_vec());
        let mut out = Vec::new();
        let answer = ask_yes_no(&mut reader, &mut out, "Apply?");
        (answer, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_accepts_yes_variants() {
        assert!(ask("y\n").0);
        assert!(ask("YES\n").0);
        assert!(ask("  Yes \n").0);
    }

    #[test]
    fn test_accepts_no_variants() {
        assert!(!ask("n\n").0);
        assert!(!ask("No\n").0);
    }

    #[test]
    fn test_reprompts_on_garbage() {
        let (answer, out) = ask("maybe\n\ny\n");
        assert!(answer);
        assert_eq!(out.matches("Apply? [y/n]: ").count(), 3);
        assert_eq!(out.matches("Please enter 'y' or 'n'").count(), 2);
    }

    #[test]
    fn test_eof_is_false() {
        assert!(!ask("").0);
        assert!(!ask("what\n").0);
        // no trailing newline means the read hit end of input
        assert!(!ask("y").0);
    }

    struct CountingConsole {
        enabled: AtomicUsize,
        restored: AtomicUsize,
        fail_enable: bool,
    }

    impl CountingConsole {
        fn new(fail_enable: bool) -> Self {
            Self {
                enabled: AtomicUsize::new(0),
                restored: AtomicUsize::new(0),
                fail_enable,
            }
        }
    }

    impl Console for CountingConsole {
        fn is_terminal(&self) -> bool {
            true
        }

        fn size(&self) -> io::Result<TerminalSize> {
            Ok(TerminalSize::new(24, 80))
        }

        fn enable_raw_mode(&self) -> io::Result<()> {
            if self.fail_enable {
                return Err(io::Error::other("not a tty"));
            }
            self.enabled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn restore_mode(&self) -> io::Result<()> {
            self.restored.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn ask_yes_no(&self, _question: &str) -> bool {
            false
        }
    }

    #[test]
    fn test_guard_restores_on_drop() {
        let console = CountingConsole::new(false);
        {
            let _guard = RawModeGuard::enter(&console).unwrap();
            assert_eq!(console.restored.load(Ordering::SeqCst), 0);
        }
        assert_eq!(console.enabled.load(Ordering::SeqCst), 1);
        assert_eq!(console.restored.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guard_not_created_when_enable_fails() {
        let console = CountingConsole::new(true);
        assert!(RawModeGuard::enter(&console).is_err());
        assert_eq!(console.restored.load(Ordering::SeqCst), 0);
    }
}
