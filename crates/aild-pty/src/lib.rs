//! Local terminal relay for interactive container processes.
//!
//! Provides:
//! - `LocalConsole` - crossterm-backed `Console` with a line prompt
//! - `RawModeGuard` - Scoped raw mode that always restores the terminal
//! - `PtyProcess` - Command attached to the local terminal through a PTY
//! - `run_interactive_shell` - Relay with live resize forwarding

pub mod pty;
pub mod relay;
pub mod terminal;

pub use pty::{PtyError, PtyProcess};
pub use relay::{ShellError, forward_resizes, interactive_request, run_interactive_shell};
pub use terminal::{LocalConsole, RawModeGuard, ask_yes_no};
