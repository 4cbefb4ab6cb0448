//! Docker-backed build engine.
//!
//! Provides:
//! - `DockerEngine` - `BuildEngine` implementation driving the docker CLI
//! - `DockerCli` / `CommandParts` - Command building utilities
//! - Process handles for detached, piped and PTY-attached processes

pub mod command;
pub mod docker;
pub mod process;

pub use command::{CommandError, CommandParts, DockerCli};
pub use docker::{DockerContainer, DockerEngine, DockerGateway, ServerVersion};
pub use process::{DetachedProcess, PipedProcess, TerminalProcess};
