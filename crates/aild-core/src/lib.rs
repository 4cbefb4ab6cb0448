//! Core abstractions for ephemeral agent build sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `BuildSession` - Per-invocation context with its cancellation token
//! - `Config` - Environment-driven configuration
//! - `SolveStatus` - Build progress events and the drain task
//! - Build engine, container and console traits

pub mod config;
pub mod context;
pub mod progress;
pub mod traits;

pub use config::Config;
pub use context::{ArchiveBlob, BuildSession};
pub use progress::{ProgressSender, SolveStatus};
pub use traits::{
    BuildEngine, CaptureBuffer, Console, Container, ContainerProcess, Definition, EngineError,
    Gateway, Mount, NewContainerRequest, Reference, SolveOptions, SolveResult, StartRequest, Stdio,
    TerminalSize,
};
