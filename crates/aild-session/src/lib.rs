//! Session orchestration for aild.
//!
//! Provides:
//! - `run_session` - The build, relay, confirm and apply lifecycle
//! - `extract_changes` - Capture a remote directory as a tar stream
//! - `apply_archive` - Path-safe application of a tar stream to a local directory

pub mod apply;
pub mod extract;
pub mod orchestrator;

pub use apply::{ApplyError, ApplyReport, apply_archive};
pub use extract::{ExtractError, extract_changes};
pub use orchestrator::{SessionError, SessionOutcome, run_session, run_with_engine, with_container};
