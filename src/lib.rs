//! Process I/O bridge for container processes.
//!
//! Attaches the host terminal and/or host pipes to a freshly started
//! process: non-blocking descriptor plumbing, terminal raw mode, one
//! readiness-driven pump per stream, and a completion barrier that lets the
//! caller wait (bounded) until every captured output stream has drained.

pub mod barrier;
pub mod config;
pub mod error;
pub mod io;
pub mod launcher;
pub mod logging;
pub mod process_io;
pub mod pump;
pub mod terminal;

pub use barrier::CompletionBarrier;
pub use error::{AttachError, SetupError, TimeoutError};
pub use io::{IoAction, OsFile, Pipe};
pub use launcher::{run_attached, LaunchError, LocalLauncher, ProcessLauncher};
pub use process_io::{AttachConfig, AttachPhase, ChildStdio, HostStdio, ProcessIo};
pub use pump::{StreamPump, StreamState, StreamTerminal};
pub use terminal::TerminalSession;
