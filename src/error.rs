//! Errors surfaced by the attach bridge.
//!
//! Only setup failures and drain timeouts leave this crate's core. Errors
//! discovered while streaming stay local to their stream and end up as a
//! [`StreamTerminal`](crate::pump::StreamTerminal).

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::launcher::LaunchError;

/// Fatal errors while assembling an attach. No partial attach survives.
#[derive(Debug, Error)]
pub enum SetupError {
    /// Pumps run as tokio tasks and need a runtime to be spawned on.
    #[error("No tokio runtime available to drive stream pumps")]
    NoRuntime,

    #[error("Failed to create pipe: {0}")]
    Pipe(#[source] io::Error),

    #[error("Failed to switch descriptor to non-blocking mode: {0}")]
    NonBlocking(#[source] io::Error),

    #[error("Failed to acquire terminal: {0}")]
    Terminal(#[source] io::Error),

    #[error("Failed to register descriptor for readiness: {0}")]
    Register(#[source] io::Error),
}

/// Output streams did not drain within the bound.
///
/// Non-fatal: the attach is best-effort once the timeout fires and the
/// underlying process is left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Output streams not drained after {timeout:?} ({remaining} still open)")]
pub struct TimeoutError {
    pub timeout: Duration,
    pub remaining: usize,
}

/// Errors from a complete attach-spawn-drain cycle.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("Failed to wait for process: {0}")]
    Wait(#[source] io::Error),

    #[error("Failed to restore terminal: {0}")]
    Restore(#[source] io::Error),
}
