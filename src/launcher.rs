//! Seam to whatever actually spawns the process.
//!
//! The container runtime client is external; it only needs the child-side
//! descriptors a [`ProcessIo`] exposes. [`LocalLauncher`] spawns a host
//! command instead, which is what the CLI and the end-to-end tests use.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};

use crate::error::AttachError;
use crate::process_io::{AttachConfig, HostStdio, ProcessIo};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("No command given")]
    EmptyCommand,

    #[error("Failed to prepare child stdio: {0}")]
    Stdio(#[source] io::Error),

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Starts a process on top of an attached [`ProcessIo`].
pub trait ProcessLauncher {
    type Process;

    fn launch(&self, command: &[String], io: &ProcessIo) -> Result<Self::Process, LaunchError>;
}

/// Spawns host commands with `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct LocalLauncher;

impl ProcessLauncher for LocalLauncher {
    type Process = Child;

    fn launch(&self, command: &[String], io: &ProcessIo) -> Result<Child, LaunchError> {
        let (program, args) = command.split_first().ok_or(LaunchError::EmptyCommand)?;
        let stdio = io.command_stdio().map_err(LaunchError::Stdio)?;
        let config = io.config();

        // The Command owns duplicates of the child-side ends; it must be
        // dropped right after spawning so only the child keeps them open.
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(stdio.stdin.unwrap_or_else(Stdio::null))
            .stdout(stdio.stdout.unwrap_or_else(Stdio::null))
            .stderr(stdio.stderr.unwrap_or_else(|| {
                if config.tty && !config.detach {
                    Stdio::inherit()
                } else {
                    Stdio::null()
                }
            }));

        let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: program.clone(),
            source,
        })?;
        tracing::info!(pid = ?child.id(), program = %program, "Process launched");
        Ok(child)
    }
}

/// Attach, spawn `command`, wait for it and for its output to drain.
///
/// Returns the process exit code (`128 + signal` when killed by a
/// signal). A drain timeout is logged and otherwise ignored.
pub async fn run_attached(
    config: AttachConfig,
    host: HostStdio,
    command: &[String],
    drain_timeout: Duration,
) -> Result<i32, AttachError> {
    let mut io = ProcessIo::create_with(config, host)?;
    let mut child = LocalLauncher.launch(command, &io)?;
    io.close_after_start();

    let status = child.wait().await.map_err(AttachError::Wait)?;
    tracing::info!(id = %io.id(), %status, "Process exited");

    if io.wait(drain_timeout).await.is_err() {
        tracing::warn!(id = %io.id(), "Reporting process as finished without full drain");
    }
    io.close().map_err(AttachError::Restore)?;

    Ok(exit_code(status))
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match status.code() {
        Some(code) => code,
        None => status.signal().map(|signal| 128 + signal).unwrap_or(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn exit_code_maps_signals() {
        assert_eq!(exit_code(std::process::ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(std::process::ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(std::process::ExitStatus::from_raw(libc::SIGKILL)), 128 + 9);
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let io = ProcessIo::create_with(
            AttachConfig {
                detach: true,
                ..AttachConfig::default()
            },
            HostStdio::default(),
        )
        .unwrap();
        let err = LocalLauncher.launch(&[], &io).unwrap_err();
        assert!(matches!(err, LaunchError::EmptyCommand));
    }
}
