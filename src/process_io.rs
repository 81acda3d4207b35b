//! Attach orchestration.
//!
//! [`ProcessIo`] decides, from an [`AttachConfig`], which of the three
//! standard streams get a pipe, wires each host-side end into a
//! [`StreamPump`], and hands the child-side ends to whoever spawns the
//! process. After the spawn the caller closes the child-side ends with
//! [`ProcessIo::close_after_start`], waits for the output streams to drain
//! with [`ProcessIo::wait`], and finally releases the terminal with
//! [`ProcessIo::close`].

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use scopeguard::ScopeGuard;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::barrier::CompletionBarrier;
use crate::error::{SetupError, TimeoutError};
use crate::io::{OsFile, Pipe};
use crate::pump::{StreamPump, StreamState};
use crate::terminal::TerminalSession;

/// How a process is attached to the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachConfig {
    /// Run the process with a terminal.
    pub tty: bool,
    /// Forward host stdin to the process.
    pub interactive: bool,
    /// Do not capture stdout/stderr at all.
    pub detach: bool,
}

impl AttachConfig {
    pub fn captures_stdin(&self) -> bool {
        self.interactive
    }

    pub fn captures_stdout(&self) -> bool {
        !self.detach
    }

    /// With a terminal, stderr travels through the terminal channel.
    pub fn captures_stderr(&self) -> bool {
        !self.detach && !self.tty
    }

    /// Raw mode only matters when keystrokes are forwarded.
    pub fn uses_terminal(&self) -> bool {
        self.tty && self.interactive
    }

    /// Number of output streams the completion barrier waits for.
    pub fn output_streams(&self) -> usize {
        usize::from(self.captures_stdout()) + usize::from(self.captures_stderr())
    }
}

/// Host-side endpoints an attach connects to.
#[derive(Debug, Clone)]
pub struct HostStdio {
    pub stdin: OsFile,
    pub stdout: OsFile,
    pub stderr: OsFile,
    /// Terminal device to put in raw mode; `None` means the controlling
    /// terminal of this process.
    pub terminal_device: Option<PathBuf>,
}

impl Default for HostStdio {
    fn default() -> Self {
        Self {
            stdin: OsFile::stdin(),
            stdout: OsFile::stdout(),
            stderr: OsFile::stderr(),
            terminal_device: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AttachPhase {
    Configuring = 0,
    Attached = 1,
    ClosingAfterStart = 2,
    Draining = 3,
    Closed = 4,
}

impl AttachPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Configuring,
            1 => Self::Attached,
            2 => Self::ClosingAfterStart,
            3 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// Child-side stdio, ready for `Command::stdin`/`stdout`/`stderr`.
///
/// `None` means the stream was not configured and the spawner picks its
/// own default.
#[derive(Debug, Default)]
pub struct ChildStdio {
    pub stdin: Option<Stdio>,
    pub stdout: Option<Stdio>,
    pub stderr: Option<Stdio>,
}

/// Descriptor flags to put back once the pumps are done with a host
/// descriptor.
#[derive(Debug, Clone, Copy)]
struct FlagRestore {
    file: OsFile,
    flags: libc::c_int,
}

impl FlagRestore {
    fn restore(self) {
        if let Err(err) = self.file.set_flags(self.flags) {
            tracing::warn!(fd = self.file.fd(), "Failed to restore descriptor flags: {}", err);
        }
    }
}

/// A host-side pump endpoint, held open for as long as its pump runs.
enum Endpoint {
    /// The host's own descriptor, switched to non-blocking in place.
    Shared(OsFile),
    /// A private reopen of a host terminal.
    Private(File),
    Terminal(Arc<TerminalSession>),
}

impl Endpoint {
    fn os_file(&self) -> OsFile {
        match self {
            Self::Shared(file) => *file,
            Self::Private(file) => OsFile::from(file.as_fd()),
            Self::Terminal(terminal) => terminal.os_file(),
        }
    }
}

/// Everything a half-built attach has to undo.
#[derive(Default)]
struct Rollback {
    terminal: Option<Arc<TerminalSession>>,
    restores: Vec<FlagRestore>,
    pumps: Vec<(&'static str, AbortHandle)>,
}

impl Rollback {
    /// Switch `file` to non-blocking in place, remembering its flags.
    fn share_nonblocking(&mut self, file: OsFile) -> Result<(), SetupError> {
        let flags = file.flags().map_err(SetupError::NonBlocking)?;
        file.set_nonblocking().map_err(SetupError::NonBlocking)?;
        self.restores.push(FlagRestore { file, flags });
        Ok(())
    }

    /// Prepare a host descriptor for a pump.
    ///
    /// Terminals are reopened: the shell usually hands out stdin, stdout
    /// and stderr as copies of one open file description, and
    /// `O_NONBLOCK` on any of them would reach all the others.
    fn host_endpoint(&mut self, file: OsFile) -> Result<Endpoint, SetupError> {
        if file.is_terminal() {
            let private = file.reopen_terminal().map_err(SetupError::Terminal)?;
            OsFile::from(private.as_fd())
                .set_nonblocking()
                .map_err(SetupError::NonBlocking)?;
            return Ok(Endpoint::Private(private));
        }
        self.share_nonblocking(file)?;
        Ok(Endpoint::Shared(file))
    }

    fn undo(self) {
        tracing::debug!(pumps = self.pumps.len(), "Rolling back partial attach");
        for (_, pump) in self.pumps {
            pump.abort();
        }
        for restore in self.restores.into_iter().rev() {
            restore.restore();
        }
        if let Some(terminal) = self.terminal {
            if let Err(err) = terminal.reset() {
                tracing::warn!("Failed to restore terminal during rollback: {}", err);
            }
        }
    }
}

/// The assembled stdio plumbing of one attached process.
pub struct ProcessIo {
    id: Uuid,
    config: AttachConfig,
    phase: AtomicU8,
    child_stdin: Option<OwnedFd>,
    child_stdout: Option<OwnedFd>,
    child_stderr: Option<OwnedFd>,
    terminal: Option<Arc<TerminalSession>>,
    restores: Vec<FlagRestore>,
    pumps: Vec<(&'static str, AbortHandle)>,
    stdin_state: Option<watch::Receiver<StreamState>>,
    stdout_state: Option<watch::Receiver<StreamState>>,
    stderr_state: Option<watch::Receiver<StreamState>>,
    barrier: CompletionBarrier,
}

impl ProcessIo {
    /// Attach to this process's own stdin/stdout/stderr and controlling
    /// terminal.
    pub fn create(config: AttachConfig) -> Result<Self, SetupError> {
        Self::create_with(config, HostStdio::default())
    }

    /// Attach to explicit host endpoints.
    ///
    /// Must be called from within a tokio runtime; the pumps run as tasks
    /// on it. Any failure undoes what was already set up (terminal mode,
    /// host descriptor flags, registered pumps) before returning.
    pub fn create_with(config: AttachConfig, host: HostStdio) -> Result<Self, SetupError> {
        let runtime = Handle::try_current().map_err(|_| SetupError::NoRuntime)?;
        let id = Uuid::new_v4();
        let span = tracing::info_span!("attach", %id);
        let _entered = span.enter();

        let barrier = CompletionBarrier::new(config.output_streams());
        let mut setup = scopeguard::guard(Rollback::default(), Rollback::undo);

        if config.uses_terminal() {
            let session = match &host.terminal_device {
                Some(path) => TerminalSession::open(path),
                None => TerminalSession::acquire(),
            }
            .map_err(SetupError::Terminal)?;
            session.set_raw().map_err(SetupError::Terminal)?;
            setup.terminal = Some(Arc::new(session));
        }

        let mut child_stdin = None;
        let mut stdin_state = None;
        if config.captures_stdin() {
            let (read_end, write_end) = open_pipe()?;
            let sink = OsFile::from(write_end.as_fd());
            sink.set_nonblocking().map_err(SetupError::NonBlocking)?;
            let source = setup.host_endpoint(host.stdin)?;

            let pump = StreamPump::register("stdin", source.os_file(), sink)
                .map_err(SetupError::Register)?;
            stdin_state = Some(pump.subscribe());
            let task = runtime.spawn(
                async move {
                    pump.run(move |_| {
                        drop(write_end);
                        drop(source);
                    })
                    .await;
                }
                .instrument(span.clone()),
            );
            setup.pumps.push(("stdin", task.abort_handle()));
            child_stdin = Some(read_end);
        }

        let mut child_stdout = None;
        let mut stdout_state = None;
        if config.captures_stdout() {
            let sink = match setup.terminal.clone() {
                Some(terminal) => {
                    setup.share_nonblocking(terminal.os_file())?;
                    Endpoint::Terminal(terminal)
                }
                None => setup.host_endpoint(host.stdout)?,
            };
            let (write_end, state, task) = spawn_output(&runtime, "stdout", sink, &barrier, &span)?;
            setup.pumps.push(("stdout", task));
            stdout_state = Some(state);
            child_stdout = Some(write_end);
        }

        let mut child_stderr = None;
        let mut stderr_state = None;
        if config.captures_stderr() {
            let sink = setup.host_endpoint(host.stderr)?;
            let (write_end, state, task) = spawn_output(&runtime, "stderr", sink, &barrier, &span)?;
            setup.pumps.push(("stderr", task));
            stderr_state = Some(state);
            child_stderr = Some(write_end);
        }

        let setup = ScopeGuard::into_inner(setup);
        tracing::info!(
            tty = config.tty,
            interactive = config.interactive,
            detach = config.detach,
            output_streams = barrier.target(),
            "Process I/O attached"
        );

        Ok(Self {
            id,
            config,
            phase: AtomicU8::new(AttachPhase::Attached as u8),
            child_stdin,
            child_stdout,
            child_stderr,
            terminal: setup.terminal,
            restores: setup.restores,
            pumps: setup.pumps,
            stdin_state,
            stdout_state,
            stderr_state,
            barrier,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> AttachConfig {
        self.config
    }

    pub fn phase(&self) -> AttachPhase {
        AttachPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn advance(&self, phase: AttachPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
        tracing::debug!(id = %self.id, "Attach phase: {:?}", phase);
    }

    /// The terminal in raw mode for this attach, if any.
    pub fn terminal(&self) -> Option<&TerminalSession> {
        self.terminal.as_deref()
    }

    pub fn output_streams(&self) -> usize {
        self.barrier.target()
    }

    pub fn barrier(&self) -> &CompletionBarrier {
        &self.barrier
    }

    pub fn stdin_state(&self) -> Option<watch::Receiver<StreamState>> {
        self.stdin_state.clone()
    }

    pub fn stdout_state(&self) -> Option<watch::Receiver<StreamState>> {
        self.stdout_state.clone()
    }

    pub fn stderr_state(&self) -> Option<watch::Receiver<StreamState>> {
        self.stderr_state.clone()
    }

    /// Child-side ends as `[stdin, stdout, stderr]`; `None` for streams
    /// that are not configured or already closed.
    pub fn stdio(&self) -> [Option<BorrowedFd<'_>>; 3] {
        [
            self.child_stdin.as_ref().map(|fd| fd.as_fd()),
            self.child_stdout.as_ref().map(|fd| fd.as_fd()),
            self.child_stderr.as_ref().map(|fd| fd.as_fd()),
        ]
    }

    /// Duplicate the child-side ends for a process spawner.
    ///
    /// The originals stay with this `ProcessIo` until
    /// [`close_after_start`](Self::close_after_start).
    pub fn command_stdio(&self) -> io::Result<ChildStdio> {
        let [stdin, stdout, stderr] = self.stdio();
        let dup = |fd: Option<BorrowedFd<'_>>| -> io::Result<Option<Stdio>> {
            fd.map(|fd| fd.try_clone_to_owned().map(Stdio::from))
                .transpose()
        };
        Ok(ChildStdio {
            stdin: dup(stdin)?,
            stdout: dup(stdout)?,
            stderr: dup(stderr)?,
        })
    }

    /// Close the child-side ends still held by the host so end-of-stream
    /// becomes observable once the child exits. Safe to call repeatedly.
    pub fn close_after_start(&mut self) {
        let closed = [
            self.child_stdin.take(),
            self.child_stdout.take(),
            self.child_stderr.take(),
        ]
        .into_iter()
        .flatten()
        .count();
        if self.phase() < AttachPhase::ClosingAfterStart {
            self.advance(AttachPhase::ClosingAfterStart);
        }
        tracing::debug!(id = %self.id, closed, "Closed child-side descriptors");
    }

    /// Wait until every captured output stream has drained.
    pub async fn wait(&self, timeout: Duration) -> Result<(), TimeoutError> {
        if self.phase() < AttachPhase::Draining {
            self.advance(AttachPhase::Draining);
        }
        let result = self.barrier.await_completion(timeout).await;
        if let Err(err) = &result {
            tracing::warn!(id = %self.id, "{}", err);
        }
        result
    }

    /// Release the host: stop any pump still running, restore the flags of
    /// host descriptors and reset the terminal. Idempotent.
    ///
    /// Call [`wait`](Self::wait) first; output still in flight when the
    /// pumps are stopped is dropped.
    pub fn close(&mut self) -> io::Result<()> {
        if self.phase() == AttachPhase::Closed {
            return Ok(());
        }

        for (stream, pump) in self.pumps.drain(..) {
            if !pump.is_finished() {
                tracing::debug!(id = %self.id, stream, "Stopping stream pump");
                pump.abort();
            }
        }
        for restore in self.restores.drain(..).rev() {
            restore.restore();
        }
        let result = match &self.terminal {
            Some(terminal) => terminal.reset(),
            None => Ok(()),
        };

        self.advance(AttachPhase::Closed);
        tracing::info!(id = %self.id, "Process I/O closed");
        result
    }
}

impl Drop for ProcessIo {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(id = %self.id, "Failed to restore terminal: {}", err);
        }
    }
}

impl PartialOrd for AttachPhase {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AttachPhase {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

fn open_pipe() -> Result<(OwnedFd, OwnedFd), SetupError> {
    Pipe::new()
        .and_then(Pipe::split)
        .map_err(SetupError::Pipe)
}

/// Create an output pipe and start draining its read end into `sink`.
///
/// Returns the child-side write end, the stream's state channel and an
/// abort handle. The sink endpoint stays open for as long as the pump runs.
fn spawn_output(
    runtime: &Handle,
    name: &'static str,
    sink: Endpoint,
    barrier: &CompletionBarrier,
    span: &tracing::Span,
) -> Result<(OwnedFd, watch::Receiver<StreamState>, AbortHandle), SetupError> {
    let (read_end, write_end) = open_pipe()?;
    let source = OsFile::from(read_end.as_fd());
    source.set_nonblocking().map_err(SetupError::NonBlocking)?;

    let pump = StreamPump::register(name, source, sink.os_file()).map_err(SetupError::Register)?;
    let state = pump.subscribe();
    let barrier = barrier.clone();
    let task = runtime.spawn(
        async move {
            pump.run(move |_| {
                drop(read_end);
                drop(sink);
                barrier.signal_one_stream_done();
            })
            .await;
        }
        .instrument(span.clone()),
    );
    Ok((write_end, state, task.abort_handle()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(tty: bool, interactive: bool, detach: bool) -> AttachConfig {
        AttachConfig {
            tty,
            interactive,
            detach,
        }
    }

    #[test]
    fn configuration_space_decides_captured_streams() {
        let cases = [
            // (tty, interactive, detach) -> (stdin, stdout, stderr, terminal)
            ((false, false, false), (false, true, true, false)),
            ((false, true, false), (true, true, false, false)),
            ((false, false, true), (false, false, false, false)),
            ((true, true, false), (true, true, false, true)),
            ((true, false, false), (false, true, false, false)),
            ((true, true, true), (true, false, false, true)),
        ];
        for ((tty, interactive, detach), (stdin, stdout, stderr, terminal)) in cases {
            let c = config(tty, interactive, detach);
            assert_eq!(c.captures_stdin(), stdin, "{:?}", c);
            assert_eq!(c.captures_stdout(), stdout, "{:?}", c);
            assert_eq!(c.captures_stderr(), stderr, "{:?}", c);
            assert_eq!(c.uses_terminal(), terminal, "{:?}", c);
            assert_eq!(
                c.output_streams(),
                usize::from(stdout) + usize::from(stderr),
                "{:?}",
                c
            );
        }
    }

    #[test]
    fn create_outside_runtime_fails() {
        let err = ProcessIo::create_with(config(false, false, false), HostStdio::default())
            .err()
            .expect("no runtime");
        assert!(matches!(err, SetupError::NoRuntime));
    }

    #[test]
    fn phases_are_ordered() {
        assert!(AttachPhase::Configuring < AttachPhase::Attached);
        assert!(AttachPhase::Attached < AttachPhase::ClosingAfterStart);
        assert!(AttachPhase::ClosingAfterStart < AttachPhase::Draining);
        assert!(AttachPhase::Draining < AttachPhase::Closed);
        assert_eq!(AttachPhase::from_u8(3), AttachPhase::Draining);
    }

    #[tokio::test]
    async fn missing_terminal_device_rolls_back() {
        let host_in = Pipe::new().unwrap();
        let stdin = OsFile::from(host_in.read_end().unwrap());
        let host = HostStdio {
            stdin,
            terminal_device: Some(PathBuf::from("/nonexistent/tty")),
            ..HostStdio::default()
        };

        let err = ProcessIo::create_with(config(true, true, false), host)
            .err()
            .expect("terminal setup fails");
        assert!(matches!(err, SetupError::Terminal(_)));
        assert!(!stdin.is_nonblocking().unwrap());
    }

    #[tokio::test]
    async fn close_restores_host_descriptor_flags() {
        let host_in = Pipe::new().unwrap();
        let host_out = Pipe::new().unwrap();
        let host_err = Pipe::new().unwrap();
        let stdin = OsFile::from(host_in.read_end().unwrap());
        let stdout = OsFile::from(host_out.write_end().unwrap());
        let stderr = OsFile::from(host_err.write_end().unwrap());
        let host = HostStdio {
            stdin,
            stdout,
            stderr,
            terminal_device: None,
        };

        let mut io = ProcessIo::create_with(config(false, true, false), host).unwrap();
        assert!(stdin.is_nonblocking().unwrap());
        assert!(stdout.is_nonblocking().unwrap());
        assert!(!stderr.is_nonblocking().unwrap());
        assert_eq!(io.phase(), AttachPhase::Attached);

        io.close().unwrap();
        assert!(!stdin.is_nonblocking().unwrap());
        assert!(!stdout.is_nonblocking().unwrap());
        assert_eq!(io.phase(), AttachPhase::Closed);
        io.close().unwrap();
    }

    #[tokio::test]
    async fn flags_shared_by_two_host_streams_come_back_unchanged() {
        // stdout and stderr as copies of one descriptor, like `2>&1`.
        let host_out = Pipe::new().unwrap();
        let stdout = OsFile::from(host_out.write_end().unwrap());
        let copy = host_out.write_end().unwrap().try_clone_to_owned().unwrap();
        let stderr = OsFile::from(copy.as_fd());
        let host = HostStdio {
            stdout,
            stderr,
            ..HostStdio::default()
        };

        let mut io = ProcessIo::create_with(config(false, false, false), host).unwrap();
        assert!(stderr.is_nonblocking().unwrap());
        io.close().unwrap();
        assert!(!stdout.is_nonblocking().unwrap());
        assert!(!stderr.is_nonblocking().unwrap());
    }
}
