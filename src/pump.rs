//! Readiness-driven byte pump between two descriptors.
//!
//! Each stream gets one tokio task. The task waits for the source to become
//! readable, drains it into a page-sized buffer and writes what it read to
//! the sink, waiting for the sink to become writable whenever it is full.
//! Both ends are non-blocking, so a slow sink parks the task instead of the
//! runtime thread. Because one task owns one stream, activations of the
//! same stream never overlap and bytes keep the order they were read in.

use std::io;
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::watch;

use crate::io::{page_size, IoAction, OsFile};

/// Retry interval for descriptors the reactor refuses to watch (regular
/// files, `/dev/null`). Such descriptors never report `WouldBlock` in
/// practice.
const UNREGISTERED_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Why a stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTerminal {
    Eof,
    BrokenPipe,
    Error(i32),
    /// The pump was stopped (or dropped) before the stream ended.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Streaming,
    Drained(StreamTerminal),
}

impl StreamState {
    pub fn is_drained(&self) -> bool {
        matches!(self, Self::Drained(_))
    }
}

enum Readiness {
    Reactor(AsyncFd<OsFile>),
    Unregistered(OsFile),
}

impl Readiness {
    fn register(stream: &'static str, file: OsFile, interest: Interest) -> io::Result<Self> {
        match AsyncFd::with_interest(file, interest) {
            Ok(fd) => Ok(Self::Reactor(fd)),
            Err(err) if err.raw_os_error() == Some(libc::EPERM) => {
                tracing::debug!(stream, fd = file.fd(), "Descriptor not pollable, retrying on a timer");
                Ok(Self::Unregistered(file))
            }
            Err(err) => Err(err),
        }
    }

    /// Read as soon as the source has data. Never returns `(0, WouldBlock)`.
    async fn read(&self, buf: &mut [u8]) -> (usize, IoAction) {
        loop {
            let (n, action) = match self {
                Self::Reactor(fd) => {
                    let mut ready = match fd.readable().await {
                        Ok(ready) => ready,
                        Err(err) => return (0, IoAction::Error(errno(&err))),
                    };
                    let result = fd.get_ref().read(buf);
                    if result.1 == IoAction::WouldBlock {
                        ready.clear_ready();
                    }
                    result
                }
                Self::Unregistered(file) => file.read(buf),
            };

            if n > 0 || action != IoAction::WouldBlock {
                return (n, action);
            }
            if let Self::Unregistered(_) = self {
                tokio::time::sleep(UNREGISTERED_POLL_INTERVAL).await;
            }
        }
    }

    /// Write all of `buf`, waiting for writability whenever the sink is
    /// full. Returns `Success` only once every byte is out.
    async fn write_all(&self, buf: &[u8]) -> (usize, IoAction) {
        let mut written = 0;
        loop {
            let (n, action) = match self {
                Self::Reactor(fd) => {
                    let mut ready = match fd.writable().await {
                        Ok(ready) => ready,
                        Err(err) => return (written, IoAction::Error(errno(&err))),
                    };
                    let result = fd.get_ref().write(&buf[written..]);
                    if result.1 == IoAction::WouldBlock {
                        ready.clear_ready();
                    }
                    result
                }
                Self::Unregistered(file) => file.write(&buf[written..]),
            };
            written += n;

            if action != IoAction::WouldBlock {
                return (written, action);
            }
            if let Self::Unregistered(_) = self {
                tokio::time::sleep(UNREGISTERED_POLL_INTERVAL).await;
            }
        }
    }
}

/// Publishes the state of one stream. A pump dropped before it finished
/// still reports `Drained(Cancelled)`.
struct StatePublisher(watch::Sender<StreamState>);

impl StatePublisher {
    fn publish(&self, state: StreamState) {
        self.0.send_replace(state);
    }
}

impl Drop for StatePublisher {
    fn drop(&mut self) {
        self.0.send_if_modified(|state| {
            if state.is_drained() {
                return false;
            }
            *state = StreamState::Drained(StreamTerminal::Cancelled);
            true
        });
    }
}

/// One direction of byte forwarding, from registration until drain.
pub struct StreamPump {
    name: &'static str,
    source: Readiness,
    sink: Readiness,
    buffer: Vec<u8>,
    state: StatePublisher,
}

impl StreamPump {
    /// Register `source` for read readiness and `sink` for write readiness
    /// with the current runtime.
    ///
    /// Must be called from within a tokio runtime. Both descriptors should
    /// already be in non-blocking mode.
    pub fn register(name: &'static str, source: OsFile, sink: OsFile) -> io::Result<Self> {
        let source = Readiness::register(name, source, Interest::READABLE)?;
        let sink = Readiness::register(name, sink, Interest::WRITABLE)?;
        let (state, _) = watch::channel(StreamState::Idle);

        Ok(Self {
            name,
            source,
            sink,
            buffer: vec![0u8; page_size()],
            state: StatePublisher(state),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.state.0.subscribe()
    }

    /// Pump until the stream drains, then tear down in order: deregister
    /// both descriptors, release the buffer, run `on_done`, publish
    /// `Drained`.
    pub async fn run<F>(self, on_done: F) -> StreamTerminal
    where
        F: FnOnce(StreamTerminal),
    {
        let Self {
            name,
            source,
            sink,
            mut buffer,
            state,
        } = self;

        state.publish(StreamState::Streaming);
        tracing::debug!(stream = name, "Stream pump started");

        let terminal = pump(&source, &sink, &mut buffer).await;
        drop(source);
        drop(sink);
        drop(buffer);

        on_done(terminal);

        match terminal {
            StreamTerminal::Error(errno) => tracing::warn!(
                stream = name,
                "Stream stopped on error: {}",
                io::Error::from_raw_os_error(errno)
            ),
            _ => tracing::debug!(stream = name, ?terminal, "Stream drained"),
        }
        state.publish(StreamState::Drained(terminal));
        terminal
    }
}

async fn pump(source: &Readiness, sink: &Readiness, buf: &mut [u8]) -> StreamTerminal {
    loop {
        let (read, action) = source.read(buf).await;
        if read > 0 {
            let (_, written) = sink.write_all(&buf[..read]).await;
            if let Some(terminal) = stream_end(written) {
                return terminal;
            }
        }
        if let Some(terminal) = stream_end(action) {
            return terminal;
        }
    }
}

fn stream_end(action: IoAction) -> Option<StreamTerminal> {
    match action {
        IoAction::Success | IoAction::WouldBlock => None,
        IoAction::Eof => Some(StreamTerminal::Eof),
        IoAction::BrokenPipe => Some(StreamTerminal::BrokenPipe),
        IoAction::Error(errno) => Some(StreamTerminal::Error(errno)),
    }
}

fn errno(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::Pipe;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Ends {
        pipe: Pipe,
        reader: OsFile,
        writer: OsFile,
    }

    fn pipe() -> Ends {
        let pipe = Pipe::new().unwrap();
        let reader = OsFile::from(pipe.read_end().unwrap());
        let writer = OsFile::from(pipe.write_end().unwrap());
        reader.set_nonblocking().unwrap();
        writer.set_nonblocking().unwrap();
        Ends {
            pipe,
            reader,
            writer,
        }
    }

    /// Everything currently buffered in a non-blocking pipe.
    fn drain(reader: OsFile) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (n, action) = reader.read(&mut buf);
            out.extend_from_slice(&buf[..n]);
            if action != IoAction::Success {
                return out;
            }
        }
    }

    #[tokio::test]
    async fn run_drains_and_calls_back_once() {
        let mut src = pipe();
        let dst = pipe();
        let pump = StreamPump::register("test", src.reader, dst.writer).unwrap();
        let mut state = pump.subscribe();
        assert_eq!(*state.borrow(), StreamState::Idle);

        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        let task = tokio::spawn(pump.run(move |terminal| {
            assert_eq!(terminal, StreamTerminal::Eof);
            assert!(!flag.swap(true, Ordering::SeqCst));
        }));

        src.writer.write(b"first ");
        src.writer.write(b"second");
        src.pipe.close_write();

        let terminal = task.await.unwrap();
        assert_eq!(terminal, StreamTerminal::Eof);
        assert!(called.load(Ordering::SeqCst));
        state.changed().await.ok();
        assert_eq!(*state.borrow(), StreamState::Drained(StreamTerminal::Eof));
        assert_eq!(drain(dst.reader), b"first second");
    }

    #[tokio::test]
    async fn stops_when_sink_is_gone() {
        let src = pipe();
        let mut dst = pipe();
        dst.pipe.close_read();
        src.writer.write(b"nobody listens");

        let pump = StreamPump::register("test", src.reader, dst.writer).unwrap();
        assert_eq!(pump.run(|_| {}).await, StreamTerminal::BrokenPipe);
    }

    #[tokio::test]
    async fn full_sink_parks_the_stream_until_writable() {
        let mut src = pipe();
        let dst = pipe();
        let filler = vec![0u8; 64 * 1024];
        let mut filled = 0;
        loop {
            let (n, action) = dst.writer.write(&filler);
            filled += n;
            if action != IoAction::Success {
                break;
            }
        }

        let pump = StreamPump::register("test", src.reader, dst.writer).unwrap();
        let mut state = pump.subscribe();
        let task = tokio::spawn(pump.run(|_| {}));
        src.writer.write(b"overflow");
        src.pipe.close_write();

        // The runtime stays free while the sink is full.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*state.borrow_and_update(), StreamState::Streaming);

        let mut received = drain(dst.reader);
        assert_eq!(task.await.unwrap(), StreamTerminal::Eof);
        received.extend(drain(dst.reader));
        assert_eq!(received.len(), filled + 8);
        assert!(received.ends_with(b"overflow"));
    }

    #[tokio::test]
    async fn aborted_pump_reports_cancelled() {
        let src = pipe();
        let dst = pipe();
        let pump = StreamPump::register("test", src.reader, dst.writer).unwrap();
        let mut state = pump.subscribe();

        let task = tokio::spawn(pump.run(|_| panic!("not reached")));
        state
            .wait_for(|state| *state == StreamState::Streaming)
            .await
            .unwrap();
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(
            *state.borrow(),
            StreamState::Drained(StreamTerminal::Cancelled)
        );
    }

    #[tokio::test]
    async fn dropped_pump_reports_cancelled() {
        let src = pipe();
        let dst = pipe();
        let pump = StreamPump::register("test", src.reader, dst.writer).unwrap();
        let state = pump.subscribe();
        drop(pump);
        assert_eq!(
            *state.borrow(),
            StreamState::Drained(StreamTerminal::Cancelled)
        );
    }

    #[tokio::test]
    async fn unpollable_source_still_drains() {
        let mut file = tempfile::tempfile().unwrap();
        std::io::Write::write_all(&mut file, b"from a file").unwrap();
        std::io::Seek::rewind(&mut file).unwrap();
        let source = OsFile::from_raw_fd(std::os::fd::AsRawFd::as_raw_fd(&file));
        let dst = pipe();

        let pump = StreamPump::register("file", source, dst.writer).unwrap();
        assert_eq!(pump.run(|_| {}).await, StreamTerminal::Eof);
        assert_eq!(drain(dst.reader), b"from a file");
    }

    #[tokio::test]
    async fn unpollable_sink_still_receives() {
        let mut src = pipe();
        let mut file = tempfile::tempfile().unwrap();
        let sink = OsFile::from_raw_fd(std::os::fd::AsRawFd::as_raw_fd(&file));

        src.writer.write(b"into a file");
        src.pipe.close_write();
        let pump = StreamPump::register("file", src.reader, sink).unwrap();
        assert_eq!(pump.run(|_| {}).await, StreamTerminal::Eof);

        let mut out = String::new();
        std::io::Seek::rewind(&mut file).unwrap();
        std::io::Read::read_to_string(&mut file, &mut out).unwrap();
        assert_eq!(out, "into a file");
    }
}
