use std::fs::{File, OpenOptions};
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use parking_lot::Mutex;

use super::guard;
use crate::io::OsFile;

/// Exclusive raw-mode control over a terminal device for one attach.
///
/// The attributes found at acquisition are saved once and put back by
/// [`reset`](Self::reset), which also runs on drop and from the panic hook,
/// so the host terminal never stays raw past the attach.
pub struct TerminalSession {
    file: File,
    original: libc::termios,
    raw: Mutex<bool>,
}

impl TerminalSession {
    /// Acquire the controlling terminal of this process.
    ///
    /// Opens `/dev/tty` so the session gets its own open file description
    /// (flag changes on host stdin do not leak into it). Falls back to a
    /// duplicate of stdin when `/dev/tty` cannot be opened but stdin is a
    /// terminal.
    pub fn acquire() -> io::Result<Self> {
        match Self::open("/dev/tty") {
            Ok(session) => Ok(session),
            Err(err) => {
                if !OsFile::stdin().is_terminal() {
                    return Err(err);
                }
                let fd = unsafe { libc::fcntl(libc::STDIN_FILENO, libc::F_DUPFD_CLOEXEC, 0) };
                if fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                Self::from_file(unsafe { File::from_raw_fd(fd) })
            }
        }
    }

    /// Acquire an explicit terminal device, e.g. the slave side of a pty.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(path)?;
        Self::from_file(file)
    }

    pub fn from_file(file: File) -> io::Result<Self> {
        let original = get_attributes(file.as_raw_fd())?;
        Ok(Self {
            file,
            original,
            raw: Mutex::new(false),
        })
    }

    /// The terminal device, usable as a pump sink.
    pub fn os_file(&self) -> OsFile {
        OsFile::from_raw_fd(self.file.as_raw_fd())
    }

    pub fn is_raw(&self) -> bool {
        *self.raw.lock()
    }

    /// Attributes saved when the session was acquired.
    pub fn original_attributes(&self) -> &libc::termios {
        &self.original
    }

    /// Attributes the device currently has.
    pub fn attributes(&self) -> io::Result<libc::termios> {
        get_attributes(self.file.as_raw_fd())
    }

    /// Switch to character-at-a-time input with echo and line editing off.
    pub fn set_raw(&self) -> io::Result<()> {
        let mut raw = self.raw.lock();
        if *raw {
            return Ok(());
        }

        let mut attrs = self.original;
        unsafe { libc::cfmakeraw(&mut attrs) };
        set_attributes(self.file.as_raw_fd(), &attrs)?;
        guard::track(self.file.as_raw_fd(), self.original);
        *raw = true;
        tracing::debug!(fd = self.file.as_raw_fd(), "Terminal switched to raw mode");
        Ok(())
    }

    /// Put the saved attributes back. A no-op unless the session is raw.
    pub fn reset(&self) -> io::Result<()> {
        let mut raw = self.raw.lock();
        if !*raw {
            return Ok(());
        }

        set_attributes(self.file.as_raw_fd(), &self.original)?;
        guard::untrack(self.file.as_raw_fd());
        *raw = false;
        tracing::debug!(fd = self.file.as_raw_fd(), "Terminal attributes restored");
        Ok(())
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        if let Err(err) = self.reset() {
            tracing::warn!("Failed to restore terminal on drop: {}", err);
        }
    }
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("fd", &self.file.as_raw_fd())
            .field("raw", &self.is_raw())
            .finish()
    }
}

fn get_attributes(fd: RawFd) -> io::Result<libc::termios> {
    let mut attrs = MaybeUninit::<libc::termios>::uninit();
    if unsafe { libc::tcgetattr(fd, attrs.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { attrs.assume_init() })
}

fn set_attributes(fd: RawFd, attrs: &libc::termios) -> io::Result<()> {
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, attrs) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
