use std::ffi::{CStr, OsStr};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;

/// Outcome of a single bounded read or write on an [`OsFile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoAction {
    /// Every requested byte was transferred.
    Success,
    /// The descriptor is not ready; retry on the next readiness event.
    WouldBlock,
    /// The peer closed its end (zero-byte read).
    Eof,
    /// The reader of a pipe went away (zero-byte write or `EPIPE`).
    BrokenPipe,
    /// Any other OS error, carrying the errno.
    Error(i32),
}

/// A raw OS file descriptor.
///
/// `OsFile` never closes the descriptor on drop; use [`OsFile::close`] to
/// release it explicitly. Copies alias the same descriptor number, so the
/// caller is responsible for not using them concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsFile {
    fd: RawFd,
}

impl OsFile {
    pub const fn from_raw_fd(fd: RawFd) -> Self {
        Self { fd }
    }

    pub const fn stdin() -> Self {
        Self::from_raw_fd(libc::STDIN_FILENO)
    }

    pub const fn stdout() -> Self {
        Self::from_raw_fd(libc::STDOUT_FILENO)
    }

    pub const fn stderr() -> Self {
        Self::from_raw_fd(libc::STDERR_FILENO)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Current file status flags (`F_GETFL`).
    pub fn flags(&self) -> io::Result<libc::c_int> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(flags)
    }

    /// Replace the file status flags (`F_SETFL`).
    pub fn set_flags(&self, flags: libc::c_int) -> io::Result<()> {
        if unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn set_nonblocking(&self) -> io::Result<()> {
        let flags = self.flags()?;
        self.set_flags(flags | libc::O_NONBLOCK)
    }

    pub fn is_nonblocking(&self) -> io::Result<bool> {
        Ok(self.flags()? & libc::O_NONBLOCK != 0)
    }

    pub fn is_terminal(&self) -> bool {
        unsafe { libc::isatty(self.fd) == 1 }
    }

    /// Open the terminal behind this descriptor again.
    ///
    /// The result has its own open file description, so status flags set
    /// on it (`O_NONBLOCK`) stay off this descriptor and every copy the
    /// shell handed out alongside it.
    pub fn reopen_terminal(&self) -> io::Result<File> {
        let mut name = [0 as libc::c_char; 256];
        let rc = unsafe { libc::ttyname_r(self.fd, name.as_mut_ptr(), name.len()) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        let path = unsafe { CStr::from_ptr(name.as_ptr()) };
        OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(OsStr::from_bytes(path.to_bytes()))
    }

    /// Write the whole buffer, stopping early only when the descriptor
    /// would block or fails.
    ///
    /// Returns how many bytes were written on this call together with the
    /// outcome. `Success` is reported only once every byte is out.
    pub fn write(&self, buf: &[u8]) -> (usize, IoAction) {
        if buf.is_empty() {
            return (0, IoAction::Success);
        }

        let mut written = 0;
        while written < buf.len() {
            let remaining = &buf[written..];
            let n = unsafe {
                libc::write(
                    self.fd,
                    remaining.as_ptr().cast::<libc::c_void>(),
                    remaining.len(),
                )
            };
            if n < 0 {
                let errno = last_errno();
                if errno == libc::EINTR {
                    continue;
                }
                if errno == libc::EPIPE {
                    return (written, IoAction::BrokenPipe);
                }
                return (written, classify(errno));
            }
            if n == 0 {
                return (written, IoAction::BrokenPipe);
            }
            written += n as usize;
        }
        (written, IoAction::Success)
    }

    /// Read until the buffer is full, the descriptor would block, the peer
    /// hits end-of-stream, or an error occurs.
    pub fn read(&self, buf: &mut [u8]) -> (usize, IoAction) {
        if buf.is_empty() {
            return (0, IoAction::Success);
        }

        let mut filled = 0;
        while filled < buf.len() {
            let remaining = &mut buf[filled..];
            let n = unsafe {
                libc::read(
                    self.fd,
                    remaining.as_mut_ptr().cast::<libc::c_void>(),
                    remaining.len(),
                )
            };
            if n < 0 {
                let errno = last_errno();
                if errno == libc::EINTR {
                    continue;
                }
                return (filled, classify(errno));
            }
            if n == 0 {
                return (filled, IoAction::Eof);
            }
            filled += n as usize;
        }
        (filled, IoAction::Success)
    }

    /// Close the descriptor. Copies of this `OsFile` must not be used
    /// afterwards.
    pub fn close(self) -> io::Result<()> {
        if unsafe { libc::close(self.fd) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for OsFile {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl From<BorrowedFd<'_>> for OsFile {
    fn from(fd: BorrowedFd<'_>) -> Self {
        Self::from_raw_fd(fd.as_raw_fd())
    }
}

/// Size of one memory page, the capacity of every pump buffer.
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

fn last_errno() -> i32 {
    io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

// EIO shows up transiently on terminals whose foreground process group is
// changing; it is retried like EAGAIN.
fn classify(errno: i32) -> IoAction {
    if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::EIO {
        IoAction::WouldBlock
    } else {
        IoAction::Error(errno)
    }
}
