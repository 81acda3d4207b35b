use std::io;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// An anonymous pipe whose ends are handed out or closed exactly once.
///
/// Both ends are close-on-exec, so a spawned child only sees the end that
/// was explicitly placed on its stdio.
#[derive(Debug)]
pub struct Pipe {
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
}

impl Pipe {
    pub fn new() -> io::Result<Self> {
        let [read, write] = open_pipe()?;
        Ok(Self {
            read: Some(unsafe { OwnedFd::from_raw_fd(read) }),
            write: Some(unsafe { OwnedFd::from_raw_fd(write) }),
        })
    }

    pub fn read_end(&self) -> Option<BorrowedFd<'_>> {
        self.read.as_ref().map(|fd| fd.as_fd())
    }

    pub fn write_end(&self) -> Option<BorrowedFd<'_>> {
        self.write.as_ref().map(|fd| fd.as_fd())
    }

    pub fn take_read(&mut self) -> Option<OwnedFd> {
        self.read.take()
    }

    pub fn take_write(&mut self) -> Option<OwnedFd> {
        self.write.take()
    }

    /// Hand out both ends at once as `(read, write)`.
    pub fn split(mut self) -> io::Result<(OwnedFd, OwnedFd)> {
        match (self.read.take(), self.write.take()) {
            (Some(read), Some(write)) => Ok((read, write)),
            _ => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "pipe end already released",
            )),
        }
    }

    /// Close the read end. Returns `false` if it was already gone.
    pub fn close_read(&mut self) -> bool {
        self.read.take().is_some()
    }

    /// Close the write end. Returns `false` if it was already gone.
    pub fn close_write(&mut self) -> bool {
        self.write.take().is_some()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn open_pipe() -> io::Result<[RawFd; 2]> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(fds)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn open_pipe() -> io::Result<[RawFd; 2]> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    for fd in fds {
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(err);
        }
    }
    Ok(fds)
}
