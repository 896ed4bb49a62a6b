//! Socket I/O primitive.
//!
//! A single-owner wrapper around one connected descriptor. Knows nothing
//! about HTTP; the reactor and router drive it. Reads never block; the
//! vectored-write loop may poll this one descriptor for writability when
//! the send buffer fills mid-response.

use std::io::{self, IoSlice};
use std::os::unix::io::RawFd;

/// One non-blocking read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were read.
    Data(usize),
    /// No data available right now; wait for the next readiness event.
    WouldBlock,
    /// Clean peer close. Not an error, but the caller must close.
    Closed,
}

/// Result of draining a connection before recycling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drained {
    /// Drained to would-block; the descriptor must be rearmed.
    Rearm,
    /// The peer closed while draining; the connection must close.
    Closed,
}

/// Number of iovec entries the kernel accepts per writev call.
const MAX_IOV: usize = 1024;

/// Owned socket handle.
///
/// `close` performs a bidirectional shutdown followed by descriptor close.
/// It is idempotent and guaranteed to run on every exit path via `Drop`.
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
}

impl Socket {
    /// Take ownership of an already-connected descriptor.
    pub fn from_raw(fd: RawFd) -> Self {
        Self { fd }
    }

    pub fn raw(&self) -> RawFd {
        self.fd
    }

    /// Switch the descriptor to non-blocking mode.
    pub fn set_nonblocking(&self) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let rc = unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Disable Nagle's algorithm.
    pub fn set_nodelay(&self) -> io::Result<()> {
        let opt: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &opt as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// One non-blocking read attempt into `buf`.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        loop {
            let n = unsafe {
                libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n > 0 {
                return Ok(ReadOutcome::Data(n as usize));
            }
            if n == 0 {
                return Ok(ReadOutcome::Closed);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return Ok(ReadOutcome::WouldBlock),
                io::ErrorKind::Interrupted => {}
                _ => return Err(err),
            }
        }
    }

    /// Vectored write of every byte in `bufs`, in order, exactly once.
    /// Partial writes are retried automatically; non-retryable errors
    /// propagate.
    pub fn write_vectored_all(&self, bufs: &mut [IoSlice<'_>]) -> io::Result<()> {
        let fd = self.fd;
        write_all_with(bufs, |chunk| loop {
            let n = unsafe {
                libc::writev(
                    fd,
                    chunk.as_ptr() as *const libc::iovec,
                    chunk.len().min(MAX_IOV) as libc::c_int,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => wait_writable(fd)?,
                io::ErrorKind::Interrupted => {}
                _ => return Err(err),
            }
        })
    }

    /// Drain readable bytes into a scratch buffer until would-block (rearm)
    /// or peer close. Used before recycling a keep-alive connection whose
    /// request body was not fully read.
    pub fn flush_until_blocked(&self) -> io::Result<Drained> {
        let mut scratch = [0u8; 4096];
        loop {
            match self.read(&mut scratch)? {
                ReadOutcome::Data(_) => {}
                ReadOutcome::WouldBlock => return Ok(Drained::Rearm),
                ReadOutcome::Closed => return Ok(Drained::Closed),
            }
        }
    }

    /// Bidirectional shutdown followed by descriptor close. Idempotent.
    pub fn close(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::shutdown(self.fd, libc::SHUT_RDWR);
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

/// Block until `fd` reports writable. Bounded to this one descriptor; the
/// reactor's other connections are unaffected.
fn wait_writable(fd: RawFd) -> io::Result<()> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, -1) };
        if rc > 0 {
            return Ok(());
        }
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

/// Write every byte of `bufs` through `write_once`, advancing across
/// partial writes. Factored out so the retry loop can be exercised against
/// a simulated short-write primitive.
pub(crate) fn write_all_with<'a, F>(mut bufs: &mut [IoSlice<'a>], mut write_once: F) -> io::Result<()>
where
    F: FnMut(&[IoSlice<'a>]) -> io::Result<usize>,
{
    let mut remaining: usize = bufs.iter().map(|b| b.len()).sum();
    while remaining > 0 {
        let n = write_once(bufs)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "socket accepted no bytes",
            ));
        }
        if n > remaining {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "write claimed more bytes than offered",
            ));
        }
        remaining -= n;
        IoSlice::advance_slices(&mut bufs, n);
    }
    Ok(())
}
