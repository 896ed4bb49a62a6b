//! Connection reactor primitives: the kernel event queue and the wake pipe.
//!
//! One `Poller` per worker. Connection descriptors are registered
//! edge-triggered one-shot: after each delivered event the descriptor is
//! disarmed until `rearm`, which applies the same interest mask every time.
//! A connection that is never rearmed stalls silently, so the worker treats
//! a rearm failure as fatal to that connection.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Identifies the registration that produced an event.
pub type Token = u64;

/// Reserved token for the worker's wake pipe.
pub const WAKE_TOKEN: Token = u64::MAX;

/// Reserved token for the worker's listener.
pub const LISTENER_TOKEN: Token = u64::MAX - 1;

/// Interest mask for connection descriptors: readable, edge-triggered,
/// one-shot, peer-hangup aware. Rearm always re-applies exactly this mask.
const CONN_MASK: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32
    | libc::EPOLLET as u32
    | libc::EPOLLONESHOT as u32;

/// One delivered readiness event.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: Token,
    pub readable: bool,
    /// Peer hung up or the descriptor errored.
    pub hangup: bool,
}

/// Reusable event buffer for [`Poller::wait`].
pub struct Events {
    buf: Vec<libc::epoll_event>,
    count: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            count: 0,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.buf[..self.count].iter().map(|e| Event {
            token: e.u64,
            readable: e.events & (libc::EPOLLIN as u32) != 0,
            hangup: e.events
                & ((libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32)
                != 0,
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Kernel event-queue handle.
#[derive(Debug)]
pub struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epfd })
    }

    /// Register a connection descriptor, edge-triggered one-shot.
    pub fn register(&self, fd: RawFd, token: Token) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, CONN_MASK, token)
    }

    /// Re-enable a one-shot registration with the same interest mask. If
    /// the descriptor is already readable again this delivers a fresh
    /// event, so pipelined bytes are never lost.
    pub fn rearm(&self, fd: RawFd, token: Token) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, CONN_MASK, token)
    }

    /// Register a descriptor level-triggered (wake pipe, listeners).
    pub fn register_level(&self, fd: RawFd, token: Token) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, libc::EPOLLIN as u32, token)
    }

    /// Remove a registration. Every descriptor close is paired with this.
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mask: u32, token: Token) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: mask,
            u64: token,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until registered descriptors are ready or `timeout` elapses;
    /// `None` blocks indefinitely until readiness or a wake. Returns the
    /// number of delivered events. Interrupted waits retry; other failures
    /// are fatal to the owning worker.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = timeout.map_or(-1, |t| t.as_millis().min(i32::MAX as u128) as i32);
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.buf.as_mut_ptr(),
                    events.buf.len() as libc::c_int,
                    timeout_ms,
                )
            };
            if n >= 0 {
                events.count = n as usize;
                return Ok(events.count);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[derive(Debug)]
struct PipeFds {
    reader: RawFd,
    writer: RawFd,
}

impl Drop for PipeFds {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.reader);
            libc::close(self.writer);
        }
    }
}

/// Self-pipe wake channel.
///
/// The read end lives in the worker's poller; any thread holding a
/// [`Waker`] can interrupt an indefinite wait. Used for coordinated
/// shutdown and for dynamic-responder completion signalling.
#[derive(Debug)]
pub struct WakePipe {
    inner: Arc<PipeFds>,
}

impl WakePipe {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            inner: Arc::new(PipeFds {
                reader: fds[0],
                writer: fds[1],
            }),
        })
    }

    pub fn reader(&self) -> RawFd {
        self.inner.reader
    }

    /// Cloneable handle other threads use to wake this pipe's owner. The
    /// descriptors stay open while any waker is alive.
    pub fn waker(&self) -> Waker {
        Waker {
            inner: self.inner.clone(),
        }
    }

    /// Consume pending wake bytes after a wake event.
    pub fn drain(&self) {
        let mut scratch = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.inner.reader,
                    scratch.as_mut_ptr() as *mut libc::c_void,
                    scratch.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

/// Write end of a worker's wake pipe.
#[derive(Debug, Clone)]
pub struct Waker {
    inner: Arc<PipeFds>,
}

impl Waker {
    /// Interrupt the owning worker's wait. A full pipe already guarantees a
    /// pending wake, so would-block here is success.
    pub fn wake(&self) {
        let byte = 1u8;
        unsafe {
            libc::write(
                self.inner.writer,
                &byte as *const _ as *const libc::c_void,
                1,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::Socket;
    use std::io::IoSlice;

    fn socketpair() -> (Socket, Socket) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        (Socket::from_raw(fds[0]), Socket::from_raw(fds[1]))
    }

    fn send(socket: &Socket, bytes: &[u8]) {
        let mut segments = [IoSlice::new(bytes)];
        socket.write_vectored_all(&mut segments).unwrap();
    }

    #[test]
    fn test_oneshot_delivery_and_rearm() {
        let poller = Poller::new().unwrap();
        let (a, b) = socketpair();
        poller.register(a.raw(), 7).unwrap();

        let mut events = Events::with_capacity(8);
        assert_eq!(poller.wait(&mut events, Some(Duration::ZERO)).unwrap(), 0);

        send(&b, b"first");
        assert_eq!(
            poller.wait(&mut events, Some(Duration::from_secs(2))).unwrap(),
            1
        );
        let event = events.iter().next().unwrap();
        assert_eq!(event.token, 7);
        assert!(event.readable);

        // One-shot: more data arrives but the registration is disarmed.
        send(&b, b"second");
        assert_eq!(
            poller.wait(&mut events, Some(Duration::from_millis(50))).unwrap(),
            0
        );

        // Rearm re-applies the mask; pending readable data is re-reported.
        poller.rearm(a.raw(), 7).unwrap();
        assert_eq!(
            poller.wait(&mut events, Some(Duration::from_secs(2))).unwrap(),
            1
        );
        assert_eq!(events.iter().next().unwrap().token, 7);
    }

    #[test]
    fn test_hangup_reported() {
        let poller = Poller::new().unwrap();
        let (a, b) = socketpair();
        poller.register(a.raw(), 3).unwrap();

        let mut b = b;
        b.close();

        let mut events = Events::with_capacity(8);
        assert_eq!(
            poller.wait(&mut events, Some(Duration::from_secs(2))).unwrap(),
            1
        );
        assert!(events.iter().next().unwrap().hangup);
    }

    #[test]
    fn test_deregister_stops_delivery() {
        let poller = Poller::new().unwrap();
        let (a, b) = socketpair();
        poller.register(a.raw(), 5).unwrap();
        poller.deregister(a.raw()).unwrap();

        send(&b, b"ignored");
        let mut events = Events::with_capacity(8);
        assert_eq!(
            poller.wait(&mut events, Some(Duration::from_millis(50))).unwrap(),
            0
        );
    }

    #[test]
    fn test_wake_pipe_interrupts_wait() {
        let poller = Poller::new().unwrap();
        let wake = WakePipe::new().unwrap();
        poller.register_level(wake.reader(), WAKE_TOKEN).unwrap();

        let waker = wake.waker();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake();
        });

        let mut events = Events::with_capacity(8);
        // Indefinite wait, interrupted only by the wake channel.
        assert_eq!(poller.wait(&mut events, None).unwrap(), 1);
        assert_eq!(events.iter().next().unwrap().token, WAKE_TOKEN);
        wake.drain();
        handle.join().unwrap();

        // Drained: no further events pending.
        assert_eq!(poller.wait(&mut events, Some(Duration::ZERO)).unwrap(), 0);
    }
}
