//! Per-connection state and the worker's connection slot arena.

use crate::socket::{ReadOutcome, Socket};
use std::io;

/// Connection slot lifecycle. A slot is `Registered` whenever its
/// descriptor is armed in the poller, `Handling` while the router owns the
/// request, `Awaiting` while user logic runs on the scheduler. `Closing` is
/// the only exit and couples deregistration with descriptor close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Registered,
    Handling,
    Awaiting,
    Closing,
}

/// Result of draining readable bytes into the connection buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// Socket drained; wait for the next readiness event.
    WouldBlock,
    /// Peer closed its write side.
    Closed,
    /// The buffer hit its cap without a complete request.
    Overflow,
}

/// Read chunk size for connection fills.
const CHUNK: usize = 4096;

/// Upper bound on buffered request bytes per connection.
pub const MAX_BUFFER: usize = 1024 * 1024;

/// One accepted connection: descriptor plus buffered request bytes.
/// Exclusively owned by the reactor slot it occupies; the router borrows it
/// for one request at a time.
#[derive(Debug)]
pub struct Connection {
    pub socket: Socket,
    pub buf: Vec<u8>,
    pub state: ConnState,
    /// Unread body bytes remain on the socket; drain before rearming.
    pub needs_drain: bool,
    /// Close once the in-flight response is written.
    pub close_after_response: bool,
}

impl Connection {
    pub fn new(socket: Socket) -> Self {
        Self {
            socket,
            buf: Vec::with_capacity(CHUNK),
            state: ConnState::Registered,
            needs_drain: false,
            close_after_response: false,
        }
    }

    /// Drain readable bytes into the buffer until would-block or peer
    /// close (edge-triggered notification requires reading to exhaustion).
    pub fn fill(&mut self) -> io::Result<Fill> {
        let mut chunk = [0u8; CHUNK];
        loop {
            if self.buf.len() >= MAX_BUFFER {
                return Ok(Fill::Overflow);
            }
            match self.socket.read(&mut chunk)? {
                ReadOutcome::Data(n) => self.buf.extend_from_slice(&chunk[..n]),
                ReadOutcome::WouldBlock => return Ok(Fill::WouldBlock),
                ReadOutcome::Closed => return Ok(Fill::Closed),
            }
        }
    }

    /// Discard `n` consumed bytes from the front of the buffer.
    pub fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
    }
}

/// Fixed-capacity connection arena with a free list. Slot indexes double as
/// poller tokens; generations guard late completions against slot reuse.
#[derive(Debug)]
pub struct ConnSlab {
    slots: Vec<Option<Connection>>,
    generations: Vec<u64>,
    free: Vec<usize>,
}

impl ConnSlab {
    pub fn new(max: usize) -> Self {
        Self {
            slots: (0..max).map(|_| None).collect(),
            generations: vec![0; max],
            free: (0..max).rev().collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim a slot for a new connection. `None` when the arena is full.
    pub fn alloc(&mut self, conn: Connection) -> Option<usize> {
        let index = self.free.pop()?;
        self.slots[index] = Some(conn);
        Some(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Connection> {
        self.slots.get_mut(index)?.as_mut()
    }

    pub fn generation(&self, index: usize) -> u64 {
        self.generations.get(index).copied().unwrap_or(0)
    }

    /// Release a slot, bumping its generation so in-flight completions for
    /// the old occupant are ignored.
    pub fn free(&mut self, index: usize) -> Option<Connection> {
        let conn = self.slots.get_mut(index)?.take();
        if conn.is_some() {
            self.generations[index] += 1;
            self.free.push(index);
        }
        conn
    }

    pub fn active(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::IoSlice;
    use std::os::unix::io::RawFd;

    fn socketpair() -> (Socket, Socket) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        (Socket::from_raw(fds[0]), Socket::from_raw(fds[1]))
    }

    #[test]
    fn test_fill_accumulates_until_would_block() {
        let (a, b) = socketpair();
        a.set_nonblocking().unwrap();
        let mut conn = Connection::new(a);

        let mut segments = [IoSlice::new(&b"GET / HTTP/1.1\r\n"[..])];
        b.write_vectored_all(&mut segments).unwrap();

        assert_eq!(conn.fill().unwrap(), Fill::WouldBlock);
        assert_eq!(conn.buf, b"GET / HTTP/1.1\r\n");

        conn.consume(4);
        assert_eq!(conn.buf, b"/ HTTP/1.1\r\n");
    }

    #[test]
    fn test_fill_reports_peer_close() {
        let (a, b) = socketpair();
        a.set_nonblocking().unwrap();
        let mut conn = Connection::new(a);
        drop(b);
        assert_eq!(conn.fill().unwrap(), Fill::Closed);
    }

    #[test]
    fn test_slab_alloc_free_generations() {
        let (a, _keep_a) = socketpair();
        let (b, _keep_b) = socketpair();
        let mut slab = ConnSlab::new(2);

        let first = slab.alloc(Connection::new(a)).unwrap();
        let second = slab.alloc(Connection::new(b)).unwrap();
        assert_ne!(first, second);
        assert_eq!(slab.active(), 2);

        let (c, _keep_c) = socketpair();
        assert!(slab.alloc(Connection::new(c)).is_none());

        let generation = slab.generation(first);
        assert!(slab.free(first).is_some());
        assert_eq!(slab.generation(first), generation + 1);
        assert!(slab.free(first).is_none());
        assert_eq!(slab.active(), 1);

        let (d, _keep_d) = socketpair();
        assert_eq!(slab.alloc(Connection::new(d)), Some(first));
    }
}
