//! Server entry point and the per-worker reactor loop.
//!
//! One reactor per worker thread, each with its own kernel event queue,
//! connection arena, and wake pipe; connections never migrate between
//! workers. The inline path answers static routes on the reactor thread
//! with a vectored write and no allocation; dynamic work runs on the tokio
//! scheduler and reports back through a completion channel plus the wake
//! pipe, exactly once per request.

use crate::conn::{ConnSlab, ConnState, Connection, Fill};
use crate::parser::{self, HeaderOffsets, MAX_HEADERS};
use crate::poll::{Events, Poller, Token, WakePipe, Waker, LISTENER_TOKEN, WAKE_TOKEN};
use crate::request::Request;
use crate::responder::{DateCache, Responder};
use crate::router::Router;
use crate::socket::{Drained, Socket};
use crate::{Error, Result};
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket as BoundSocket, Type};
use std::collections::HashMap;
use std::io::{self, IoSlice};
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub hostname: String,
    pub port: u16,
    pub workers: usize,
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "0.0.0.0".to_string(),
            port: 3000,
            workers: num_cpus::get(),
            backlog: 1024,
        }
    }
}

/// Connection slots per worker reactor.
const MAX_CONNS: usize = 4096;
/// Event buffer capacity per wait call.
const EVENTS_CAPACITY: usize = 1024;

const REJECT_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\ncontent-type: text/plain\r\ncontent-length: 11\r\nconnection: close\r\n\r\nBad Request";
const REJECT_TOO_LARGE: &[u8] =
    b"HTTP/1.1 431 Request Header Fields Too Large\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";

/// Create a listening TCP socket with the options the reactors expect:
/// address and port reuse for per-worker listeners, no-delay, non-blocking.
pub fn create_listener(addr: &SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = BoundSocket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nodelay(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&(*addr).into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

/// Tracks live connections and the shutdown signal across workers.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    active: AtomicU64,
    shutting_down: AtomicBool,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn increment(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub fn decrement(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }

    /// Signal that shutdown is in progress; workers stop accepting.
    pub fn start_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

/// Outcome of a dynamic request cycle, sent back to the owning worker.
/// Exactly one completion is sent per dispatched request; it is the single
/// point at which the connection slot learns the cycle finished.
struct Completion {
    slot: usize,
    generation: u64,
    bytes: Option<Bytes>,
    close: bool,
}

/// Running server: one reactor per worker thread over already-bound
/// listeners, plus the scheduler dynamic work runs on.
pub struct Server {
    addr: SocketAddr,
    workers: Vec<JoinHandle<()>>,
    wakers: Vec<Waker>,
    tracker: Arc<ConnectionTracker>,
    runtime: tokio::runtime::Runtime,
}

impl Server {
    /// Bind per-worker listeners and start serving.
    pub fn bind(config: ServerConfig, router: Router) -> Result<Server> {
        let addr = (config.hostname.as_str(), config.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Reactor(format!("unresolvable host: {}", config.hostname)))?;
        let workers = config.workers.max(1);

        let first = create_listener(&addr, config.backlog)?;
        let bound = first.local_addr()?;
        let mut listeners = vec![first];
        for _ in 1..workers {
            listeners.push(create_listener(&bound, config.backlog)?);
        }
        Self::serve(listeners, router)
    }

    /// Start serving on already-bound listening descriptors with a finished
    /// router. This is the single core entry point: the boot surface owns
    /// how the listeners were produced. One worker reactor per listener.
    pub fn serve(listeners: Vec<TcpListener>, router: Router) -> Result<Server> {
        let first = listeners
            .first()
            .ok_or_else(|| Error::Reactor("no listeners supplied".to_string()))?;
        let addr = first.local_addr()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        let router = Arc::new(router);
        let tracker = Arc::new(ConnectionTracker::new());
        let date = DateCache::new();

        let mut workers = Vec::with_capacity(listeners.len());
        let mut wakers = Vec::with_capacity(listeners.len());
        for (index, listener) in listeners.into_iter().enumerate() {
            listener.set_nonblocking(true)?;
            let wake = WakePipe::new()?;
            wakers.push(wake.waker());
            let worker = Worker::new(
                index,
                listener,
                wake,
                router.clone(),
                tracker.clone(),
                runtime.handle().clone(),
                date.clone(),
            )?;
            workers.push(
                std::thread::Builder::new()
                    .name(format!("squall-worker-{index}"))
                    .spawn(move || worker.run())?,
            );
        }

        log::debug!("serving on {} with {} workers", addr, workers.len());
        Ok(Server {
            addr,
            workers,
            wakers,
            tracker,
            runtime,
        })
    }

    /// Address of the first listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Live connections across all workers.
    pub fn active_connections(&self) -> u64 {
        self.tracker.count()
    }

    /// Coordinated shutdown: wake every reactor, join the worker threads,
    /// then tear down the scheduler.
    pub fn shutdown(self) {
        self.tracker.start_shutdown();
        for waker in &self.wakers {
            waker.wake();
        }
        for worker in self.workers {
            let _ = worker.join();
        }
        drop(self.runtime);
    }
}

/// What to do with a slot after one processing step, decided while the
/// connection is borrowed and acted on after the borrow ends.
enum Step {
    Rearm,
    Close,
    Reject(&'static [u8]),
    Drain,
    Loop,
    Spawned,
}

struct Worker {
    index: usize,
    poller: Poller,
    wake: WakePipe,
    /// Owns the listening descriptor for this reactor's lifetime.
    _listener: TcpListener,
    listener_fd: RawFd,
    conns: ConnSlab,
    completions_tx: mpsc::Sender<Completion>,
    completions_rx: mpsc::Receiver<Completion>,
    router: Arc<Router>,
    tracker: Arc<ConnectionTracker>,
    handle: tokio::runtime::Handle,
    date: DateCache,
    offsets: HeaderOffsets,
}

impl Worker {
    fn new(
        index: usize,
        listener: TcpListener,
        wake: WakePipe,
        router: Arc<Router>,
        tracker: Arc<ConnectionTracker>,
        handle: tokio::runtime::Handle,
        date: DateCache,
    ) -> Result<Self> {
        let poller = Poller::new()?;
        poller.register_level(wake.reader(), WAKE_TOKEN)?;
        let listener_fd = listener.as_raw_fd();
        poller.register_level(listener_fd, LISTENER_TOKEN)?;
        let (completions_tx, completions_rx) = mpsc::channel();
        Ok(Self {
            index,
            poller,
            wake,
            _listener: listener,
            listener_fd,
            conns: ConnSlab::new(MAX_CONNS),
            completions_tx,
            completions_rx,
            router,
            tracker,
            handle,
            date,
            offsets: [0; MAX_HEADERS * 4],
        })
    }

    fn run(mut self) {
        log::debug!("worker {} reactor running", self.index);
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        while !self.tracker.is_shutting_down() {
            if let Err(err) = self.poller.wait(&mut events, None) {
                // Fatal to this worker; surfaced for the supervisor.
                log::error!("worker {}: reactor wait failed: {}", self.index, err);
                break;
            }
            for event in events.iter() {
                match event.token {
                    WAKE_TOKEN => {
                        self.wake.drain();
                        self.drain_completions();
                    }
                    LISTENER_TOKEN => self.accept_ready(),
                    token => self.service(token as usize, event.hangup),
                }
            }
        }
        self.teardown();
    }

    fn accept_ready(&mut self) {
        loop {
            let fd = unsafe {
                libc::accept4(
                    self.listener_fd,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => return,
                    io::ErrorKind::Interrupted => continue,
                    _ => {
                        log::warn!("worker {}: accept failed: {}", self.index, err);
                        return;
                    }
                }
            }
            let socket = Socket::from_raw(fd);
            if self.tracker.is_shutting_down() {
                continue;
            }
            if let Err(err) = socket.set_nodelay() {
                log::debug!("worker {}: nodelay failed: {}", self.index, err);
            }
            match self.conns.alloc(Connection::new(socket)) {
                Some(slot) => {
                    self.tracker.increment();
                    if let Err(err) = self.poller.register(fd, slot as Token) {
                        log::warn!("worker {}: register failed: {}", self.index, err);
                        if let Some(mut conn) = self.conns.free(slot) {
                            conn.socket.close();
                        }
                        self.tracker.decrement();
                    }
                }
                None => {
                    log::warn!("worker {}: connection table full, refusing", self.index);
                }
            }
        }
    }

    fn service(&mut self, slot: usize, hangup: bool) {
        let (fill, empty) = {
            let Some(conn) = self.conns.get_mut(slot) else {
                return;
            };
            if conn.state == ConnState::Awaiting {
                return;
            }
            conn.state = ConnState::Handling;
            match conn.fill() {
                Ok(fill) => (Some(fill), conn.buf.is_empty()),
                Err(err) => {
                    log::debug!("worker {}: read failed: {}", self.index, err);
                    (None, true)
                }
            }
        };
        let Some(fill) = fill else {
            self.close_slot(slot);
            return;
        };
        if hangup && empty {
            self.close_slot(slot);
            return;
        }
        self.process(slot, fill);
    }

    /// Handle as many buffered requests as possible, strictly in arrival
    /// order; each response is fully written before the next request is
    /// looked at.
    fn process(&mut self, slot: usize, fill: Fill) {
        loop {
            let generation = self.conns.generation(slot);
            let step = {
                let Some(conn) = self.conns.get_mut(slot) else {
                    return;
                };
                if conn.buf.is_empty() {
                    match fill {
                        Fill::Closed => Step::Close,
                        Fill::Overflow => Step::Reject(REJECT_TOO_LARGE),
                        Fill::WouldBlock => Step::Rearm,
                    }
                } else {
                    match parser::parse(&conn.buf, &mut self.offsets) {
                        Ok(None) => match fill {
                            Fill::WouldBlock => Step::Rearm,
                            Fill::Closed => Step::Close,
                            Fill::Overflow => Step::Reject(REJECT_TOO_LARGE),
                        },
                        Err(Error::HeadTooLarge { .. }) => Step::Reject(REJECT_TOO_LARGE),
                        Err(err) => {
                            log::debug!("worker {}: malformed request: {}", self.index, err);
                            Step::Reject(REJECT_BAD_REQUEST)
                        }
                        Ok(Some(parsed)) => {
                            match parser::content_length(
                                &conn.buf,
                                &self.offsets,
                                parsed.headers_count,
                            ) {
                                Err(_) => Step::Reject(REJECT_BAD_REQUEST),
                                Ok(content_length) => {
                                    let head_len = parsed.body_start as usize;
                                    let total = head_len.saturating_add(content_length);
                                    let available = conn.buf.len().min(total);
                                    let connection_header = parser::header_value(
                                        &conn.buf,
                                        &self.offsets,
                                        parsed.headers_count,
                                        "connection",
                                    );
                                    let keep_alive =
                                        parser::keep_alive(parsed.version, connection_header);
                                    conn.needs_drain = total > conn.buf.len();
                                    conn.close_after_response = !keep_alive;

                                    let (route, params) = {
                                        let path = parsed.path(&conn.buf);
                                        self.router
                                            .resolve_or_not_found(parsed.method.as_str(), path)
                                    };

                                    let inline = if self.router.has_dynamic_work() {
                                        None
                                    } else if let Responder::Static(payload) = &route.responder {
                                        // Inline fast path: vectored write on
                                        // the reactor thread, no allocation.
                                        let date = self.date.now();
                                        let mut segments = payload.segments(&date);
                                        Some(match conn.socket.write_vectored_all(&mut segments) {
                                            Err(err) => {
                                                log::debug!(
                                                    "worker {}: write failed: {}",
                                                    self.index,
                                                    err
                                                );
                                                Step::Close
                                            }
                                            Ok(()) => {
                                                conn.consume(available);
                                                if conn.close_after_response {
                                                    Step::Close
                                                } else if conn.needs_drain {
                                                    Step::Drain
                                                } else {
                                                    Step::Loop
                                                }
                                            }
                                        })
                                    } else {
                                        None
                                    };

                                    match inline {
                                        Some(step) => step,
                                        None => {
                                            let body = Bytes::copy_from_slice(
                                                &conn.buf[head_len..available],
                                            );
                                            let params: HashMap<String, String> =
                                                params.into_iter().collect();
                                            let request = Request::from_parsed(
                                                &conn.buf,
                                                &parsed,
                                                &self.offsets,
                                                params,
                                                body,
                                            );
                                            conn.consume(available);
                                            conn.state = ConnState::Awaiting;

                                            let router = self.router.clone();
                                            let date = self.date.clone();
                                            let tx = self.completions_tx.clone();
                                            let waker = self.wake.waker();
                                            self.handle.spawn(async move {
                                                let outcome =
                                                    router.respond(route, request, date).await;
                                                let _ = tx.send(Completion {
                                                    slot,
                                                    generation,
                                                    bytes: outcome.bytes,
                                                    close: outcome.close,
                                                });
                                                waker.wake();
                                            });
                                            Step::Spawned
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            };
            match step {
                Step::Rearm => return self.rearm(slot),
                Step::Close => return self.close_slot(slot),
                Step::Reject(page) => return self.reject(slot, page),
                Step::Drain => return self.drain_then_rearm(slot),
                Step::Spawned => return,
                Step::Loop => {}
            }
        }
    }

    fn drain_completions(&mut self) {
        while let Ok(done) = self.completions_rx.try_recv() {
            self.finish(done);
        }
    }

    fn finish(&mut self, done: Completion) {
        if self.conns.generation(done.slot) != done.generation {
            return;
        }
        let step = {
            let Some(conn) = self.conns.get_mut(done.slot) else {
                return;
            };
            if conn.state != ConnState::Awaiting {
                return;
            }
            conn.state = ConnState::Handling;
            match &done.bytes {
                None => Step::Close,
                Some(bytes) => {
                    let mut segments = [IoSlice::new(bytes)];
                    match conn.socket.write_vectored_all(&mut segments) {
                        Err(err) => {
                            log::debug!("worker {}: write failed: {}", self.index, err);
                            Step::Close
                        }
                        Ok(()) => {
                            if done.close || conn.close_after_response {
                                Step::Close
                            } else if conn.needs_drain {
                                Step::Drain
                            } else {
                                Step::Loop
                            }
                        }
                    }
                }
            }
        };
        match step {
            Step::Close => self.close_slot(done.slot),
            Step::Drain => self.drain_then_rearm(done.slot),
            // Buffered pipelined requests may be waiting.
            _ => self.process(done.slot, Fill::WouldBlock),
        }
    }

    fn reject(&mut self, slot: usize, page: &'static [u8]) {
        if let Some(conn) = self.conns.get_mut(slot) {
            let mut segments = [IoSlice::new(page)];
            if let Err(err) = conn.socket.write_vectored_all(&mut segments) {
                log::debug!("worker {}: reject write failed: {}", self.index, err);
            }
        }
        self.close_slot(slot);
    }

    fn rearm(&mut self, slot: usize) {
        let fd = {
            let Some(conn) = self.conns.get_mut(slot) else {
                return;
            };
            conn.state = ConnState::Registered;
            conn.socket.raw()
        };
        if let Err(err) = self.poller.rearm(fd, slot as Token) {
            // An unarmed connection stalls forever; close it instead.
            log::warn!("worker {}: rearm failed: {}", self.index, err);
            self.close_slot(slot);
        }
    }

    fn drain_then_rearm(&mut self, slot: usize) {
        let drained = {
            let Some(conn) = self.conns.get_mut(slot) else {
                return;
            };
            conn.needs_drain = false;
            conn.buf.clear();
            conn.socket.flush_until_blocked()
        };
        match drained {
            Ok(Drained::Rearm) => self.rearm(slot),
            Ok(Drained::Closed) => self.close_slot(slot),
            Err(err) => {
                log::debug!("worker {}: drain failed: {}", self.index, err);
                self.close_slot(slot);
            }
        }
    }

    /// Deregister then close: the only exit path for a live slot.
    fn close_slot(&mut self, slot: usize) {
        if let Some(mut conn) = self.conns.free(slot) {
            conn.state = ConnState::Closing;
            let _ = self.poller.deregister(conn.socket.raw());
            conn.socket.close();
            self.tracker.decrement();
        }
    }

    fn teardown(&mut self) {
        for slot in 0..self.conns.capacity() {
            self.close_slot(slot);
        }
        let _ = self.poller.deregister(self.listener_fd);
        log::debug!("worker {} stopped", self.index);
    }
}
