//! One event loop per worker thread.
//!
//! A worker owns its connections outright. Nothing but the live/request counters is
//! shared with other threads, so framing and writing happen without locks.
//!
//! Each worker polls two sets:
//!
//! * the main set, holding connections with a request being read or a response
//!   being written, plus the intake (listening socket or handoff waker).
//! * the keepalive set, holding connections idle between requests. It is polled
//!   without blocking on every turn of the loop, and a connection that turns
//!   readable there moves back to the main set.

use crate::config::ServerConfig;
use crate::connection::{Connection, WriteOutcome};
use crate::handler::Handler;
use crate::http11::error_response;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) const WAKER: Token = Token(usize::MAX);
pub(crate) const LISTENER: Token = Token(usize::MAX - 1);
const KEEPALIVE: Token = Token(usize::MAX - 2);

/// Poll wait while draining.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Where the keepalive set can't wake the main poll, it is visited at least this often.
#[cfg(not(unix))]
const KEEPALIVE_POLL: Duration = Duration::from_millis(10);

/// Socket accepted elsewhere, handed to a worker.
#[derive(Debug)]
pub(crate) struct Incoming {
    pub sock: TcpStream,
    pub peer_addr: SocketAddr,
}

/// How a worker gets new sockets.
#[derive(Debug)]
pub(crate) enum Intake {
    /// The worker accepts on its own listening socket. `None` once draining.
    Direct(Option<TcpListener>),
    /// An acceptor thread sends sockets and wakes the worker.
    Central(Receiver<Incoming>),
}

/// Counters a worker publishes for [`Listener::stats`](crate::Listener::stats).
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub live: AtomicUsize,
    pub requests: AtomicU64,
}

/// Snapshot of one worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStats {
    /// Index of the worker thread.
    pub thread_index: usize,
    /// Connections currently owned by the worker.
    pub live_connections: usize,
    /// Requests handed to the handler so far.
    pub requests: u64,
}

impl Counters {
    pub fn snapshot(&self, thread_index: usize) -> ThreadStats {
        ThreadStats {
            thread_index,
            live_connections: self.live.load(Ordering::Acquire),
            requests: self.requests.load(Ordering::Acquire),
        }
    }
}

/// Per worker state, moved into the worker thread and owned by its loop.
pub(crate) struct ThreadState {
    index: usize,
    config: Arc<ServerConfig>,
    handler: Arc<dyn Handler>,
    poll: Poll,
    keepalive_poll: Poll,
    /// Connection arena, indexed by token.
    conns: Vec<Option<Connection>>,
    free: Vec<usize>,
    counters: Arc<Counters>,
    request_seq: u64,
    intake: Intake,
    terminate: Arc<AtomicBool>,
    draining: bool,
    last_cleanup: Instant,
}

impl ThreadState {
    pub fn new(
        index: usize,
        config: Arc<ServerConfig>,
        handler: Arc<dyn Handler>,
        mut intake: Intake,
        terminate: Arc<AtomicBool>,
        counters: Arc<Counters>,
    ) -> io::Result<(ThreadState, Arc<Waker>)> {
        let poll = Poll::new()?;
        let keepalive_poll = Poll::new()?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        if let Intake::Direct(Some(listener)) = &mut intake {
            poll.registry()
                .register(listener, LISTENER, Interest::READABLE)?;
        }

        register_keepalive_set(&poll, &keepalive_poll)?;

        let state = ThreadState {
            index,
            config,
            handler,
            poll,
            keepalive_poll,
            conns: Vec::new(),
            free: Vec::new(),
            counters,
            request_seq: 0,
            intake,
            terminate,
            draining: false,
            last_cleanup: Instant::now(),
        };

        Ok((state, waker))
    }

    fn live(&self) -> usize {
        self.counters.live.load(Ordering::Acquire)
    }

    /// Run until shut down and drained.
    pub fn run(mut self) {
        info!("worker {} started", self.index);

        let mut events = Events::with_capacity(1024);
        let mut keepalive_events = Events::with_capacity(256);

        loop {
            if !self.draining && self.terminate.load(Ordering::Acquire) {
                self.begin_drain();
            }

            if self.draining && self.live() == 0 {
                break;
            }

            let timeout = self.poll_timeout();

            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    warn!("worker {} poll: {}", self.index, e);
                }
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER => self.receive(),
                    LISTENER => self.accept(),
                    // drained below
                    KEEPALIVE => {}
                    token => self.process(token.0),
                }
            }

            self.sweep_keepalive(&mut keepalive_events);

            if self.draining || self.last_cleanup.elapsed() >= self.config.cleanup_interval {
                self.cleanup();
            }
        }

        info!("worker {} drained", self.index);
    }

    fn poll_timeout(&self) -> Duration {
        if self.draining {
            return DRAIN_POLL;
        }

        let until_cleanup = self
            .config
            .cleanup_interval
            .checked_sub(self.last_cleanup.elapsed())
            .unwrap_or_default();

        #[cfg(not(unix))]
        let until_cleanup = until_cleanup.min(KEEPALIVE_POLL);

        until_cleanup
    }

    fn begin_drain(&mut self) {
        info!("worker {} draining, live: {}", self.index, self.live());
        self.draining = true;

        if let Intake::Direct(listener) = &mut self.intake {
            if let Some(mut l) = listener.take() {
                if let Err(e) = self.poll.registry().deregister(&mut l) {
                    debug!("worker {} deregister listener: {}", self.index, e);
                }
            }
        }

        // sockets already handed over but not yet admitted.
        self.receive();

        // idle connections hold no request, nothing to finish.
        let parked: Vec<usize> = self
            .conns
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().filter(|c| c.parked).map(|_| i))
            .collect();

        for slot in parked {
            self.close(slot, true);
        }
    }

    /// Handoff from an acceptor thread.
    fn receive(&mut self) {
        loop {
            let incoming = match &self.intake {
                Intake::Central(rx) => rx.try_recv(),
                // the waker only signals shutdown here.
                Intake::Direct(_) => return,
            };

            match incoming {
                Ok(Incoming { sock, peer_addr }) if self.draining => {
                    debug!("worker {} draining, refusing {}", self.index, peer_addr);
                    if let Err(e) = sock.shutdown(Shutdown::Both) {
                        trace!("refused socket shutdown: {}", e);
                    }
                }
                Ok(Incoming { sock, peer_addr }) => self.admit(sock, peer_addr),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    trace!("worker {} intake closed", self.index);
                    return;
                }
            }
        }
    }

    fn accept(&mut self) {
        loop {
            let accepted = match &self.intake {
                Intake::Direct(Some(listener)) => listener.accept(),
                _ => return,
            };

            match accepted {
                Ok((sock, peer_addr)) => self.admit(sock, peer_addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    // e.g. out of descriptors. The next connection retries.
                    warn!("worker {} accept: {}", self.index, e);
                    return;
                }
            }
        }
    }

    /// Take ownership of an accepted socket, unless the thread is at capacity.
    fn admit(&mut self, sock: TcpStream, peer_addr: SocketAddr) {
        let cap = self.config.per_thread_connection_cap;
        let live = self.live();

        if cap > 0 && live >= cap {
            warn!(
                "worker {} at capacity ({}/{}), refusing {}",
                self.index, live, cap, peer_addr
            );
            if let Err(e) = sock.shutdown(Shutdown::Both) {
                trace!("refused socket shutdown: {}", e);
            }
            return;
        }

        if self.config.keepalive_enabled {
            if let Err(e) = set_tcp_keepalive(&sock, &self.config) {
                debug!("tcp keepalive for {}: {}", peer_addr, e);
            }
        }

        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.conns.push(None);
                self.conns.len() - 1
            }
        };
        let token = Token(slot);

        let mut conn = Connection::new(token, sock, peer_addr, self.index, &self.config);

        if conn.to_delete {
            self.free.push(slot);
            return;
        }

        // writable too, so a response blocked on a full socket resumes.
        if let Err(e) = self.poll.registry().register(
            conn.socket(),
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            warn!("{} register: {}", conn, e);
            conn.close(false);
            self.free.push(slot);
            return;
        }

        debug!("{} admitted", conn);

        self.conns[slot] = Some(conn);
        self.counters.live.fetch_add(1, Ordering::AcqRel);
    }

    /// Move a connection as far as it goes on this readiness event.
    fn process(&mut self, slot: usize) {
        loop {
            let conn = match self.conns.get_mut(slot) {
                Some(Some(conn)) => conn,
                // stale event for a removed connection
                _ => return,
            };

            if conn.parked {
                return;
            }

            if !conn.is_writing() {
                if !conn.drive(&self.config) {
                    return;
                }

                if conn.to_delete {
                    self.remove(slot);
                    return;
                }

                if conn.in_progress {
                    return;
                }
                conn.in_progress = true;

                self.request_seq += 1;
                self.counters.requests.fetch_add(1, Ordering::AcqRel);

                dispatch(&*self.handler, conn, self.request_seq, &self.config);
            }

            match conn.drive_write() {
                WriteOutcome::Pending => return,
                WriteOutcome::Closed => {
                    self.remove(slot);
                    return;
                }
                WriteOutcome::Flushed => {}
            }

            if !conn.finish_response(self.draining) {
                self.remove(slot);
                return;
            }

            // pipelined request already in the buffer
            if conn.has_buffered_input() {
                continue;
            }

            self.park(slot);
            return;
        }
    }

    /// Move an idle keepalive connection to the keepalive set.
    fn park(&mut self, slot: usize) {
        let conn = match self.conns.get_mut(slot) {
            Some(Some(conn)) => conn,
            _ => return,
        };

        let token = conn.token;
        let keepalive = self.keepalive_poll.registry();

        let moved = match self.poll.registry().deregister(conn.socket()) {
            Ok(()) => keepalive.register(conn.socket(), token, Interest::READABLE),
            Err(e) => Err(e),
        };

        match moved {
            Ok(()) => {
                conn.parked = true;
                trace!("{} parked", conn);
            }
            Err(e) => {
                debug!("{} park: {}", conn, e);
                self.close(slot, false);
            }
        }
    }

    /// Non-blocking look at the keepalive set. Readable connections go back to the main
    /// set and are driven right away.
    fn sweep_keepalive(&mut self, events: &mut Events) {
        if let Err(e) = self.keepalive_poll.poll(events, Some(Duration::ZERO)) {
            if e.kind() != io::ErrorKind::Interrupted {
                warn!("worker {} keepalive poll: {}", self.index, e);
            }
            return;
        }

        let woken: Vec<usize> = events.iter().map(|e| e.token().0).collect();

        for slot in woken {
            let conn = match self.conns.get_mut(slot) {
                Some(Some(conn)) if conn.parked => conn,
                _ => continue,
            };

            let token = conn.token;
            let main = self.poll.registry();

            let moved = match self.keepalive_poll.registry().deregister(conn.socket()) {
                Ok(()) => main.register(
                    conn.socket(),
                    token,
                    Interest::READABLE | Interest::WRITABLE,
                ),
                Err(e) => Err(e),
            };

            if let Err(e) = moved {
                debug!("{} unpark: {}", conn, e);
                conn.parked = false;
                self.close(slot, false);
                continue;
            }

            let now = Instant::now();
            conn.parked = false;
            conn.start_read = now;
            conn.latest = now;
            trace!("{} woke from keepalive", conn);

            self.process(slot);
        }
    }

    /// Close connections without activity for longer than `conn_timeout`.
    ///
    /// That includes a response stuck on a peer that stopped reading. The handler runs
    /// to completion inside `process`, so nothing here can be mid-handler.
    fn cleanup(&mut self) {
        self.last_cleanup = Instant::now();

        let timeout = self.config.conn_timeout;

        let stale: Vec<usize> = self
            .conns
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                c.as_ref()
                    .filter(|c| c.latest.elapsed() > timeout)
                    .map(|_| i)
            })
            .collect();

        for slot in stale {
            if let Some(Some(conn)) = self.conns.get(slot) {
                debug!("{} idle for {:?}, closing", conn, conn.latest.elapsed());
            }
            self.close(slot, true);
        }
    }

    fn close(&mut self, slot: usize, graceful: bool) {
        if let Some(Some(conn)) = self.conns.get_mut(slot) {
            conn.close(graceful);
        }
        self.remove(slot);
    }

    /// Deregister and drop a connection, freeing its slot.
    fn remove(&mut self, slot: usize) {
        let mut conn = match self.conns.get_mut(slot).and_then(Option::take) {
            Some(conn) => conn,
            None => return,
        };

        conn.close(false);

        let registry = if conn.parked {
            self.keepalive_poll.registry()
        } else {
            self.poll.registry()
        };
        if let Err(e) = registry.deregister(conn.socket()) {
            trace!("{} deregister: {}", conn, e);
        }

        self.free.push(slot);
        self.counters.live.fetch_sub(1, Ordering::AcqRel);

        debug!("{} removed", conn);
    }
}

/// Turn a ready connection's request into a staged response.
fn dispatch(handler: &dyn Handler, conn: &mut Connection, seq: u64, config: &ServerConfig) {
    let req = match conn.take_request(seq) {
        Some(req) => req,
        None => {
            debug!("{} bad request", conn);
            let version = conn.request_version().unwrap_or(http::Version::HTTP_11);
            let res = error_response(http::StatusCode::BAD_REQUEST);
            conn.begin_response(&res, version, false, false);
            return;
        }
    };

    let version = req.version();
    let head_only = req.method() == http::Method::HEAD;
    let keep_alive = Connection::wants_keep_alive(&req, config);

    debug!("{} handle {} {}", conn, req.method(), req.uri());

    let (res, keep_alive) =
        match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(req))) {
            Ok(Ok(res)) => (res, keep_alive),
            Ok(Err(e)) => {
                warn!("{} handler failed: {}", conn, e);
                (error_response(http::StatusCode::INTERNAL_SERVER_ERROR), false)
            }
            Err(_) => {
                warn!("{} handler panicked", conn);
                (error_response(http::StatusCode::INTERNAL_SERVER_ERROR), false)
            }
        };

    conn.begin_response(&res, version, keep_alive, head_only);
}

/// The keepalive set wakes the main poll by registering one inside the other.
#[cfg(unix)]
fn register_keepalive_set(poll: &Poll, keepalive_poll: &Poll) -> io::Result<()> {
    use mio::unix::SourceFd;
    use std::os::unix::io::AsRawFd;

    let fd = keepalive_poll.as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&fd), KEEPALIVE, Interest::READABLE)
}

#[cfg(not(unix))]
fn register_keepalive_set(_poll: &Poll, _keepalive_poll: &Poll) -> io::Result<()> {
    Ok(())
}

fn set_tcp_keepalive(sock: &TcpStream, config: &ServerConfig) -> io::Result<()> {
    let keepalive = socket2::TcpKeepalive::new().with_time(config.keepalive_idle);

    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
    ))]
    let keepalive = keepalive
        .with_interval(config.keepalive_interval)
        .with_retries(config.keepalive_probe_count);

    socket2::SockRef::from(sock).set_tcp_keepalive(&keepalive)
}
