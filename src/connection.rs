use crate::config::ServerConfig;
use crate::framer::Framer;
use crate::handler::ConnInfo;
use crate::http11::{allow_reuse, write_http1x_res};
use crate::transport::{IoStatus, Transport};
use mio::net::TcpStream;
use mio::Token;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    /// TLS handshake not complete.
    Handshaking,
    /// Accumulating request bytes.
    Reading,
    /// Flushing a response.
    Writing,
}

/// Result of pushing a staged response out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    /// Socket is full, wait for writable.
    Pending,
    /// Whole response is out.
    Flushed,
    /// Failed and closed.
    Closed,
}

/// One client socket and everything needed to frame and answer its requests.
///
/// Owned by exactly one worker thread from admission until it is dropped.
pub(crate) struct Connection {
    pub token: Token,
    pub peer_addr: SocketAddr,
    pub thread_index: usize,
    transport: Transport,
    framer: Framer,
    stage: Stage,
    /// Staged response bytes and how far they're written.
    out: Vec<u8>,
    write_offset: usize,
    pub start_read: Instant,
    pub latest: Instant,
    /// Request is framed (or failed) and waiting for handoff.
    pub ready: bool,
    /// Handed to the handler, guards against a second handoff.
    pub in_progress: bool,
    /// Closed, the reactor should drop it.
    pub to_delete: bool,
    /// Transport has been shut down.
    pub shutdown: bool,
    /// An I/O or TLS error happened.
    pub error: bool,
    /// Ready, but no valid request came out of it.
    bad_request: bool,
    /// Keep the connection after the current response.
    keep_alive: bool,
    /// Waiting in the keepalive sweep rather than the main poll.
    pub parked: bool,
}

impl Connection {
    pub fn new(
        token: Token,
        sock: TcpStream,
        peer_addr: SocketAddr,
        thread_index: usize,
        config: &ServerConfig,
    ) -> Self {
        let (transport, stage) = match &config.tls {
            Some(tls) => match rustls::ServerConnection::new(tls.clone()) {
                Ok(session) => (Transport::secure(sock, session), Stage::Handshaking),
                Err(e) => {
                    // Only fails for an unusable config, which validate() can't see.
                    warn!("tls session for {}: {}", peer_addr, e);
                    let mut conn = Connection::with_transport(
                        token,
                        Transport::plain(sock),
                        Stage::Reading,
                        peer_addr,
                        thread_index,
                        config,
                    );
                    conn.error = true;
                    conn.close(false);
                    return conn;
                }
            },
            None => (Transport::plain(sock), Stage::Reading),
        };

        Connection::with_transport(token, transport, stage, peer_addr, thread_index, config)
    }

    fn with_transport(
        token: Token,
        transport: Transport,
        stage: Stage,
        peer_addr: SocketAddr,
        thread_index: usize,
        config: &ServerConfig,
    ) -> Self {
        let now = Instant::now();
        Connection {
            token,
            peer_addr,
            thread_index,
            transport,
            framer: Framer::new(config.max_header_bytes, config.max_request_bytes),
            stage,
            out: Vec::new(),
            write_offset: 0,
            start_read: now,
            latest: now,
            ready: false,
            in_progress: false,
            to_delete: false,
            shutdown: false,
            error: false,
            bad_request: false,
            keep_alive: false,
            parked: false,
        }
    }

    pub fn socket(&mut self) -> &mut TcpStream {
        self.transport.socket()
    }

    pub fn is_writing(&self) -> bool {
        self.stage == Stage::Writing
    }

    /// Advance handshake and framing as far as possible without blocking.
    ///
    /// Returns true when an outcome is reached: either the request is ready for
    /// handoff (possibly as a bad request), or the connection closed. False means
    /// wait for the next readiness event.
    pub fn drive(&mut self, config: &ServerConfig) -> bool {
        if self.ready || self.shutdown {
            return true;
        }

        let now = Instant::now();
        self.latest = now;

        if self.stage == Stage::Handshaking {
            match self.transport.handshake() {
                Ok(IoStatus::Done(())) => {
                    debug!("{} tls handshake done: {:?}", self, self.transport.tls_info());
                    self.stage = Stage::Reading;
                }
                Ok(IoStatus::WouldBlock) => return false,
                Ok(IoStatus::Error(e)) => {
                    warn!("{} tls handshake failed: {}", self, e);
                    self.error = true;
                    self.close(false);
                    return true;
                }
                Err(e) => {
                    if e.clean_close {
                        debug!("{} {}", self, e);
                    } else {
                        warn!("{} {}", self, e);
                    }
                    self.error = true;
                    self.close(false);
                    return true;
                }
            }
        }

        if self.framer.should_parse_top_part() {
            if let Err(e) = self.framer.parse_top_part() {
                warn!("{} parse top part failed: {}", self, e);
                return self.mark_bad_request();
            }
        }

        let elapsed = now.duration_since(self.start_read);
        if elapsed > config.read_timeout {
            warn!("{} exceeded read timeout: {:?}", self, elapsed);
            return self.mark_bad_request();
        }

        loop {
            // bytes just read may have completed the head.
            if self.framer.should_parse_top_part() {
                if let Err(e) = self.framer.parse_top_part() {
                    warn!("{} parse top part failed: {}", self, e);
                    return self.mark_bad_request();
                }
            }

            if !self.framer.should_read_more() {
                break;
            }

            if self.framer.head_too_large() {
                warn!("{} request head too large", self);
                return self.mark_bad_request();
            }

            let room = config
                .max_request_bytes
                .saturating_sub(self.framer.accumulated());
            if room == 0 {
                warn!("{} request too large", self);
                self.error = true;
                self.close(false);
                return true;
            }

            let missing = self.framer.bytes_to_read();
            let want = if missing == 0 {
                config.max_read_chunk
            } else {
                missing.min(config.max_read_chunk)
            }
            .min(room);

            let transport = &mut self.transport;
            match self.framer.fill_with(want, |buf| transport.read(buf)) {
                IoStatus::Done(0) => {
                    if self.framer.accumulated() == 0 {
                        debug!("{} peer closed connection", self);
                        self.close(false);
                        return true;
                    }
                    if !self.framer.found_blank_line() {
                        debug!("{} peer closed before end of request head", self);
                        self.error = true;
                        self.close(false);
                        return true;
                    }
                    // answer what we have, but don't expect more.
                    self.keep_alive = false;
                    self.error = true;
                    break;
                }
                IoStatus::Done(amount) => {
                    trace!("{} read: {}", self, amount);
                }
                IoStatus::WouldBlock => {
                    trace!("{} read: WouldBlock", self);
                    return false;
                }
                IoStatus::Error(e) => {
                    debug!("{} read error: {}", self, e);
                    self.error = true;
                    self.close(false);
                    return true;
                }
            }
        }

        if self.framer.should_parse_bottom_part() {
            if let Err(e) = self.framer.parse_bottom_part() {
                warn!("{} parse bottom part failed: {}", self, e);
                self.error = true;
                self.close(false);
                return true;
            }
        }

        if !self.framer.is_complete() {
            return self.mark_bad_request();
        }

        self.ready = true;
        true
    }

    fn mark_bad_request(&mut self) -> bool {
        self.bad_request = true;
        self.ready = true;
        true
    }

    /// Take the framed request for handoff. `None` if the request was bad.
    pub fn take_request(&mut self, request_seq: u64) -> Option<http::Request<Vec<u8>>> {
        if self.bad_request {
            return None;
        }

        let (head, body) = self.framer.take_parsed()?;
        let (parts, _) = head.into_parts();

        // no content-length means an empty body
        let mut req = http::Request::from_parts(parts, body.unwrap_or_default());

        req.extensions_mut().insert(ConnInfo {
            thread_index: self.thread_index,
            peer_addr: self.peer_addr,
            request_seq,
            tls: self.transport.tls_info(),
        });

        Some(req)
    }

    /// Stage a response for writing.
    pub fn begin_response(
        &mut self,
        res: &http::Response<Vec<u8>>,
        version: http::Version,
        keep_alive: bool,
        head_only: bool,
    ) {
        // a connection that saw an error can't be trusted for another request.
        self.keep_alive = keep_alive && !self.error && !self.bad_request;

        self.out.clear();
        self.write_offset = 0;
        write_http1x_res(res, version, self.keep_alive, head_only, &mut self.out);

        self.stage = Stage::Writing;
    }

    /// Whether the client asked to keep the connection and the server allows it.
    pub fn wants_keep_alive(req: &http::Request<Vec<u8>>, config: &ServerConfig) -> bool {
        config.keepalive_enabled && allow_reuse(req.headers(), req.version())
    }

    /// Push staged response bytes out, resuming at the stored offset.
    pub fn drive_write(&mut self) -> WriteOutcome {
        self.latest = Instant::now();

        while self.write_offset < self.out.len() {
            match self.transport.write(&self.out[self.write_offset..]) {
                IoStatus::Done(amount) => {
                    trace!("{} wrote: {}", self, amount);
                    self.write_offset += amount;
                }
                IoStatus::WouldBlock => return WriteOutcome::Pending,
                IoStatus::Error(e) => {
                    debug!("{} write error: {}", self, e);
                    self.error = true;
                    self.close(false);
                    return WriteOutcome::Closed;
                }
            }
        }

        match self.transport.flush() {
            IoStatus::Done(()) => WriteOutcome::Flushed,
            IoStatus::WouldBlock => WriteOutcome::Pending,
            IoStatus::Error(e) => {
                debug!("{} flush error: {}", self, e);
                self.error = true;
                self.close(false);
                WriteOutcome::Closed
            }
        }
    }

    /// After a flushed response, either close or get ready for the next request.
    ///
    /// Returns true if the connection lives on.
    pub fn finish_response(&mut self, draining: bool) -> bool {
        if !self.keep_alive || draining {
            self.close(true);
            return false;
        }

        self.framer.reset();
        self.out.clear();
        self.write_offset = 0;
        self.ready = false;
        self.in_progress = false;
        self.bad_request = false;
        self.keep_alive = false;
        self.stage = Stage::Reading;

        let now = Instant::now();
        self.start_read = now;
        self.latest = now;

        true
    }

    /// Bytes of a following request are already buffered, here or in the TLS session.
    pub fn has_buffered_input(&mut self) -> bool {
        self.framer.accumulated() > 0 || self.transport.has_pending_plaintext()
    }

    /// HTTP version of the current request, if the request line got that far.
    pub fn request_version(&self) -> Option<http::Version> {
        self.framer.version()
    }

    /// Shut the transport down and mark for removal. Idempotent.
    pub fn close(&mut self, graceful: bool) {
        if self.shutdown {
            return;
        }
        trace!("{} close graceful: {}", self, graceful);

        self.shutdown = true;
        self.to_delete = true;
        self.transport.shutdown(graceful && !self.error);
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn({}/{} {})", self.thread_index, self.token.0, self.peer_addr)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("token", &self.token)
            .field("peer_addr", &self.peer_addr)
            .field("transport", &self.transport)
            .field("stage", &self.stage)
            .field("ready", &self.ready)
            .field("in_progress", &self.in_progress)
            .field("shutdown", &self.shutdown)
            .field("error", &self.error)
            .finish()
    }
}
