//! Server configuration.
//!
//! Everything here is fixed once [`Listener::bind`](crate::Listener::bind) is called.
//! Worker threads share the config behind an `Arc` and read it without locking.

use crate::listener::AcceptStrategy;
use crate::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default size of the listen queue, same as linux `SOMAXCONN`.
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Configuration consumed by a [`Listener`](crate::Listener).
///
/// ```
/// use h1_reactor::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig::new()
///     .host("127.0.0.1")
///     .port(8080)
///     .num_worker_threads(4)
///     .read_timeout(Duration::from_secs(10))
///     .per_thread_connection_cap(1000);
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct ServerConfig {
    pub(crate) host: Option<String>,
    pub(crate) port: u16,
    pub(crate) backlog: i32,
    pub(crate) num_worker_threads: usize,
    pub(crate) tls: Option<Arc<rustls::ServerConfig>>,
    pub(crate) keepalive_enabled: bool,
    pub(crate) keepalive_idle: Duration,
    pub(crate) keepalive_interval: Duration,
    pub(crate) keepalive_probe_count: u32,
    pub(crate) read_timeout: Duration,
    pub(crate) per_thread_connection_cap: usize,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) max_request_bytes: usize,
    pub(crate) max_read_chunk: usize,
    pub(crate) max_header_bytes: usize,
    pub(crate) conn_timeout: Duration,
    pub(crate) cleanup_interval: Duration,
    pub(crate) accept_strategy: Option<AcceptStrategy>,
}

impl ServerConfig {
    /// Config with defaults. Binds all interfaces on port 8080.
    pub fn new() -> Self {
        ServerConfig::default()
    }

    /// Host to bind. `None` binds the IPv6 wildcard in dual-stack mode.
    pub fn host<S: Into<String>>(mut self, host: S) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Port to bind. Port 0 picks a free port, shared by all worker sockets.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Listen backlog.
    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Number of worker threads, each running its own reactor.
    pub fn num_worker_threads(mut self, n: usize) -> Self {
        self.num_worker_threads = n;
        self
    }

    /// Enable TLS using the given rustls config. See [`tls`](crate::tls) for helpers.
    pub fn tls(mut self, tls: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Whether HTTP keep-alive is offered to clients, and `SO_KEEPALIVE` set on sockets.
    pub fn keepalive_enabled(mut self, enabled: bool) -> Self {
        self.keepalive_enabled = enabled;
        self
    }

    /// TCP keepalive tuning: idle time before the first probe, probe interval, probe count.
    pub fn tcp_keepalive(mut self, idle: Duration, interval: Duration, probe_count: u32) -> Self {
        self.keepalive_idle = idle;
        self.keepalive_interval = interval;
        self.keepalive_probe_count = probe_count;
        self
    }

    /// Max time from first byte wanted until the request is complete.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Max live connections per worker thread. 0 means unlimited.
    pub fn per_thread_connection_cap(mut self, cap: usize) -> Self {
        self.per_thread_connection_cap = cap;
        self
    }

    /// Stack size for worker threads. `None` uses the platform default.
    pub fn thread_stack_size(mut self, size: Option<usize>) -> Self {
        self.thread_stack_size = size;
        self
    }

    /// Max bytes (head + body) a single request may occupy.
    pub fn max_request_bytes(mut self, n: usize) -> Self {
        self.max_request_bytes = n;
        self
    }

    /// Max bytes asked for in one transport read.
    pub fn max_read_chunk(mut self, n: usize) -> Self {
        self.max_read_chunk = n;
        self
    }

    /// Max bytes of request head before the blank line must have been seen.
    pub fn max_header_bytes(mut self, n: usize) -> Self {
        self.max_header_bytes = n;
        self
    }

    /// Connections without activity for this long are closed by the cleanup sweep.
    pub fn conn_timeout(mut self, timeout: Duration) -> Self {
        self.conn_timeout = timeout;
        self
    }

    /// How often the cleanup sweep runs.
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Force an accept strategy instead of detecting one for the platform.
    pub fn accept_strategy(mut self, strategy: AcceptStrategy) -> Self {
        self.accept_strategy = Some(strategy);
        self
    }

    /// Whether connections terminate TLS.
    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// Check the config for values that can't work.
    pub fn validate(&self) -> Result<(), Error> {
        if self.num_worker_threads == 0 {
            return Err(Error::Config("num_worker_threads must be > 0".into()));
        }
        if self.max_read_chunk == 0 {
            return Err(Error::Config("max_read_chunk must be > 0".into()));
        }
        if self.max_header_bytes == 0 || self.max_header_bytes > self.max_request_bytes {
            return Err(Error::Config(
                "max_header_bytes must be > 0 and <= max_request_bytes".into(),
            ));
        }
        if self.backlog <= 0 {
            return Err(Error::Config("backlog must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        ServerConfig {
            host: None,
            port: 8080,
            backlog: DEFAULT_BACKLOG,
            num_worker_threads: threads,
            tls: None,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(5),
            keepalive_probe_count: 3,
            read_timeout: Duration::from_secs(30),
            per_thread_connection_cap: 0,
            thread_stack_size: None,
            max_request_bytes: 10 * 1024 * 1024,
            max_read_chunk: 32 * 1024,
            max_header_bytes: 64 * 1024,
            conn_timeout: Duration::from_secs(120),
            cleanup_interval: Duration::from_secs(10),
            accept_strategy: None,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("backlog", &self.backlog)
            .field("num_worker_threads", &self.num_worker_threads)
            .field("tls_enabled", &self.tls_enabled())
            .field("keepalive_enabled", &self.keepalive_enabled)
            .field("read_timeout", &self.read_timeout)
            .field("per_thread_connection_cap", &self.per_thread_connection_cap)
            .finish()
    }
}
