#![warn(missing_docs, missing_debug_implementations)]
#![warn(clippy::all)]

//! A multi-threaded, readiness driven HTTP/1.x server core with TLS termination.
//!
//! This library does the part of an HTTP/1.1 (and 1.0) server between the socket and the
//! application: accepting connections, optionally terminating TLS, framing requests off
//! the wire and writing responses back. What to answer is left to a [`Handler`].
//!
//! Each worker thread runs its own event loop (epoll/kqueue via [mio]) over connections
//! it owns exclusively. Nothing blocks inside a worker except the wait for readiness.
//!
//! ## In scope
//!
//! * `Content-Length` delimited request bodies, with limits on head and total size.
//! * `Connection: keep-alive` or `close`, HTTP/1.0 and HTTP/1.1 defaults, pipelining.
//! * TLS via [rustls], including SNI certificate selection.
//! * Per thread admission control, read timeouts and idle connection cleanup.
//! * Graceful shutdown that lets requests in flight finish.
//!
//! ## Out of scope
//!
//! * `Transfer-Encoding: chunked` request bodies. The header is ignored.
//! * Routing, cookies, compression or anything else above the transport.
//! * HTTP/2 and websocket upgrades.
//!
//! # Example
//!
//! ```no_run
//! use h1_reactor::{HandlerError, Listener, ServerConfig};
//!
//! fn hello(_req: http::Request<Vec<u8>>) -> Result<http::Response<Vec<u8>>, HandlerError> {
//!     Ok(http::Response::builder()
//!         .header("content-type", "text/plain")
//!         .body(b"Hello world!\n".to_vec())?)
//! }
//!
//! let config = ServerConfig::new().host("127.0.0.1").port(3000);
//! let listener = Listener::bind(config, hello)?;
//!
//! listener.join();
//! # Ok::<_, h1_reactor::Error>(())
//! ```
//!
//! # Accept strategies
//!
//! How accepted sockets reach a worker depends on [`AcceptStrategy`]. On linux every
//! worker has its own `SO_REUSEPORT` socket, elsewhere a single acceptor thread hands
//! sockets over. Connections behave the same either way.
//!
//! [mio]: https://crates.io/crates/mio
//! [rustls]: https://crates.io/crates/rustls

#[macro_use]
extern crate log;

mod config;
mod connection;
mod error;
mod handler;
mod listener;
mod reactor;
mod transport;

#[doc(hidden)]
pub mod http11;

pub mod framer;
pub mod tls;

pub use config::{ServerConfig, DEFAULT_BACKLOG};
pub use error::{Error, HandshakeError, ParseError};
pub use handler::{ConnInfo, Handler, HandlerError};
pub use listener::{AcceptStrategy, Listener};
pub use reactor::ThreadStats;
pub use transport::{IoStatus, TlsInfo};
