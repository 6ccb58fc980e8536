//! The boundary to application code.
//!
//! A [`Handler`] is called once per complete request, on the worker thread that owns the
//! connection. It runs inside that worker's event loop, so it should return promptly;
//! every other connection on the thread waits while it runs.
//!
//! The request is an `http::Request<Vec<u8>>`:
//!
//! * Header names are case-insensitive. Repeated headers are all kept in arrival order,
//!   `headers().get()` returns the first and `headers().get_all()` every value.
//! * The body is exactly `content-length` bytes, empty when the header is absent or 0.
//! * [`ConnInfo`] is found in the request extensions.

use crate::transport::TlsInfo;
use std::net::SocketAddr;

/// Error returned by a handler. Answered with `500 Internal Server Error`.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Application code turning a request into a response.
pub trait Handler: Send + Sync + 'static {
    /// Handle one request.
    fn handle(
        &self,
        req: http::Request<Vec<u8>>,
    ) -> Result<http::Response<Vec<u8>>, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(http::Request<Vec<u8>>) -> Result<http::Response<Vec<u8>>, HandlerError>,
    F: Send + Sync + 'static,
{
    fn handle(
        &self,
        req: http::Request<Vec<u8>>,
    ) -> Result<http::Response<Vec<u8>>, HandlerError> {
        (self)(req)
    }
}

/// Context about the connection a request arrived on.
///
/// ```
/// use h1_reactor::ConnInfo;
///
/// fn peer(req: &http::Request<Vec<u8>>) -> String {
///     req.extensions()
///         .get::<ConnInfo>()
///         .map(|c| c.client_address())
///         .unwrap_or_default()
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ConnInfo {
    /// Index of the worker thread that owns the connection.
    pub thread_index: usize,
    /// Remote address.
    pub peer_addr: SocketAddr,
    /// Per-thread sequence number of this request.
    pub request_seq: u64,
    /// Negotiated TLS parameters, `None` for plaintext.
    pub tls: Option<TlsInfo>,
}

impl ConnInfo {
    /// Remote IP as a string, without port.
    pub fn client_address(&self) -> String {
        self.peer_addr.ip().to_string()
    }

    /// Whether the request arrived over TLS.
    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }
}
