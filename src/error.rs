use std::fmt;
use std::io;

/// Possible errors from this crate.
#[derive(Debug)]
pub enum Error {
    /// A configuration problem discovered when starting a listener.
    Config(String),
    /// A wrapped std::io::Error from the underlying transport (socket).
    Io(io::Error),
    /// HTTP/1.1 parse errors from the `httparse` crate.
    Http11Parser(httparse::Error),
    /// Http errors from the `http` crate.
    Http(http::Error),
    /// TLS errors from `rustls`, including certificate loading problems.
    Tls(rustls::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Config(v) => write!(f, "config: {}", v),
            Error::Io(v) => fmt::Display::fmt(v, f),
            Error::Http11Parser(v) => write!(f, "http11 parser: {}", v),
            Error::Http(v) => write!(f, "http api: {}", v),
            Error::Tls(v) => write!(f, "tls: {}", v),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Self {
        Error::Http11Parser(e)
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Self {
        Error::Http(e)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e)
    }
}

/// Reasons a request head or body could not be framed.
///
/// All of these are answered with `400 Bad Request` before the connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// The request line is not `METHOD SP target SP HTTP/x.y`.
    MalformedRequestLine,
    /// A header line could not be parsed.
    MalformedHeader,
    /// The head grew past the configured limit without a blank line, or had too many headers.
    HeadersTooLarge,
    /// The method is not one the server accepts.
    UnsupportedMethod,
    /// `content-length` is present but not a non-negative integer.
    InvalidContentLength,
    /// `content-length` exceeds the configured max request size.
    BodyTooLarge,
}

impl ParseError {
    pub(crate) fn from_httparse(e: httparse::Error) -> Self {
        match e {
            httparse::Error::HeaderName | httparse::Error::HeaderValue => {
                ParseError::MalformedHeader
            }
            httparse::Error::TooManyHeaders => ParseError::HeadersTooLarge,
            // Token, NewLine, Version and Status all concern the first line.
            _ => ParseError::MalformedRequestLine,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ParseError::MalformedRequestLine => "malformed request line",
            ParseError::MalformedHeader => "malformed header",
            ParseError::HeadersTooLarge => "request head too large",
            ParseError::UnsupportedMethod => "unsupported method",
            ParseError::InvalidContentLength => "invalid content-length",
            ParseError::BodyTooLarge => "request body too large",
        };
        write!(f, "{}", s)
    }
}

impl std::error::Error for ParseError {}

/// Failure to complete a TLS handshake.
#[derive(Debug)]
pub struct HandshakeError {
    /// Peer closed the socket mid-handshake rather than sending garbage.
    pub clean_close: bool,
    /// Underlying cause.
    pub source: io::Error,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.clean_close {
            write!(f, "peer closed connection in tls handshake")
        } else {
            write!(f, "tls handshake failed: {}", self.source)
        }
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
