//! Byte transport over plaintext TCP or a rustls session.
//!
//! Every operation is non-blocking and reports one of three outcomes. A `WouldBlock`
//! means the caller must wait for the next readiness event and call again; no state
//! is lost between calls.

use crate::error::HandshakeError;
use mio::net::TcpStream;
use std::fmt;
use std::io;
use std::io::{Read, Write};
use std::net::Shutdown;

/// Outcome of a single non-blocking transport operation.
#[derive(Debug)]
pub enum IoStatus<T> {
    /// Operation made progress.
    Done(T),
    /// Nothing could be done without blocking.
    WouldBlock,
    /// Fatal for the connection.
    Error(io::Error),
}

impl<T> IoStatus<T> {
    fn from_result(r: io::Result<T>) -> Option<Self> {
        match r {
            Ok(v) => Some(IoStatus::Done(v)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Some(IoStatus::WouldBlock),
            // caller retries
            Err(e) if e.kind() == io::ErrorKind::Interrupted => None,
            Err(e) => Some(IoStatus::Error(e)),
        }
    }
}

/// What was negotiated on a TLS connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    /// E.g. `TLSv1_3`.
    pub protocol_version: Option<String>,
    /// E.g. `TLS13_AES_128_GCM_SHA256`.
    pub cipher_suite: Option<String>,
    /// SNI host name sent by the client.
    pub server_name: Option<String>,
}

pub(crate) enum Transport {
    Plain(TcpStream),
    Secure(Box<SecureStream>),
}

pub(crate) struct SecureStream {
    sock: TcpStream,
    tls: rustls::ServerConnection,
}

impl Transport {
    pub fn plain(sock: TcpStream) -> Self {
        Transport::Plain(sock)
    }

    pub fn secure(sock: TcpStream, tls: rustls::ServerConnection) -> Self {
        Transport::Secure(Box::new(SecureStream { sock, tls }))
    }

    pub fn socket(&mut self) -> &mut TcpStream {
        match self {
            Transport::Plain(s) => s,
            Transport::Secure(s) => &mut s.sock,
        }
    }

    pub fn tls_info(&self) -> Option<TlsInfo> {
        match self {
            Transport::Plain(_) => None,
            Transport::Secure(s) => Some(TlsInfo {
                protocol_version: s.tls.protocol_version().map(|v| format!("{:?}", v)),
                cipher_suite: s
                    .tls
                    .negotiated_cipher_suite()
                    .map(|c| format!("{:?}", c.suite())),
                server_name: s.tls.server_name().map(|n| n.to_string()),
            }),
        }
    }

    /// Decrypted bytes are waiting inside the TLS session.
    ///
    /// A TLS read drains the socket into the session, so bytes of a following request
    /// can sit here while the socket itself has nothing more to report.
    pub fn has_pending_plaintext(&mut self) -> bool {
        match self {
            Transport::Plain(_) => false,
            Transport::Secure(s) => match s.tls.process_new_packets() {
                Ok(state) => state.plaintext_bytes_to_read() > 0,
                // the next read surfaces the error
                Err(_) => true,
            },
        }
    }

    /// Read up to `buf.len()` bytes. `Done(0)` means the peer closed.
    pub fn read(&mut self, buf: &mut [u8]) -> IoStatus<usize> {
        match self {
            Transport::Plain(sock) => loop {
                if let Some(s) = IoStatus::from_result(sock.read(buf)) {
                    return s;
                }
            },
            Transport::Secure(s) => s.read(buf),
        }
    }

    /// Write some of `buf`. Callers keep an offset and call again with the rest.
    pub fn write(&mut self, buf: &[u8]) -> IoStatus<usize> {
        match self {
            Transport::Plain(sock) => loop {
                match sock.write(buf) {
                    Ok(0) if !buf.is_empty() => {
                        return IoStatus::Error(io::ErrorKind::WriteZero.into());
                    }
                    r => {
                        if let Some(s) = IoStatus::from_result(r) {
                            return s;
                        }
                    }
                }
            },
            Transport::Secure(s) => s.write(buf),
        }
    }

    /// Push out anything buffered below the caller. Plain sockets buffer nothing.
    pub fn flush(&mut self) -> IoStatus<()> {
        match self {
            Transport::Plain(_) => IoStatus::Done(()),
            Transport::Secure(s) => s.flush(),
        }
    }

    /// Drive the TLS handshake. Plain transports are always done.
    pub fn handshake(&mut self) -> Result<IoStatus<()>, HandshakeError> {
        match self {
            Transport::Plain(_) => Ok(IoStatus::Done(())),
            Transport::Secure(s) => s.handshake(),
        }
    }

    /// Shut down both directions. `graceful` sends a TLS close_notify first.
    pub fn shutdown(&mut self, graceful: bool) {
        if let Transport::Secure(s) = self {
            if graceful && !s.tls.is_handshaking() {
                s.tls.send_close_notify();
                if let IoStatus::Error(e) = s.flush() {
                    trace!("close_notify not sent: {}", e);
                }
            }
        }
        if let Err(e) = self.socket().shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                debug!("socket shutdown: {}", e);
            }
        }
    }
}

impl SecureStream {
    fn handshake(&mut self) -> Result<IoStatus<()>, HandshakeError> {
        let fail = |source: io::Error| HandshakeError {
            clean_close: false,
            source,
        };

        loop {
            if !self.tls.is_handshaking() {
                // final flight may still be buffered
                return match self.flush() {
                    IoStatus::Error(e) => Err(fail(e)),
                    s => Ok(s),
                };
            }

            if self.tls.wants_write() {
                match self.flush() {
                    IoStatus::Done(()) => continue,
                    IoStatus::WouldBlock => return Ok(IoStatus::WouldBlock),
                    IoStatus::Error(e) => return Err(fail(e)),
                }
            }

            if !self.tls.wants_read() {
                return Ok(IoStatus::WouldBlock);
            }

            match self.tls.read_tls(&mut self.sock) {
                Ok(0) => {
                    return Err(HandshakeError {
                        clean_close: true,
                        source: io::ErrorKind::UnexpectedEof.into(),
                    });
                }
                Ok(_) => {
                    if let Err(e) = self.tls.process_new_packets() {
                        // best effort to tell the peer why
                        self.flush();
                        return Err(fail(io::Error::new(io::ErrorKind::InvalidData, e)));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(IoStatus::WouldBlock);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(fail(e)),
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> IoStatus<usize> {
        loop {
            match self.tls.reader().read(buf) {
                // Ok(0) is a received close_notify
                Ok(n) => return IoStatus::Done(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                // peer closed the socket without close_notify
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return IoStatus::Done(0),
                Err(e) => return IoStatus::Error(e),
            }

            // plaintext exhausted, pull more records off the socket.
            match self.tls.read_tls(&mut self.sock) {
                Ok(0) => return IoStatus::Done(0),
                Ok(_) => {
                    if let Err(e) = self.tls.process_new_packets() {
                        self.flush();
                        return IoStatus::Error(io::Error::new(io::ErrorKind::InvalidData, e));
                    }
                    // a read may produce records to send (key updates, alerts).
                    if let IoStatus::Error(e) = self.flush() {
                        return IoStatus::Error(e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return IoStatus::WouldBlock,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return IoStatus::Error(e),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> IoStatus<usize> {
        match self.flush() {
            IoStatus::Done(()) => {}
            other => return other.map_done(0),
        }

        let amount = match self.tls.writer().write(buf) {
            Ok(n) => n,
            Err(e) => return IoStatus::Error(e),
        };

        match self.flush() {
            IoStatus::Error(e) => IoStatus::Error(e),
            // plaintext was accepted, remaining records go out on a later flush.
            _ => IoStatus::Done(amount),
        }
    }

    fn flush(&mut self) -> IoStatus<()> {
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut self.sock) {
                Ok(0) => return IoStatus::Error(io::ErrorKind::WriteZero.into()),
                Ok(n) => trace!("write_tls: {}", n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return IoStatus::WouldBlock,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return IoStatus::Error(e),
            }
        }
        IoStatus::Done(())
    }
}

impl IoStatus<()> {
    fn map_done<U>(self, v: U) -> IoStatus<U> {
        match self {
            IoStatus::Done(()) => IoStatus::Done(v),
            IoStatus::WouldBlock => IoStatus::WouldBlock,
            IoStatus::Error(e) => IoStatus::Error(e),
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Plain(_) => write!(f, "Plain"),
            Transport::Secure(s) => write!(f, "Secure handshaking: {}", s.tls.is_handshaking()),
        }
    }
}
