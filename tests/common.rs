#![allow(dead_code)]

use h1_reactor::{ConnInfo, Handler, HandlerError, Listener, ServerConfig};
use std::convert::TryFrom;
use std::io;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

pub const CA_PEM: &[u8] = include_bytes!("data/ca.pem");
pub const SERVER_PEM: &[u8] = include_bytes!("data/server.pem");
pub const SERVER_KEY: &[u8] = include_bytes!("data/server.key");

pub fn setup_logger() {
    static START: Once = Once::new();
    START.call_once(|| {
        let test_log = std::env::var("TEST_LOG")
            .map(|x| x != "0" && x.to_lowercase() != "false")
            .unwrap_or(false);
        let level = if test_log {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Info
        };
        pretty_env_logger::formatted_builder()
            .filter_level(log::LevelFilter::Warn)
            .filter_module("h1_reactor", level)
            .target(env_logger::Target::Stdout)
            .init();
    });
}

/// Loopback config on a free port with two workers.
pub fn config() -> ServerConfig {
    ServerConfig::new()
        .host("127.0.0.1")
        .port(0)
        .num_worker_threads(2)
}

pub fn serve<H: Handler>(config: ServerConfig, handler: H) -> Listener {
    setup_logger();
    Listener::bind(config, handler).expect("Listener::bind")
}

pub type Res = Result<http::Response<Vec<u8>>, HandlerError>;

pub fn text(status: u16, body: impl Into<Vec<u8>>) -> Res {
    Ok(http::Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(body.into())?)
}

/// Responds with `METHOD PATH host=HOST len=BODY_LEN` and echoes the body after a newline.
pub fn echo(req: http::Request<Vec<u8>>) -> Res {
    let host = req
        .headers()
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let mut body = format!(
        "{} {} host={} len={}\n",
        req.method(),
        req.uri().path(),
        host,
        req.body().len()
    )
    .into_bytes();
    body.extend_from_slice(req.body());

    text(200, body)
}

/// Responds with the connection context as text.
pub fn conn_info(req: http::Request<Vec<u8>>) -> Res {
    let info = req
        .extensions()
        .get::<ConnInfo>()
        .cloned()
        .ok_or("no ConnInfo")?;

    let tls = info.tls.as_ref();
    let body = format!(
        "thread={} port={} seq={} secure={} version={} sni={}",
        info.thread_index,
        info.peer_addr.port(),
        info.request_seq,
        info.is_secure(),
        tls.and_then(|t| t.protocol_version.clone())
            .unwrap_or_default(),
        tls.and_then(|t| t.server_name.clone()).unwrap_or_default(),
    );

    text(200, body)
}

pub fn connect(l: &Listener) -> io::Result<TcpStream> {
    let tcp = TcpStream::connect(l.local_addr())?;
    tcp.set_read_timeout(Some(Duration::from_secs(5)))?;
    tcp.set_nodelay(true)?;
    Ok(tcp)
}

/// A response as read off the wire.
#[derive(Debug)]
pub struct Resp {
    pub status: u16,
    pub version: u8,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Resp {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).expect("utf-8 body")
    }
}

/// Read a response head up to and including the blank line.
pub fn read_head<R: Read>(r: &mut R) -> io::Result<String> {
    let mut head = Vec::new();
    let mut byte = [0_u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        let n = r.read(&mut byte)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("eof in head: {:?}", String::from_utf8_lossy(&head)),
            ));
        }
        head.push(byte[0]);
    }

    String::from_utf8(head).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Read one response. The body is `content-length` bytes, or none if `head_only`.
pub fn read_response_head_only<R: Read>(r: &mut R, head_only: bool) -> io::Result<Resp> {
    let head = read_head(r)?;

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut headers);
    parsed
        .parse(head.as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let status = parsed.code.unwrap_or(0);
    let version = parsed.version.unwrap_or(0);
    let headers: Vec<(String, String)> = parsed
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).to_string(),
            )
        })
        .collect();

    let mut resp = Resp {
        status,
        version,
        headers,
        body: Vec::new(),
    };

    if !head_only {
        let len: usize = resp
            .header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        resp.body = vec![0; len];
        r.read_exact(&mut resp.body)?;
    }

    Ok(resp)
}

pub fn read_response<R: Read>(r: &mut R) -> io::Result<Resp> {
    read_response_head_only(r, false)
}

/// Send a request and read the response.
pub fn roundtrip<S: Read + Write>(s: &mut S, req: &[u8]) -> io::Result<Resp> {
    s.write_all(req)?;
    s.flush()?;
    read_response(s)
}

/// True if the peer closed: a read gives 0 or the connection was reset.
pub fn is_closed<R: Read>(r: &mut R) -> bool {
    let mut buf = [0_u8; 128];
    loop {
        match r.read(&mut buf) {
            Ok(0) => return true,
            // drain anything still in flight
            Ok(_) => continue,
            Err(e) => {
                return e.kind() != io::ErrorKind::WouldBlock && e.kind() != io::ErrorKind::TimedOut
            }
        }
    }
}

/// Poll `cond` until it holds or `max` passes.
pub fn wait_for<F: FnMut() -> bool>(max: Duration, mut cond: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < max {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

pub fn live_connections(l: &Listener) -> usize {
    l.stats().iter().map(|s| s.live_connections).sum()
}

pub fn tls_server_config() -> Arc<rustls::ServerConfig> {
    h1_reactor::tls::server_config_from_pem(SERVER_PEM, SERVER_KEY).expect("tls config")
}

pub fn tls_client_config() -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &CA_PEM[..]) {
        roots.add(cert.expect("ca cert")).expect("add ca");
    }

    let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .expect("protocol versions")
    .with_root_certificates(roots)
    .with_no_client_auth();

    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Arc::new(config)
}

pub type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

pub fn tls_connect(l: &Listener, server_name: &str) -> io::Result<TlsStream> {
    let name = rustls::pki_types::ServerName::try_from(server_name.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let conn = rustls::ClientConnection::new(tls_client_config(), name)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    Ok(rustls::StreamOwned::new(conn, connect(l)?))
}
