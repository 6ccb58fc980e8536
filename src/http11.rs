use crate::error::ParseError;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Version};
use std::io::Write;
use std::str::FromStr;

// Request headers today vary in size from ~200 bytes to over 2KB.
// As applications use more cookies and user agents expand features,
// typical header sizes of 700-800 bytes is common.
// http://dev.chromium.org/spdy/spdy-whitepaper
const MAX_HEADERS: usize = 128;

/// Methods the server accepts. Anything else is `ParseError::UnsupportedMethod`.
pub const ALLOWED_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS", "TRACE",
];

/// Attempt to parse an http/1.x request head.
///
/// Returns the request with an empty body and the length of the head including the
/// blank line. `Ok(None)` if the buffer doesn't hold a complete head.
pub fn try_parse_req(buf: &[u8]) -> Result<Option<(http::Request<()>, usize)>, ParseError> {
    trace!("try_parse_req: {:?}", String::from_utf8_lossy(buf));

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parser = httparse::Request::new(&mut headers);

    let status = parser.parse(buf).map_err(ParseError::from_httparse)?;

    let len = match status {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    // invariant: a complete parse has all of these.
    let (method, path, version) = match (parser.method, parser.path, parser.version) {
        (Some(m), Some(p), Some(v)) => (m, p, v),
        _ => return Err(ParseError::MalformedRequestLine),
    };

    if !ALLOWED_METHODS.contains(&method) {
        return Err(ParseError::UnsupportedMethod);
    }

    let method = Method::from_bytes(method.as_bytes()).map_err(|_| ParseError::UnsupportedMethod)?;

    let uri = http::Uri::from_str(path).map_err(|_| ParseError::MalformedRequestLine)?;

    let mut bld = http::Request::builder()
        .method(method)
        .uri(uri)
        .version(if version == 1 {
            Version::HTTP_11
        } else {
            Version::HTTP_10
        });

    for head in parser.headers.iter() {
        let name = HeaderName::from_bytes(head.name.as_bytes());
        let value = HeaderValue::from_bytes(head.value);
        match (name, value) {
            (Ok(name), Ok(value)) => bld = bld.header(name, value),
            (Err(e), _) => {
                debug!("Dropping bad header name: {}", e);
            }
            (Ok(name), Err(e)) => {
                debug!("Dropping bad header value ({}): {}", name, e);
            }
        }
    }

    let built = bld.body(()).map_err(|_| ParseError::MalformedHeader)?;

    debug!("try_parse_req success: {:?}", built);

    Ok(Some((built, len)))
}

/// Read `content-length` from the headers. Absent means 0.
///
/// Repeated headers must agree, as per RFC 7230 3.3.2.
pub fn content_length(headers: &HeaderMap) -> Result<u64, ParseError> {
    let mut found: Option<u64> = None;

    for value in headers.get_all(http::header::CONTENT_LENGTH) {
        let n = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or(ParseError::InvalidContentLength)?;

        match found {
            Some(prev) if prev != n => return Err(ParseError::InvalidContentLength),
            _ => found = Some(n),
        }
    }

    Ok(found.unwrap_or(0))
}

/// Tells whether the client wants the connection to be reused after this request.
pub fn allow_reuse(headers: &HeaderMap, version: Version) -> bool {
    if version == Version::HTTP_11 {
        is_keep_alive(headers, true)
    } else {
        is_keep_alive(headers, false)
    }
}

fn is_keep_alive(headers: &HeaderMap, default: bool) -> bool {
    headers
        .get(http::header::CONNECTION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            // Connection is a token list, e.g. "keep-alive, Upgrade"
            for token in h.split(',').map(str::trim) {
                if token.eq_ignore_ascii_case("keep-alive") {
                    return Some(true);
                } else if token.eq_ignore_ascii_case("close") {
                    return Some(false);
                }
            }
            None
        })
        .unwrap_or(default)
}

/// Write an http/1.x response, head and body, to the end of `out`.
///
/// `content-length` is added when missing and `connection` is set from `keep_alive`.
/// With `head_only` the body is left out (response to HEAD).
#[allow(clippy::write_with_newline)]
pub fn write_http1x_res(
    res: &http::Response<Vec<u8>>,
    version: Version,
    keep_alive: bool,
    head_only: bool,
    out: &mut Vec<u8>,
) {
    let start = out.len();

    let ver = match version {
        Version::HTTP_10 => "1.0",
        _ => "1.1",
    };

    // writes to a Vec<u8> can't fail.
    let _ = write!(
        out,
        "HTTP/{} {} {}\r\n",
        ver,
        res.status().as_u16(),
        res.status().canonical_reason().unwrap_or("Unknown")
    );

    let mut has_clen = false;

    for (name, value) in res.headers() {
        if name == http::header::CONNECTION {
            // we decide that.
            continue;
        }
        if name == http::header::CONTENT_LENGTH {
            has_clen = true;
        }
        let _ = write!(out, "{}: ", name);
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    if !has_clen && !no_body_status(res.status()) {
        let _ = write!(out, "content-length: {}\r\n", res.body().len());
    }

    let _ = write!(
        out,
        "connection: {}\r\n\r\n",
        if keep_alive { "keep-alive" } else { "close" }
    );

    debug!(
        "write_http11_res: {:?}",
        String::from_utf8_lossy(&out[start..])
    );

    if !head_only && !no_body_status(res.status()) {
        out.extend_from_slice(res.body());
    }
}

// https://tools.ietf.org/html/rfc7230#page-31
// any response with a 1xx (Informational), 204 (No Content), or
// 304 (Not Modified) status code is always terminated by the first
// empty line after the header fields
fn no_body_status(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

/// A plain-text response with the status reason as body.
pub fn error_response(status: StatusCode) -> http::Response<Vec<u8>> {
    let body = status.canonical_reason().unwrap_or("Error").as_bytes().to_vec();

    let mut res = http::Response::new(body);
    *res.status_mut() = status;
    res.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain"),
    );

    res
}
