//! Incremental framing of one request out of an append-only byte buffer.
//!
//! Bytes are appended as they come off the wire. The framer finds the end of the
//! request head without rescanning what it already looked at, parses the head once,
//! and then waits for exactly `content-length` body bytes.
//!
//! ```
//! use h1_reactor::framer::Framer;
//!
//! let mut f = Framer::new(64 * 1024, 1024 * 1024);
//!
//! f.push(b"POST /up HTTP/1.1\r\nContent-Length: 5\r\n");
//! assert!(f.should_read_more());
//!
//! f.push(b"\r\nHEL");
//! assert!(f.should_parse_top_part());
//! f.parse_top_part().unwrap();
//! assert_eq!(f.bytes_to_read(), 2);
//!
//! f.push(b"LO");
//! assert!(!f.should_read_more());
//! f.parse_bottom_part().unwrap();
//!
//! let (head, body) = f.take_parsed().unwrap();
//! assert_eq!(head.uri(), "/up");
//! assert_eq!(body.unwrap(), b"HELLO");
//! ```

use crate::error::ParseError;
use crate::http11::{content_length, try_parse_req};
use crate::transport::IoStatus;

/// Cursor value once the blank line has been seen.
const FOUND: isize = -1;

/// Framing state for the request currently being received on a connection.
#[derive(Debug)]
pub struct Framer {
    /// Raw bytes read off the wire, possibly including the start of a pipelined request.
    inout: Vec<u8>,
    /// Head of the request once parsed.
    parsed: Option<http::Request<()>>,
    /// Body once the bottom part is parsed.
    body: Option<Vec<u8>>,
    /// Where the next blank-line scan starts. `FOUND` when done.
    blank_line_offset: isize,
    content_length: usize,
    /// Offset in `inout` where the body starts.
    top_part_offset: usize,
    max_header_bytes: usize,
    max_request_bytes: usize,
    scan_work: usize,
}

impl Framer {
    /// Create a framer enforcing the given head and total request limits.
    pub fn new(max_header_bytes: usize, max_request_bytes: usize) -> Self {
        Framer {
            inout: Vec::new(),
            parsed: None,
            body: None,
            blank_line_offset: 0,
            content_length: 0,
            top_part_offset: 0,
            max_header_bytes,
            max_request_bytes,
            scan_work: 0,
        }
    }

    /// Append bytes received from the peer.
    pub fn push(&mut self, bytes: &[u8]) {
        self.inout.extend_from_slice(bytes);
    }

    /// Append up to `want` bytes produced by `read`, which fills the slice it is given.
    pub(crate) fn fill_with<F>(&mut self, want: usize, read: F) -> IoStatus<usize>
    where
        F: FnOnce(&mut [u8]) -> IoStatus<usize>,
    {
        let start = self.inout.len();
        self.inout.resize(start + want, 0);

        let status = read(&mut self.inout[start..]);

        let amount = match &status {
            IoStatus::Done(n) => *n,
            _ => 0,
        };
        self.inout.truncate(start + amount);

        status
    }

    /// Bytes accumulated for this request so far.
    pub fn accumulated(&self) -> usize {
        self.inout.len()
    }

    /// Scan cursor. -1 once the blank line is found.
    pub fn blank_line_offset(&self) -> isize {
        self.blank_line_offset
    }

    /// Total number of byte positions examined by the blank line scan.
    #[doc(hidden)]
    pub fn scan_work(&self) -> usize {
        self.scan_work
    }

    /// `content-length` of the parsed head, 0 before parsing.
    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// Offset where the body starts, 0 before parsing.
    pub fn top_part_offset(&self) -> usize {
        self.top_part_offset
    }

    /// Whether the head has been parsed.
    pub fn has_parsed(&self) -> bool {
        self.parsed.is_some()
    }

    /// Look for `\r\n\r\n` or `\n\n`, resuming where the previous call stopped.
    pub fn found_blank_line(&mut self) -> bool {
        if self.blank_line_offset == FOUND {
            return true;
        }

        let buf = &self.inout;
        let len = buf.len();
        let mut p = self.blank_line_offset as usize;

        while p < len {
            self.scan_work += 1;
            if (p + 3 < len && &buf[p..p + 4] == b"\r\n\r\n")
                || (p + 1 < len && &buf[p..p + 2] == b"\n\n")
            {
                trace!("found blank line at {}", p);
                self.blank_line_offset = FOUND;
                return true;
            }
            p += 1;
        }

        // the terminator may straddle this and the next read.
        let resume = len.saturating_sub(3).max(self.blank_line_offset as usize);
        self.blank_line_offset = resume as isize;

        false
    }

    /// Head grew past the limit without a blank line.
    pub fn head_too_large(&mut self) -> bool {
        !self.found_blank_line() && self.inout.len() > self.max_header_bytes
    }

    /// The head is complete in the buffer but not parsed yet.
    pub fn should_parse_top_part(&mut self) -> bool {
        self.parsed.is_none() && !self.inout.is_empty() && self.found_blank_line()
    }

    /// Parse request line and headers up to and including the blank line.
    pub fn parse_top_part(&mut self) -> Result<(), ParseError> {
        let (req, len) = try_parse_req(&self.inout)?.ok_or(ParseError::MalformedRequestLine)?;

        if len > self.max_header_bytes {
            return Err(ParseError::HeadersTooLarge);
        }

        let clen = content_length(req.headers())?;

        if clen > self.max_request_bytes.saturating_sub(len) as u64 {
            return Err(ParseError::BodyTooLarge);
        }

        self.content_length = clen as usize;
        self.top_part_offset = len;
        self.parsed = Some(req);

        Ok(())
    }

    /// Whether the request needs more bytes from the wire.
    pub fn should_read_more(&mut self) -> bool {
        if self.content_length > 0 {
            let body_read = self.inout.len() - self.top_part_offset;
            return body_read < self.content_length;
        }
        !self.found_blank_line()
    }

    /// Body bytes still missing, or 0 when not yet known.
    pub fn bytes_to_read(&self) -> usize {
        if self.content_length == 0 {
            return 0;
        }
        let body_read = self.inout.len() - self.top_part_offset;
        self.content_length.saturating_sub(body_read)
    }

    /// A parsed head with a body that has fully arrived but isn't sliced out yet.
    pub fn should_parse_bottom_part(&mut self) -> bool {
        self.content_length > 0
            && self.parsed.is_some()
            && self.body.is_none()
            && !self.should_read_more()
    }

    /// Slice exactly `content-length` bytes after the head as the body.
    pub fn parse_bottom_part(&mut self) -> Result<(), ParseError> {
        let start = self.top_part_offset;
        let end = start + self.content_length;

        if self.parsed.is_none() || end > self.inout.len() {
            return Err(ParseError::InvalidContentLength);
        }

        self.body = Some(self.inout[start..end].to_vec());

        Ok(())
    }

    /// Head and body (if there was a bottom part) are both in.
    pub fn is_complete(&self) -> bool {
        self.parsed.is_some() && (self.content_length == 0 || self.body.is_some())
    }

    /// Hand out the parsed head and the body, if any.
    pub fn take_parsed(&mut self) -> Option<(http::Request<()>, Option<Vec<u8>>)> {
        let head = self.parsed.take()?;
        Some((head, self.body.take()))
    }

    /// Version of the request, from the parsed head or else the request line alone.
    ///
    /// Lets a request that failed to frame still be answered in its own version.
    pub fn version(&self) -> Option<http::Version> {
        if let Some(head) = &self.parsed {
            return Some(head.version());
        }

        let end = self.inout.iter().position(|b| *b == b'\n')?;
        let line = &self.inout[..end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        if line.ends_with(b" HTTP/1.0") {
            Some(http::Version::HTTP_10)
        } else if line.ends_with(b" HTTP/1.1") {
            Some(http::Version::HTTP_11)
        } else {
            None
        }
    }

    /// Drop the framed request, keeping any bytes that arrived after it.
    ///
    /// Returns true if such bytes remain.
    pub fn reset(&mut self) -> bool {
        let consumed = if self.top_part_offset > 0 {
            (self.top_part_offset + self.content_length).min(self.inout.len())
        } else {
            // never framed, nothing worth keeping.
            self.inout.len()
        };

        self.inout.drain(..consumed);
        self.parsed = None;
        self.body = None;
        self.blank_line_offset = 0;
        self.content_length = 0;
        self.top_part_offset = 0;

        !self.inout.is_empty()
    }
}
