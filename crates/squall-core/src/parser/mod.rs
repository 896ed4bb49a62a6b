//! HTTP/1.1 request-head parser.
//!
//! Offset-based: the parse result owns nothing and borrows nothing, it
//! records where the interesting spans live inside the connection buffer.
//! The dispatch path reads method and path straight out of the buffer; only
//! the dynamic path copies them into an owned request.

mod method;

pub use method::Method;

use crate::{Error, Result};

/// Maximum number of headers to parse
pub const MAX_HEADERS: usize = 64;

/// Maximum buffered head bytes before the request is rejected
pub const MAX_HEAD: usize = 16 * 1024;

/// Header offsets: [name_start, name_end, value_start, value_end] per header
pub type HeaderOffsets = [u32; MAX_HEADERS * 4];

/// HTTP protocol version of the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// Parsed request head - all offsets into the connection buffer, no copies.
#[derive(Debug, Clone, Copy)]
pub struct ParsedRequest {
    /// HTTP method
    pub method: Method,
    /// Protocol version
    pub version: Version,
    /// Path start offset
    pub path_start: u32,
    /// Path end offset
    pub path_end: u32,
    /// Query start offset (0 if none)
    pub query_start: u32,
    /// Query end offset (0 if none)
    pub query_end: u32,
    /// Number of headers parsed
    pub headers_count: u32,
    /// Body start offset
    pub body_start: u32,
}

impl ParsedRequest {
    /// Request path, without the query string.
    pub fn path<'a>(&self, buf: &'a [u8]) -> &'a str {
        std::str::from_utf8(&buf[self.path_start as usize..self.path_end as usize])
            .unwrap_or("/")
    }

    /// Query string, without the leading `?`.
    pub fn query<'a>(&self, buf: &'a [u8]) -> Option<&'a str> {
        if self.query_end == 0 {
            return None;
        }
        std::str::from_utf8(&buf[self.query_start as usize..self.query_end as usize]).ok()
    }
}

fn malformed(what: &str) -> Error {
    Error::MalformedRequest(what.to_string())
}

/// Parse one request head out of `buf`.
///
/// Returns `Ok(None)` while the head is still incomplete. The terminator is
/// located first, so a malformed line is only reported once the peer has
/// sent the whole head.
pub fn parse(buf: &[u8], offsets: &mut HeaderOffsets) -> Result<Option<ParsedRequest>> {
    let head_end = match buf.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(pos) => pos,
        None => {
            if buf.len() > MAX_HEAD {
                return Err(Error::HeadTooLarge {
                    size: buf.len(),
                    limit: MAX_HEAD,
                });
            }
            return Ok(None);
        }
    };
    if head_end > MAX_HEAD {
        return Err(Error::HeadTooLarge {
            size: head_end,
            limit: MAX_HEAD,
        });
    }

    let head = &buf[..head_end];
    let line_end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(head.len());
    let line = &head[..line_end];

    let sp1 = line
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| malformed("request line"))?;
    let sp2 = line
        .iter()
        .rposition(|&b| b == b' ')
        .filter(|&pos| pos > sp1)
        .ok_or_else(|| malformed("request line"))?;

    let method = Method::parse(&line[..sp1])
        .ok_or_else(|| Error::InvalidMethod(String::from_utf8_lossy(&line[..sp1]).into_owned()))?;
    let version = match &line[sp2 + 1..] {
        b"HTTP/1.1" => Version::Http11,
        b"HTTP/1.0" => Version::Http10,
        _ => return Err(malformed("unsupported version")),
    };

    let target = &line[sp1 + 1..sp2];
    if target.first() != Some(&b'/') {
        return Err(malformed("request target"));
    }
    std::str::from_utf8(target).map_err(|_| malformed("non-utf8 target"))?;

    let target_start = sp1 + 1;
    let (path_end, query_start, query_end) =
        match target.iter().position(|&b| b == b'?') {
            Some(q) => (target_start + q, target_start + q + 1, sp2),
            None => (sp2, 0, 0),
        };

    let mut headers_count = 0u32;
    let mut pos = if line_end < head.len() { line_end + 2 } else { head.len() };
    while pos < head_end {
        let rel_end = buf[pos..head_end]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map_or(head_end, |rel| pos + rel);
        let line = &buf[pos..rel_end];
        if headers_count as usize >= MAX_HEADERS {
            return Err(malformed("too many headers"));
        }
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .filter(|&c| c > 0)
            .ok_or_else(|| malformed("header line"))?;

        let mut value_start = pos + colon + 1;
        let mut value_end = rel_end;
        while value_start < value_end
            && (buf[value_start] == b' ' || buf[value_start] == b'\t')
        {
            value_start += 1;
        }
        while value_end > value_start
            && (buf[value_end - 1] == b' ' || buf[value_end - 1] == b'\t')
        {
            value_end -= 1;
        }

        let o = headers_count as usize * 4;
        offsets[o] = pos as u32;
        offsets[o + 1] = (pos + colon) as u32;
        offsets[o + 2] = value_start as u32;
        offsets[o + 3] = value_end as u32;
        headers_count += 1;
        pos = rel_end + 2;
    }

    Ok(Some(ParsedRequest {
        method,
        version,
        path_start: target_start as u32,
        path_end: path_end as u32,
        query_start: query_start as u32,
        query_end: query_end as u32,
        headers_count,
        body_start: (head_end + 4) as u32,
    }))
}

/// Look up a header value by case-insensitive name.
pub fn header_value<'a>(
    buf: &'a [u8],
    offsets: &HeaderOffsets,
    headers_count: u32,
    name: &str,
) -> Option<&'a [u8]> {
    let name = name.as_bytes();
    for i in 0..headers_count as usize {
        let o = i * 4;
        let header_name = &buf[offsets[o] as usize..offsets[o + 1] as usize];
        if header_name.eq_ignore_ascii_case(name) {
            return Some(&buf[offsets[o + 2] as usize..offsets[o + 3] as usize]);
        }
    }
    None
}

/// Declared body length; absent means zero, unparsable is malformed.
pub fn content_length(buf: &[u8], offsets: &HeaderOffsets, headers_count: u32) -> Result<usize> {
    match header_value(buf, offsets, headers_count, "content-length") {
        None => Ok(0),
        Some(value) => std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| malformed("content-length")),
    }
}

/// Keep-alive decision from the version default and the connection header.
pub fn keep_alive(version: Version, connection: Option<&[u8]>) -> bool {
    match connection {
        Some(value) if value.eq_ignore_ascii_case(b"close") => false,
        Some(value) if value.eq_ignore_ascii_case(b"keep-alive") => true,
        _ => version == Version::Http11,
    }
}
