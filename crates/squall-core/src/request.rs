//! HTTP Request types

use crate::parser::{HeaderOffsets, Method, ParsedRequest, Version};
use smallvec::SmallVec;
use std::collections::HashMap;

/// HTTP Request
///
/// Owned snapshot of one request. Dynamic responders receive this copy, not
/// a view into the connection buffer: the buffer is recycled for the next
/// request while user logic may still be running.
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method
    pub method: Method,
    /// Protocol version
    pub version: Version,
    /// Request path (without query string)
    pub path: String,
    /// Query string (without leading ?)
    pub query: Option<String>,
    /// Request headers (stack-allocated for small header counts)
    pub headers: SmallVec<[(String, String); 16]>,
    /// Request body
    pub body: bytes::Bytes,
    /// Route parameters (populated by the dispatch engine)
    pub params: HashMap<String, String>,
}

impl Request {
    /// Create a new request
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            version: Version::Http11,
            path: path.into(),
            query: None,
            headers: SmallVec::new(),
            body: bytes::Bytes::new(),
            params: HashMap::new(),
        }
    }

    /// Copy the essential request data out of the connection buffer.
    /// Headers that are not valid UTF-8 are skipped.
    pub fn from_parsed(
        buf: &[u8],
        parsed: &ParsedRequest,
        offsets: &HeaderOffsets,
        params: HashMap<String, String>,
        body: bytes::Bytes,
    ) -> Self {
        let mut headers = SmallVec::new();
        for i in 0..parsed.headers_count as usize {
            let o = i * 4;
            let name = &buf[offsets[o] as usize..offsets[o + 1] as usize];
            let value = &buf[offsets[o + 2] as usize..offsets[o + 3] as usize];
            if let (Ok(name), Ok(value)) =
                (std::str::from_utf8(name), std::str::from_utf8(value))
            {
                headers.push((name.to_string(), value.to_string()));
            }
        }
        Self {
            method: parsed.method,
            version: parsed.version,
            path: parsed.path(buf).to_string(),
            query: parsed.query(buf).map(str::to_string),
            headers,
            body,
            params,
        }
    }

    /// Get a header value (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Get content-type header
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Get content-length header
    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }

    /// Get a route parameter
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|s| s.as_str())
    }

    /// Parse query string into key-value pairs
    pub fn query_params(&self) -> HashMap<String, String> {
        let mut params = HashMap::new();
        if let Some(query) = &self.query {
            for pair in query.split('&') {
                if let Some((key, value)) = pair.split_once('=') {
                    params.insert(urlencoding_decode(key), urlencoding_decode(value));
                }
            }
        }
        params
    }
}

/// Builder for constructing requests
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    /// Create a new builder
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            request: Request::new(method, path),
        }
    }

    /// Set query string
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.request.query = Some(query.into());
        self
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.headers.push((name.into(), value.into()));
        self
    }

    /// Set body
    pub fn body(mut self, body: impl Into<bytes::Bytes>) -> Self {
        self.request.body = body.into();
        self
    }

    /// Set route params
    pub fn params(mut self, params: HashMap<String, String>) -> Self {
        self.request.params = params;
        self
    }

    /// Build the request
    pub fn build(self) -> Request {
        self.request
    }
}

/// Simple URL decoding (no external dependency)
fn urlencoding_decode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '%' {
            let hex: String = chars.by_ref().take(2).collect();
            if hex.len() == 2 {
                if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                    result.push(byte as char);
                    continue;
                }
            }
            result.push('%');
            result.push_str(&hex);
        } else if c == '+' {
            result.push(' ');
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{self, MAX_HEADERS};

    #[test]
    fn test_request_header() {
        let req = RequestBuilder::new(Method::Get, "/")
            .header("Content-Type", "application/json")
            .build();

        assert_eq!(req.header("content-type"), Some("application/json"));
        assert_eq!(req.header("CONTENT-TYPE"), Some("application/json"));
    }

    #[test]
    fn test_query_params() {
        let req = RequestBuilder::new(Method::Get, "/")
            .query("foo=bar&baz=qux%20quux")
            .build();

        let params = req.query_params();
        assert_eq!(params.get("foo"), Some(&"bar".to_string()));
        assert_eq!(params.get("baz"), Some(&"qux quux".to_string()));
    }

    #[test]
    fn test_from_parsed_copies_everything() {
        let raw = b"POST /users?active=1 HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\n\r\nhi";
        let mut offsets = [0u32; MAX_HEADERS * 4];
        let parsed = parser::parse(raw, &mut offsets).unwrap().unwrap();

        let body_start = parsed.body_start as usize;
        let body = bytes::Bytes::copy_from_slice(&raw[body_start..]);
        let req = Request::from_parsed(raw, &parsed, &offsets, HashMap::new(), body);

        assert_eq!(req.method, Method::Post);
        assert_eq!(req.path, "/users");
        assert_eq!(req.query.as_deref(), Some("active=1"));
        assert_eq!(req.header("host"), Some("x"));
        assert_eq!(req.content_length(), Some(2));
        assert_eq!(&req.body[..], b"hi");
    }

    #[test]
    fn test_param() {
        let mut params = HashMap::new();
        params.insert("id".to_string(), "42".to_string());
        let req = RequestBuilder::new(Method::Get, "/users/42").params(params).build();
        assert_eq!(req.param("id"), Some("42"));
        assert_eq!(req.param("other"), None);
    }
}
