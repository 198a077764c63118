//! HTTP Parser for MITM Inspection
//!
//! Lightweight HTTP/1.1 parser for the decrypted exchange.
//! Used for tunnel-request detection, logging, and header rewriting.
//! Parsed messages keep header order and casing so they serialize back
//! byte-for-byte apart from deliberate edits.

use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode};
use thiserror::Error;

/// Port assumed when neither the Host header nor the tunnel target names one
pub const DEFAULT_TLS_PORT: u16 = 443;

/// HTTP parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid HTTP format")]
    InvalidFormat,

    #[error("Incomplete HTTP message")]
    Incomplete,

    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    #[error("Invalid status code: {0}")]
    InvalidStatusCode(String),

    #[error("Header parse error: {0}")]
    InvalidHeader(String),

    #[error("Invalid authority: {0}")]
    InvalidAuthority(String),

    #[error("UTF-8 decode error")]
    Utf8Error,
}

impl ParseError {
    /// More bytes may turn this input into a valid message
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ParseError::Incomplete)
    }
}

/// Ordered header list with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Append a header, keeping any existing values
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every value of `name` with a single one, in place of the first occurrence
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some(first) => {
                self.entries[first].1 = value;
                let mut index = 0;
                self.entries.retain(|(key, _)| {
                    let keep = index <= first || !key.eq_ignore_ascii_case(name);
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn content_length(&self) -> Option<usize> {
        self.get("content-length").and_then(|v| v.trim().parse().ok())
    }

    fn write_to(&self, out: &mut BytesMut) {
        for (key, value) in &self.entries {
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
    }
}

/// Parsed HTTP request
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// HTTP method (GET, POST, CONNECT, etc.)
    pub method: Method,

    /// Request target (/path?query, or host:port for CONNECT)
    pub target: String,

    /// HTTP version (HTTP/1.1, HTTP/1.0)
    pub version: String,

    /// Request headers
    pub headers: Headers,

    /// Bytes after the header block
    pub body: Bytes,

    /// Length of the start line and header block including the blank line
    pub header_len: usize,
}

/// Parsed HTTP response
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// HTTP version (HTTP/1.1)
    pub version: String,

    /// Status code (200, 404, etc.)
    pub status: StatusCode,

    /// Reason phrase (OK, Not Found, etc.)
    pub reason: String,

    /// Response headers
    pub headers: Headers,

    /// Bytes after the header block
    pub body: Bytes,

    /// Length of the status line and header block including the blank line
    pub header_len: usize,
}

/// Either side of an HTTP exchange
#[derive(Debug, Clone, PartialEq)]
pub enum HttpMessage {
    Request(HttpRequest),
    Response(HttpResponse),
}

impl HttpMessage {
    /// Parse raw bytes, treating a leading `HTTP/` as a status line
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.starts_with(b"HTTP/") {
            parse_http1_response(data).map(HttpMessage::Response)
        } else {
            parse_http1_request(data).map(HttpMessage::Request)
        }
    }

    pub fn headers(&self) -> &Headers {
        match self {
            HttpMessage::Request(req) => &req.headers,
            HttpMessage::Response(resp) => &resp.headers,
        }
    }

    pub fn body(&self) -> &Bytes {
        match self {
            HttpMessage::Request(req) => &req.body,
            HttpMessage::Response(resp) => &resp.body,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            HttpMessage::Request(req) => req.to_bytes(),
            HttpMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

/// Parse HTTP/1.1 request from bytes
///
/// Expects format:
/// ```text
/// METHOD /path HTTP/1.1\r\n
/// Header: Value\r\n
/// \r\n
/// [body]
/// ```
pub fn parse_http1_request(data: &[u8]) -> Result<HttpRequest, ParseError> {
    let (lines, header_len) = split_head(data)?;

    // Parse request line: METHOD /path HTTP/1.1
    let parts: Vec<&str> = lines[0].split_whitespace().collect();
    if parts.len() != 3 || !parts[2].starts_with("HTTP/") {
        return Err(ParseError::InvalidFormat);
    }

    if !is_valid_method(parts[0]) {
        return Err(ParseError::InvalidMethod(parts[0].to_string()));
    }
    let method = Method::from_bytes(parts[0].as_bytes())
        .map_err(|_| ParseError::InvalidMethod(parts[0].to_string()))?;

    let headers = parse_headers(&lines[1..])?;

    Ok(HttpRequest {
        method,
        target: parts[1].to_string(),
        version: parts[2].to_string(),
        headers,
        body: Bytes::copy_from_slice(&data[header_len..]),
        header_len,
    })
}

/// Parse HTTP/1.1 response from bytes
///
/// Expects format:
/// ```text
/// HTTP/1.1 200 OK\r\n
/// Header: Value\r\n
/// \r\n
/// [body]
/// ```
pub fn parse_http1_response(data: &[u8]) -> Result<HttpResponse, ParseError> {
    let (lines, header_len) = split_head(data)?;

    // Parse status line: HTTP/1.1 200 OK
    let parts: Vec<&str> = lines[0].splitn(3, ' ').collect();
    if parts.len() < 2 || !parts[0].starts_with("HTTP/") {
        return Err(ParseError::InvalidFormat);
    }

    let status = parts[1]
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| ParseError::InvalidStatusCode(parts[1].to_string()))?;
    let reason = parts.get(2).map(|r| r.trim().to_string()).unwrap_or_default();

    let headers = parse_headers(&lines[1..])?;

    Ok(HttpResponse {
        version: parts[0].to_string(),
        status,
        reason,
        headers,
        body: Bytes::copy_from_slice(&data[header_len..]),
        header_len,
    })
}

/// Split the start line and header lines off the message head
///
/// Returns (lines, offset of the first body byte)
fn split_head(data: &[u8]) -> Result<(Vec<&str>, usize), ParseError> {
    let header_end = find_header_end(data).ok_or(ParseError::Incomplete)?;

    // Headers are always ASCII/UTF-8
    let text = std::str::from_utf8(&data[..header_end]).map_err(|_| ParseError::Utf8Error)?;
    let lines: Vec<&str> = text.split("\r\n").collect();
    if lines.is_empty() || lines[0].is_empty() {
        return Err(ParseError::InvalidFormat);
    }

    Ok((lines, header_end + 4))
}

/// Parse `Name: Value` lines
fn parse_headers(lines: &[&str]) -> Result<Headers, ParseError> {
    let mut headers = Headers::new();

    for line in lines {
        match line.find(':') {
            Some(colon_pos) if colon_pos > 0 => {
                let name = line[..colon_pos].trim();
                let value = line[colon_pos + 1..].trim();
                headers.append(name, value);
            }
            _ => return Err(ParseError::InvalidHeader(line.to_string())),
        }
    }

    Ok(headers)
}

/// Find the end of HTTP headers (position before \r\n\r\n)
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Check if method is valid
fn is_valid_method(method: &str) -> bool {
    matches!(
        method,
        "GET" | "POST" | "PUT" | "DELETE" | "HEAD" | "OPTIONS" | "PATCH" | "CONNECT" | "TRACE"
    )
}

/// Parse and validate an authority (host:port)
///
/// A missing port falls back to `default_port`. Brackets are stripped from
/// IPv6 literals such as `[::1]:443`.
pub fn parse_authority(authority: &str, default_port: u16) -> Result<(String, u16), ParseError> {
    let authority = authority.trim();
    let invalid = || ParseError::InvalidAuthority(authority.to_string());

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        // IPv6 literal
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match tail {
            "" => default_port,
            _ => tail
                .strip_prefix(':')
                .and_then(|p| p.parse::<u16>().ok())
                .ok_or_else(invalid)?,
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (authority, default_port),
        }
    };

    if host.is_empty() || port == 0 {
        return Err(invalid());
    }

    Ok((host.to_string(), port))
}

impl HttpRequest {
    /// Get Host header host part, or the CONNECT target host
    pub fn host(&self) -> Option<String> {
        self.authority().map(|(host, _)| host)
    }

    /// Port from the Host header or the CONNECT target, 443 when absent
    pub fn port(&self) -> u16 {
        self.authority()
            .map(|(_, port)| port)
            .unwrap_or(DEFAULT_TLS_PORT)
    }

    /// Target (host, port) of this request
    pub fn authority(&self) -> Option<(String, u16)> {
        if self.is_connect() {
            return parse_authority(&self.target, DEFAULT_TLS_PORT).ok();
        }
        self.headers
            .get("host")
            .and_then(|host| parse_authority(host, DEFAULT_TLS_PORT).ok())
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// Get Content-Type header
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    /// Content-Length header value, if present and numeric
    pub fn content_length(&self) -> Option<usize> {
        self.headers.content_length()
    }

    /// Serialize back to wire format
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.header_len + self.body.len() + 32);
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.extend_from_slice(b" ");
        out.extend_from_slice(self.target.as_bytes());
        out.extend_from_slice(b" ");
        out.extend_from_slice(self.version.as_bytes());
        out.extend_from_slice(b"\r\n");
        self.headers.write_to(&mut out);
        out.extend_from_slice(&self.body);
        out.freeze()
    }
}

impl HttpResponse {
    /// Get Content-Type header
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    /// Content-Length header value, if present and numeric
    pub fn content_length(&self) -> Option<usize> {
        self.headers.content_length()
    }

    /// Serialize back to wire format
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.header_len + self.body.len() + 32);
        out.extend_from_slice(self.version.as_bytes());
        out.extend_from_slice(b" ");
        out.extend_from_slice(self.status.as_str().as_bytes());
        if !self.reason.is_empty() {
            out.extend_from_slice(b" ");
            out.extend_from_slice(self.reason.as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        self.headers.write_to(&mut out);
        out.extend_from_slice(&self.body);
        out.freeze()
    }
}
