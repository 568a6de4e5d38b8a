//! HTTP/1.1 responses.
//!
//! A [`Response`] has two serialized forms:
//!
//! - [`Response::encode`] / [`Response::decode`]: the verbatim form used for
//!   cache entries. Status line, headers (in received order) and body are
//!   written exactly as they are held, so decoding an encoded response gives
//!   back an identical value.
//! - [`Response::into_bytes`]: the form written to a downstream client,
//!   which takes over connection management and length framing.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::chunked::{self, ChunkedError};
use super::{Headers, Method, StatusCode};

/// Errors that can occur while parsing an HTTP/1.1 response.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("response head is incomplete — more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid status code {0}")]
    InvalidStatus(u16),

    #[error("invalid Content-Length header: {0:?}")]
    InvalidContentLength(String),

    #[error("invalid chunked body: {0}")]
    Chunked(#[from] ChunkedError),

    #[error("body truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("chunked body ended before the last chunk")]
    UnterminatedChunked,
}

/// How a response body is delimited on the wire (RFC 9112 §6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// The response has no body.
    Empty,
    /// Exactly this many bytes follow the head.
    Length(usize),
    /// The body uses chunked transfer coding.
    Chunked,
    /// The body runs until the connection closes.
    UntilClose,
}

/// An HTTP/1.1 response.
///
/// # Examples
///
/// ```
/// use cacheproxy::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::OK)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: StatusCode,
    reason: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    body: Bytes,
    keep_alive: bool,
}

impl Response {
    /// Maximum number of headers accepted in a parsed response.
    const MAX_HEADERS: usize = 96;

    /// Creates a new HTTP/1.1 response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: status.canonical_reason().unwrap_or_default().to_owned(),
            version: 1,
            headers: Headers::new(),
            body: Bytes::new(),
            keep_alive: true,
        }
    }

    /// Creates a `text/plain` response, as used for locally generated errors.
    pub fn text(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(message.into())
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place, for callers decorating a response they
    /// received from elsewhere.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.headers.insert(name, value);
    }

    /// Sets the response body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets the HTTP minor version (0 for HTTP/1.0, 1 for HTTP/1.1).
    #[must_use]
    pub fn with_version(mut self, minor: u8) -> Self {
        self.version = minor;
        self
    }

    /// Replaces the reason phrase, e.g. with a non-canonical one received
    /// from an origin.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Controls whether `Connection: keep-alive` or `Connection: close` is
    /// written by [`into_bytes`](Self::into_bytes).
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the reason phrase as received (may be empty).
    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns the body bytes.
    pub fn payload(&self) -> &Bytes {
        &self.body
    }

    /// Replaces the body bytes without touching any header.
    pub fn set_payload(&mut self, body: Bytes) {
        self.body = body;
    }

    /// Parses a response head from the start of `buf`.
    ///
    /// Returns the response (with an empty body) and the offset at which the
    /// body begins.
    ///
    /// # Errors
    ///
    /// - [`ResponseError::Incomplete`] — the head is not complete yet.
    /// - [`ResponseError::Parse`] — the data is not an HTTP/1.x response.
    /// - [`ResponseError::InvalidStatus`] — the status code is out of range.
    pub fn parse_head(buf: &[u8]) -> Result<(Self, usize), ResponseError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw = httparse::Response::new(&mut headers);

        let body_offset = match raw.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(ResponseError::Incomplete),
        };

        let code = raw
            .code
            .ok_or(ResponseError::MissingField { field: "status" })?;
        let status = StatusCode::from_u16(code).ok_or(ResponseError::InvalidStatus(code))?;
        let version = raw
            .version
            .ok_or(ResponseError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw.headers.len());
        for header in raw.headers.iter() {
            header_map.insert(header.name, header.value);
        }

        Ok((
            Self {
                status,
                reason: raw.reason.unwrap_or_default().to_owned(),
                version,
                headers: header_map,
                body: Bytes::new(),
                keep_alive: true,
            },
            body_offset,
        ))
    }

    /// Works out how this response's body is delimited, given the method of
    /// the request it answers.
    ///
    /// # Errors
    ///
    /// Returns [`ResponseError::InvalidContentLength`] for a non-numeric
    /// `Content-Length`.
    pub fn framing(&self, request_method: &Method) -> Result<Framing, ResponseError> {
        if *request_method == Method::Head || self.status.forbids_body() {
            return Ok(Framing::Empty);
        }
        if self.headers.has_token("transfer-encoding", "chunked") {
            return Ok(Framing::Chunked);
        }
        match self.headers.get_bytes("content-length") {
            Some(raw) => std::str::from_utf8(raw)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .map(Framing::Length)
                .ok_or_else(|| {
                    ResponseError::InvalidContentLength(String::from_utf8_lossy(raw).into_owned())
                }),
            None => Ok(Framing::UntilClose),
        }
    }

    /// Parses a complete response (head and body) previously produced by
    /// [`encode`](Self::encode) or read off the wire.
    ///
    /// # Errors
    ///
    /// Fails rather than returning a partial response: a head that does not
    /// parse, or a body shorter than its framing declares, is an error.
    pub fn decode(buf: &Bytes, request_method: &Method) -> Result<Self, ResponseError> {
        let (mut response, offset) = Self::parse_head(buf)?;
        let rest = buf.slice(offset..);

        response.body = match response.framing(request_method)? {
            Framing::Empty => Bytes::new(),
            Framing::Length(expected) => {
                if rest.len() < expected {
                    return Err(ResponseError::Truncated {
                        expected,
                        actual: rest.len(),
                    });
                }
                rest.slice(..expected)
            }
            Framing::Chunked => {
                chunked::decode(&rest)?
                    .ok_or(ResponseError::UnterminatedChunked)?
                    .body
            }
            Framing::UntilClose => rest,
        };

        Ok(response)
    }

    /// Serializes the response verbatim: status line, headers as held, blank
    /// line, body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.headers.len() * 48 + self.body.len());
        buf.put(
            format!(
                "HTTP/1.{} {} {}\r\n",
                self.version,
                self.status.as_u16(),
                self.reason
            )
            .as_bytes(),
        );
        self.headers.write_to(&mut buf);
        buf.put(&b"\r\n"[..]);
        buf.put(self.body.as_ref());
        buf.freeze()
    }

    /// Serializes the response for a downstream HTTP/1.1 client.
    ///
    /// The body is always sent in full, so any `Transfer-Encoding` or
    /// `Connection` header is replaced:
    /// - `Content-Length: <n>` is added unless already present or the status
    ///   forbids a body.
    /// - `Connection: keep-alive` or `Connection: close` is written last.
    pub fn into_bytes(mut self) -> BytesMut {
        self.headers.remove("transfer-encoding");
        self.headers.remove("connection");

        if !self.status.forbids_body() && !self.headers.contains("content-length") {
            self.headers
                .insert("Content-Length", self.body.len().to_string());
        }

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.insert("Connection", connection);

        let estimated_size = 128 + self.headers.len() * 64 + self.body.len();
        let mut buf = BytesMut::with_capacity(estimated_size);

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.reason
            )
            .as_bytes(),
        );
        self.headers.write_to(&mut buf);
        buf.put(&b"\r\n"[..]);
        buf.put(self.body);

        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn simple_ok_response() {
        let r = Response::new(StatusCode::OK).body("Hello");
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nHello"));
    }

    #[test]
    fn existing_content_length_is_kept() {
        // A HEAD answer: the length describes the resource, not this message.
        let r = Response::new(StatusCode::OK).header("Content-Length", "42");
        let s = to_string(r.into_bytes());
        assert_eq!(s.matches("Content-Length").count(), 1);
        assert!(s.contains("Content-Length: 42\r\n"));
    }

    #[test]
    fn no_length_for_no_content() {
        let r = Response::new(StatusCode::NO_CONTENT);
        let s = to_string(r.into_bytes());
        assert!(!s.contains("Content-Length"));
    }

    #[test]
    fn connection_close() {
        let r = Response::new(StatusCode::OK)
            .header("Connection", "keep-alive")
            .keep_alive(false);
        let s = to_string(r.into_bytes());
        assert!(s.contains("Connection: close\r\n"));
        assert!(!s.contains("keep-alive"));
    }

    #[test]
    fn encode_is_verbatim() {
        let raw = Bytes::from_static(
            b"HTTP/1.1 201 Made It\r\nX-B: 2\r\nx-a: 1\r\nContent-Length: 3\r\n\r\nabc",
        );
        let response = Response::decode(&raw, &Method::Get).unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.reason(), "Made It");
        assert_eq!(&response.payload()[..], b"abc");
        assert_eq!(response.encode(), raw);
    }

    #[test]
    fn obs_text_header_values_survive_encoding() {
        let raw = Bytes::from_static(
            b"HTTP/1.1 200 OK\r\nX-Latin: caf\xe9\r\nContent-Length: 2\r\n\r\nok",
        );
        let response = Response::decode(&raw, &Method::Get).unwrap();
        assert_eq!(response.headers().get_bytes("x-latin"), Some(&b"caf\xe9"[..]));
        assert_eq!(response.encode(), raw);

        let wire = response.into_bytes();
        let line = b"X-Latin: caf\xe9\r\n";
        assert!(wire.windows(line.len()).any(|w| w == line));
    }

    #[test]
    fn decode_rejects_truncated_body() {
        let raw = Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort");
        assert!(matches!(
            Response::decode(&raw, &Method::Get),
            Err(ResponseError::Truncated {
                expected: 10,
                actual: 5
            })
        ));
    }

    #[test]
    fn decode_rejects_garbage() {
        let raw = Bytes::from_static(b"\x00\x01 not http");
        assert!(Response::decode(&raw, &Method::Get).is_err());
        let partial = Bytes::from_static(b"HTTP/1.1 200 OK\r\nX-A:");
        assert!(matches!(
            Response::decode(&partial, &Method::Get),
            Err(ResponseError::Incomplete)
        ));
    }

    #[test]
    fn decode_chunked() {
        let raw =
            Bytes::from_static(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\n\r\n");
        let response = Response::decode(&raw, &Method::Get).unwrap();
        assert_eq!(&response.payload()[..], b"hi");

        let cut = Bytes::from_static(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhi\r\n");
        assert!(matches!(
            Response::decode(&cut, &Method::Get),
            Err(ResponseError::UnterminatedChunked)
        ));
    }

    #[test]
    fn framing_rules() {
        let (head, _) =
            Response::parse_head(b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\n").unwrap();
        assert_eq!(head.framing(&Method::Get).unwrap(), Framing::Length(7));
        assert_eq!(head.framing(&Method::Head).unwrap(), Framing::Empty);

        let (head, _) = Response::parse_head(b"HTTP/1.0 200 OK\r\n\r\n").unwrap();
        assert_eq!(head.framing(&Method::Get).unwrap(), Framing::UntilClose);

        let (head, _) = Response::parse_head(b"HTTP/1.1 304 Not Modified\r\n\r\n").unwrap();
        assert_eq!(head.framing(&Method::Get).unwrap(), Framing::Empty);
    }

    #[test]
    fn unknown_status_survives() {
        let raw = Bytes::from_static(b"HTTP/1.1 299 \r\nContent-Length: 0\r\n\r\n");
        let response = Response::decode(&raw, &Method::Get).unwrap();
        assert_eq!(response.status().as_u16(), 299);
        assert_eq!(response.encode(), raw);
    }
}
