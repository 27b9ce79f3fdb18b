//! Handler results and the response writer.
//!
//! A [`HandleResult`] is what a handler returns: a status, an optional text
//! body and extra headers. The [`ResponseWriter`] serialises it, always in
//! the same order:
//!
//! ```text
//! HTTP/1.1 200 OK\r\n
//! Content-Type: text/plain; charset=utf-8\r\n     (body only)
//! Content-Length: 14\r\n                           (0 without a body)
//! <extra headers, verbatim, in order>\r\n
//! Connection: close\r\n                            (closing responses only)
//! Connection: keep-alive\r\n                       (HTTP/1.0 responses kept open)
//! \r\n
//! <body>
//! ```

use bytes::{BufMut, BytesMut};
use http::{HeaderName, HeaderValue, StatusCode, Version};
use tokio_util::codec::Encoder;
use tracing::warn;

use crate::error::TransportError;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

// ── HandleResult ──────────────────────────────────────────────────────────────

/// What a handler produced for one request.
///
/// ```rust
/// use ctlsock::HandleResult;
/// use http::StatusCode;
///
/// HandleResult::ok("Hello world!\r\n");
/// HandleResult::new(StatusCode::NO_CONTENT);
/// HandleResult::with_body(StatusCode::NOT_FOUND, "no such command\n")
///     .header("X-Command", "unknown");
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HandleResult {
    pub(crate) status: StatusCode,
    pub(crate) body: Option<String>,
    pub(crate) extra_headers: Vec<(String, String)>,
}

impl HandleResult {
    /// A response with no body.
    pub fn new(status: StatusCode) -> Self {
        Self { status, body: None, extra_headers: Vec::new() }
    }

    /// A response with a text body.
    pub fn with_body(status: StatusCode, body: impl Into<String>) -> Self {
        Self { status, body: Some(body.into()), extra_headers: Vec::new() }
    }

    /// `200 OK` with a text body.
    pub fn ok(body: impl Into<String>) -> Self {
        Self::with_body(StatusCode::OK, body)
    }

    /// Appends an extra header. Duplicates are kept, not overwritten.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    /// Appends several extra headers, in iteration order.
    #[must_use]
    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.extra_headers.extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// The response status.
    pub fn status(&self) -> StatusCode { self.status }
    /// The text body, if any.
    pub fn body(&self) -> Option<&str> { self.body.as_deref() }
    /// Extra headers in the order they will be written.
    pub fn extra_headers(&self) -> &[(String, String)] { &self.extra_headers }
}

impl From<StatusCode> for HandleResult {
    fn from(status: StatusCode) -> Self { Self::new(status) }
}

// ── Outgoing messages ─────────────────────────────────────────────────────────

/// Everything the connection loop writes.
#[derive(Debug)]
pub enum Outgoing {
    /// `100 Continue` interim response.
    Continue,
    Response(Reply),
}

/// A final response plus the framing decisions the connection already made.
#[derive(Debug)]
pub struct Reply {
    pub version: Version,
    pub result: HandleResult,
    /// Headers are written but the body is not (`HEAD`).
    pub omit_body: bool,
    /// The connection closes after this response.
    pub close: bool,
}

impl Reply {
    /// Bodiless closing response for a request that could not be framed.
    pub fn rejection(status: StatusCode) -> Self {
        Self {
            version: Version::HTTP_11,
            result: HandleResult::new(status),
            omit_body: false,
            close: true,
        }
    }
}

// ── ResponseWriter ────────────────────────────────────────────────────────────

/// Serialises [`Outgoing`] messages onto a connection.
#[derive(Debug, Default)]
pub struct ResponseWriter;

impl Encoder<Outgoing> for ResponseWriter {
    type Error = TransportError;

    fn encode(&mut self, item: Outgoing, dst: &mut BytesMut) -> Result<(), TransportError> {
        match item {
            Outgoing::Continue => dst.put_slice(b"HTTP/1.1 100 Continue\r\n\r\n"),
            Outgoing::Response(reply) => encode_reply(reply, dst),
        }
        Ok(())
    }
}

fn encode_reply(reply: Reply, dst: &mut BytesMut) {
    let Reply { version, result, omit_body, close } = reply;

    let status = result.status;
    put_line(dst, &format!(
        "{} {} {}",
        version_str(version),
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
    ));

    match &result.body {
        Some(body) => {
            put_line(dst, &format!("Content-Type: {TEXT_PLAIN}"));
            put_line(dst, &format!("Content-Length: {}", body.len()));
        }
        None => put_line(dst, "Content-Length: 0"),
    }

    for (name, value) in &result.extra_headers {
        if HeaderName::from_bytes(name.as_bytes()).is_err() || HeaderValue::from_str(value).is_err() {
            warn!(header = %name, "skipping invalid extra response header");
            continue;
        }
        put_line(dst, &format!("{name}: {value}"));
    }

    if close {
        put_line(dst, "Connection: close");
    } else if version == Version::HTTP_10 {
        put_line(dst, "Connection: keep-alive");
    }
    dst.put_slice(b"\r\n");

    if let Some(body) = result.body
        && !omit_body
    {
        dst.put_slice(body.as_bytes());
    }
}

fn put_line(dst: &mut BytesMut, line: &str) {
    dst.reserve(line.len() + 2);
    dst.put_slice(line.as_bytes());
    dst.put_slice(b"\r\n");
}

fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 { "HTTP/1.0" } else { "HTTP/1.1" }
}
