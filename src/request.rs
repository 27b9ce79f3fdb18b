//! Parsed request types handed to a [`RequestHandler`](crate::RequestHandler).

use std::str::Utf8Error;

use bytes::Bytes;
use http::{Method, Version};

/// Request line and headers. Immutable once parsed.
#[derive(Clone, Debug)]
pub struct RequestHead {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) version: Version,
    pub(crate) headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Builds a head directly; mostly useful for testing handlers.
    pub fn new(
        method: Method,
        path: impl Into<String>,
        version: Version,
        headers: Vec<(String, String)>,
    ) -> Self {
        Self { method, path: path.into(), version, headers }
    }

    /// The request method.
    pub fn method(&self) -> &Method { &self.method }

    /// The request target exactly as sent. Routing on it is the handler's business.
    pub fn path(&self) -> &str { &self.path }

    /// `HTTP/1.0` or `HTTP/1.1`.
    pub fn version(&self) -> Version { self.version }

    /// All headers in arrival order, duplicates included.
    pub fn headers(&self) -> &[(String, String)] { &self.headers }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value of a header, in arrival order.
    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers.iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True when any `Connection` header lists `token`.
    pub(crate) fn connection_has(&self, token: &str) -> bool {
        self.headers_named("connection")
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }
}

/// A request body. "Not sent" and "sent, zero bytes" are different states.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum RequestBody {
    /// The request declared no body at all.
    #[default]
    Absent,
    /// The request declared a body; it may still be empty.
    Present(Bytes),
}

impl RequestBody {
    /// True when the request declared no body at all.
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Raw bytes, or `None` when absent.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Absent => None,
            Self::Present(b) => Some(b),
        }
    }

    /// UTF-8 view of the body, or `None` when absent.
    pub fn text(&self) -> Option<Result<&str, Utf8Error>> {
        self.bytes().map(std::str::from_utf8)
    }

    /// Byte length; zero for both empty and absent bodies.
    pub fn len(&self) -> usize {
        self.bytes().map_or(0, <[u8]>::len)
    }

    /// True for absent bodies and for present bodies of zero bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
