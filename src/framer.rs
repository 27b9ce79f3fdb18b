//! Per-connection HTTP/1.1 request framer.
//!
//! A [`Decoder`] that turns an arbitrary sequence of transport reads into
//! whole requests. The state machine is deliberately small:
//!
//! ```text
//!   AwaitingHead ──head──▶ AccumulatingBody ──end of message──▶ (deliver) ──▶ AwaitingHead
//! ```
//!
//! At most one request is in flight. Body bytes are appended in arrival order
//! and never touched again until delivery. Both the head and the body are
//! capped; exceeding either cap is a [`TransportError`] that closes the
//! connection.

use bytes::{Buf, BytesMut};
use http::{HeaderName, Method, Version};
use tokio_util::codec::Decoder;

use crate::error::TransportError;
use crate::request::{RequestBody, RequestHead};

/// Longest chunk-size line accepted, extensions included.
const MAX_CHUNK_LINE: usize = 4096;

/// What the framer hands to the connection loop.
#[derive(Debug)]
pub enum Frame {
    /// A head carrying `Expect: 100-continue` was accepted; the client is
    /// waiting for an interim response before sending the body.
    ContinueExpected,
    /// A complete request.
    Request(RequestHead, RequestBody),
}

#[derive(Debug)]
enum State {
    AwaitingHead,
    AccumulatingBody {
        head: RequestHead,
        body: BytesMut,
        framing: BodyFraming,
    },
}

#[derive(Debug)]
enum BodyFraming {
    /// No body was declared; the message ends with the head.
    None,
    /// `Content-Length`: bytes still expected.
    Length(usize),
    Chunked(ChunkState),
}

#[derive(Debug)]
enum ChunkState {
    Size,
    Data(usize),
    DataEnd,
    Trailers,
}

enum Progress {
    Done,
    NeedMore,
}

/// The request framer. One per connection.
#[derive(Debug)]
pub struct HttpFramer {
    state: State,
    max_head_bytes: usize,
    max_body_bytes: usize,
}

impl HttpFramer {
    /// A framer waiting for its first head, with the given caps.
    pub fn new(max_head_bytes: usize, max_body_bytes: usize) -> Self {
        Self { state: State::AwaitingHead, max_head_bytes, max_body_bytes }
    }

    /// True between requests: no head has been seen for the next message yet.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::AwaitingHead)
    }

    fn decode_head(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        // Stray line breaks between messages are ignored.
        let leading = src.iter().take_while(|b| matches!(b, b'\r' | b'\n')).count();
        src.advance(leading);

        let Some(end) = find_head_end(src) else {
            if src.len() > self.max_head_bytes {
                return Err(TransportError::HeadTooLarge { limit: self.max_head_bytes });
            }
            return Ok(None);
        };
        if end > self.max_head_bytes {
            return Err(TransportError::HeadTooLarge { limit: self.max_head_bytes });
        }

        let raw = src.split_to(end);
        let head = parse_head(&raw)?;
        let framing = body_framing(&head)?;

        if let BodyFraming::Length(len) = framing
            && len > self.max_body_bytes
        {
            return Err(TransportError::PayloadTooLarge { limit: self.max_body_bytes });
        }

        let wants_continue = head.version == Version::HTTP_11
            && !matches!(framing, BodyFraming::None | BodyFraming::Length(0))
            && head.header("expect").is_some_and(|v| v.eq_ignore_ascii_case("100-continue"));

        self.state = State::AccumulatingBody { head, body: BytesMut::new(), framing };
        Ok(wants_continue.then_some(Frame::ContinueExpected))
    }

    fn accumulate(&mut self, src: &mut BytesMut) -> Result<Progress, TransportError> {
        let max_body = self.max_body_bytes;
        let State::AccumulatingBody { body, framing, .. } = &mut self.state else {
            return Ok(Progress::NeedMore);
        };

        match framing {
            BodyFraming::None => Ok(Progress::Done),
            BodyFraming::Length(remaining) => {
                let take = (*remaining).min(src.len());
                body.extend_from_slice(&src.split_to(take));
                *remaining -= take;
                Ok(if *remaining == 0 { Progress::Done } else { Progress::NeedMore })
            }
            BodyFraming::Chunked(chunk) => accumulate_chunked(chunk, body, src, max_body),
        }
    }

    fn deliver(&mut self) -> Option<Frame> {
        match std::mem::replace(&mut self.state, State::AwaitingHead) {
            State::AccumulatingBody { head, body, framing } => {
                let body = match framing {
                    BodyFraming::None => RequestBody::Absent,
                    BodyFraming::Length(_) | BodyFraming::Chunked(_) => {
                        RequestBody::Present(body.freeze())
                    }
                };
                Some(Frame::Request(head, body))
            }
            State::AwaitingHead => None,
        }
    }
}

impl Decoder for HttpFramer {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        if self.is_idle() {
            if let Some(frame) = self.decode_head(src)? {
                return Ok(Some(frame));
            }
            if self.is_idle() {
                return Ok(None);
            }
        }

        match self.accumulate(src)? {
            Progress::Done => Ok(self.deliver()),
            Progress::NeedMore => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        let only_line_breaks = src.iter().all(|b| matches!(b, b'\r' | b'\n'));
        if self.is_idle() && only_line_breaks {
            src.clear();
            Ok(None)
        } else {
            Err(TransportError::UnexpectedEof)
        }
    }
}

// ── Chunked bodies ────────────────────────────────────────────────────────────

fn accumulate_chunked(
    chunk: &mut ChunkState,
    body: &mut BytesMut,
    src: &mut BytesMut,
    max_body: usize,
) -> Result<Progress, TransportError> {
    loop {
        match chunk {
            ChunkState::Size => {
                let Some(line) = take_line(src, MAX_CHUNK_LINE)
                    .map_err(|()| TransportError::MalformedChunk("chunk size line too long".into()))?
                else {
                    return Ok(Progress::NeedMore);
                };
                let size = parse_chunk_size(&line)?;
                if size == 0 {
                    *chunk = ChunkState::Trailers;
                } else {
                    if body.len().saturating_add(size) > max_body {
                        return Err(TransportError::PayloadTooLarge { limit: max_body });
                    }
                    *chunk = ChunkState::Data(size);
                }
            }
            ChunkState::Data(remaining) => {
                if src.is_empty() {
                    return Ok(Progress::NeedMore);
                }
                let take = (*remaining).min(src.len());
                body.extend_from_slice(&src.split_to(take));
                *remaining -= take;
                if *remaining == 0 {
                    *chunk = ChunkState::DataEnd;
                }
            }
            ChunkState::DataEnd => {
                if src.starts_with(b"\r\n") {
                    src.advance(2);
                } else if src.starts_with(b"\n") {
                    src.advance(1);
                } else if src.is_empty() || &src[..] == b"\r" {
                    return Ok(Progress::NeedMore);
                } else {
                    return Err(TransportError::MalformedChunk("missing CRLF after chunk data".into()));
                }
                *chunk = ChunkState::Size;
            }
            ChunkState::Trailers => {
                let Some(line) = take_line(src, MAX_CHUNK_LINE)
                    .map_err(|()| TransportError::MalformedChunk("trailer line too long".into()))?
                else {
                    return Ok(Progress::NeedMore);
                };
                if line.is_empty() {
                    return Ok(Progress::Done);
                }
            }
        }
    }
}

/// Splits one line off `src`, without its terminator.
///
/// `Ok(None)` when no terminator has arrived yet; `Err` once more than `limit`
/// bytes are buffered without one.
fn take_line(src: &mut BytesMut, limit: usize) -> Result<Option<Vec<u8>>, ()> {
    match src.iter().position(|&b| b == b'\n') {
        Some(pos) => {
            let mut line = src.split_to(pos + 1).to_vec();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            Ok(Some(line))
        }
        None if src.len() > limit => Err(()),
        None => Ok(None),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, TransportError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| TransportError::MalformedChunk("chunk size is not ASCII".into()))?;
    let size = text.split(';').next().unwrap_or_default().trim();
    if size.is_empty() {
        return Err(TransportError::MalformedChunk("empty chunk size".into()));
    }
    if !size.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(TransportError::MalformedChunk(format!("invalid chunk size `{size}`")));
    }
    usize::from_str_radix(size, 16)
        .map_err(|_| TransportError::MalformedChunk(format!("invalid chunk size `{size}`")))
}

// ── Head parsing ──────────────────────────────────────────────────────────────

/// Offset just past the blank line ending the head, accepting CRLF or bare LF.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    let mut line_start = 0;
    for (i, &b) in buf.iter().enumerate() {
        if b != b'\n' {
            continue;
        }
        let line = &buf[line_start..i];
        if line.is_empty() || line == b"\r" {
            return Some(i + 1);
        }
        line_start = i + 1;
    }
    None
}

fn parse_head(raw: &[u8]) -> Result<RequestHead, TransportError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| TransportError::malformed("head is not valid UTF-8"))?;
    let mut lines = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

    let request_line = lines.next().unwrap_or_default();
    let (method, path, version) = parse_request_line(request_line)?;

    let mut headers = Vec::new();
    for line in lines.take_while(|l| !l.is_empty()) {
        headers.push(parse_header_line(line)?);
    }

    Ok(RequestHead { method, path, version, headers })
}

fn parse_request_line(line: &str) -> Result<(Method, String, Version), TransportError> {
    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(TransportError::malformed(format!("bad request line `{line}`")));
    };

    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| TransportError::malformed(format!("bad method `{method}`")))?;
    if target.is_empty() || target.bytes().any(|b| b.is_ascii_control()) {
        return Err(TransportError::malformed(format!("bad request target `{target}`")));
    }
    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => return Err(TransportError::malformed(format!("unsupported version `{other}`"))),
    };

    Ok((method, target.to_owned(), version))
}

fn parse_header_line(line: &str) -> Result<(String, String), TransportError> {
    if line.starts_with([' ', '\t']) {
        return Err(TransportError::malformed("obsolete header line folding"));
    }
    let Some((name, value)) = line.split_once(':') else {
        return Err(TransportError::malformed(format!("header without colon `{line}`")));
    };
    if HeaderName::from_bytes(name.as_bytes()).is_err() {
        return Err(TransportError::malformed(format!("bad header name `{name}`")));
    }
    Ok((name.to_owned(), value.trim_matches([' ', '\t']).to_owned()))
}

fn body_framing(head: &RequestHead) -> Result<BodyFraming, TransportError> {
    let codings: Vec<&str> = head.headers_named("transfer-encoding")
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();
    if let Some(last) = codings.last() {
        return if last.eq_ignore_ascii_case("chunked") {
            Ok(BodyFraming::Chunked(ChunkState::Size))
        } else {
            Err(TransportError::malformed("request transfer-encoding must end in chunked"))
        };
    }

    let mut length = None;
    for value in head.headers_named("content-length").flat_map(|v| v.split(',')) {
        let value = value.trim();
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TransportError::malformed(format!("bad content-length `{value}`")));
        }
        let parsed: usize = value.parse()
            .map_err(|_| TransportError::malformed(format!("content-length `{value}` out of range")))?;
        match length {
            Some(prev) if prev != parsed => {
                return Err(TransportError::malformed("conflicting content-length values"));
            }
            _ => length = Some(parsed),
        }
    }

    Ok(length.map_or(BodyFraming::None, BodyFraming::Length))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const LIMIT: usize = 64 * 1024;

    fn framer() -> HttpFramer {
        HttpFramer::new(LIMIT, LIMIT)
    }

    /// Feeds `input` in pieces of the given sizes (the last size repeats)
    /// and collects every delivered request.
    fn feed(framer: &mut HttpFramer, input: &[u8], sizes: &[usize]) -> Vec<(RequestHead, RequestBody)> {
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        let mut rest = input;
        let mut step = 0;
        while !rest.is_empty() {
            let size = sizes[step.min(sizes.len() - 1)].min(rest.len()).max(1);
            step += 1;
            buf.extend_from_slice(&rest[..size]);
            rest = &rest[size..];
            while let Some(frame) = framer.decode(&mut buf).expect("decode") {
                if let Frame::Request(head, body) = frame {
                    out.push((head, body));
                }
            }
        }
        out
    }

    fn single(input: &[u8]) -> (RequestHead, RequestBody) {
        let mut reqs = feed(&mut framer(), input, &[input.len()]);
        assert_eq!(reqs.len(), 1, "expected exactly one request");
        reqs.remove(0)
    }

    fn decode_err(input: &[u8], framer: &mut HttpFramer) -> TransportError {
        let mut buf = BytesMut::from(input);
        loop {
            match framer.decode(&mut buf) {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("expected an error, framer wants more input"),
                Err(e) => return e,
            }
        }
    }

    #[test]
    fn parses_post_with_content_length() {
        let (head, body) = single(b"POST /cmd HTTP/1.1\r\nHost: localhost\r\nContent-Length: 7\r\n\r\n{\"x\":1}");

        assert_eq!(head.method(), Method::POST);
        assert_eq!(head.path(), "/cmd");
        assert_eq!(head.version(), Version::HTTP_11);
        assert_eq!(head.header("host"), Some("localhost"));
        assert_eq!(body.bytes(), Some(&b"{\"x\":1}"[..]));
    }

    #[test]
    fn get_without_framing_has_absent_body() {
        let (_, body) = single(b"GET /status HTTP/1.1\r\n\r\n");
        assert!(body.is_absent());
    }

    #[test]
    fn zero_content_length_is_present_but_empty() {
        let (_, body) = single(b"POST /cmd HTTP/1.1\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(body, RequestBody::Present(bytes::Bytes::new()));
    }

    #[test]
    fn every_split_point_yields_the_same_requests() {
        let input: &[u8] = b"POST /a HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello world\
GET /b HTTP/1.1\r\nX-Multi: 1\r\nX-Multi: 2\r\n\r\n\
POST /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n4;ext=1\r\ndefg\r\n0\r\nTrailer: t\r\n\r\n";

        for first in 1..input.len() {
            for rest in [1, 3, 7] {
                let reqs = feed(&mut framer(), input, &[first, rest]);
                let paths: Vec<_> = reqs.iter().map(|(h, _)| h.path().to_owned()).collect();
                assert_eq!(paths, ["/a", "/b", "/c"], "split at {first}/{rest}");
                assert_eq!(reqs[0].1.bytes(), Some(&b"hello world"[..]));
                assert!(reqs[1].1.is_absent());
                assert_eq!(reqs[1].0.headers_named("x-multi").collect::<Vec<_>>(), ["1", "2"]);
                assert_eq!(reqs[2].1.bytes(), Some(&b"abcdefg"[..]));
            }
        }
    }

    #[test]
    fn returns_to_awaiting_head_after_delivery() {
        let mut framer = framer();
        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nContent-Length: 2\r\n\r\nh"[..]);

        assert!(framer.decode(&mut buf).expect("decode").is_none());
        assert!(!framer.is_idle());

        buf.extend_from_slice(b"i");
        assert!(matches!(framer.decode(&mut buf).expect("decode"), Some(Frame::Request(..))));
        assert!(framer.is_idle());
        assert!(buf.is_empty());
    }

    #[test]
    fn tolerates_bare_lf_and_leading_blank_lines() {
        let (head, body) = single(b"\r\n\nPUT /x HTTP/1.0\nContent-Length: 2\n\nok");
        assert_eq!(head.method(), Method::PUT);
        assert_eq!(head.version(), Version::HTTP_10);
        assert_eq!(body.text(), Some(Ok("ok")));
    }

    #[test]
    fn header_values_are_trimmed_and_names_keep_their_case() {
        let (head, _) = single(b"GET / HTTP/1.1\r\nX-Custom:   spaced value \t\r\n\r\n");
        assert_eq!(head.headers(), [("X-Custom".to_owned(), "spaced value".to_owned())]);
    }

    #[test]
    fn expect_continue_is_signalled_before_the_body() {
        let mut framer = framer();
        let mut buf = BytesMut::from(
            &b"POST /up HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 3\r\n\r\n"[..],
        );

        assert!(matches!(framer.decode(&mut buf).expect("decode"), Some(Frame::ContinueExpected)));
        assert!(framer.decode(&mut buf).expect("decode").is_none());

        buf.extend_from_slice(b"abc");
        let Some(Frame::Request(_, body)) = framer.decode(&mut buf).expect("decode") else {
            panic!("expected request");
        };
        assert_eq!(body.bytes(), Some(&b"abc"[..]));
    }

    #[rstest]
    #[case::unknown_version(&b"GET / HTTP/2.0\r\n\r\n"[..])]
    #[case::garbage_version(&b"GET / SPDY\r\n\r\n"[..])]
    #[case::missing_target(&b"GET HTTP/1.1\r\n\r\n"[..])]
    #[case::bad_method(&b"G(T / HTTP/1.1\r\n\r\n"[..])]
    #[case::header_without_colon(&b"GET / HTTP/1.1\r\nNoColon\r\n\r\n"[..])]
    #[case::folded_header(&b"GET / HTTP/1.1\r\nA: b\r\n  c\r\n\r\n"[..])]
    #[case::conflicting_lengths(&b"POST / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n"[..])]
    #[case::negative_length(&b"POST / HTTP/1.1\r\nContent-Length: -1\r\n\r\n"[..])]
    #[case::gzip_only(&b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n"[..])]
    fn malformed_heads_are_rejected(#[case] input: &[u8]) {
        let err = decode_err(input, &mut framer());
        assert!(matches!(err, TransportError::MalformedHead(_)), "{err:?}");
    }

    #[test]
    fn declared_length_over_cap_fails_before_reading_body() {
        let mut framer = HttpFramer::new(LIMIT, 4);
        let err = decode_err(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n", &mut framer);
        assert!(matches!(err, TransportError::PayloadTooLarge { limit: 4 }));
    }

    #[test]
    fn chunked_total_over_cap_fails() {
        let mut framer = HttpFramer::new(LIMIT, 4);
        let err = decode_err(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n",
            &mut framer,
        );
        assert!(matches!(err, TransportError::PayloadTooLarge { limit: 4 }));
    }

    #[test]
    fn oversized_head_fails_without_a_terminator() {
        let mut framer = HttpFramer::new(32, LIMIT);
        let mut input = b"GET / HTTP/1.1\r\nX-Long: ".to_vec();
        input.extend(std::iter::repeat_n(b'a', 64));
        let err = decode_err(&input, &mut framer);
        assert!(matches!(err, TransportError::HeadTooLarge { limit: 32 }));
    }

    #[rstest]
    #[case::not_hex("zz")]
    #[case::plus_sign("+5")]
    #[case::minus_sign("-5")]
    #[case::inner_space("1 2")]
    fn bad_chunk_size_is_a_chunk_error(#[case] size: &str) {
        let input = format!("POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n{size}\r\nhello\r\n0\r\n\r\n");
        let err = decode_err(input.as_bytes(), &mut framer());
        assert!(matches!(err, TransportError::MalformedChunk(_)), "{err:?}");
    }

    #[test]
    fn eof_between_requests_is_clean() {
        let mut framer = framer();
        let mut buf = BytesMut::from(&b"\r\n"[..]);
        assert!(framer.decode_eof(&mut buf).expect("clean eof").is_none());
    }

    #[test]
    fn eof_mid_body_is_unexpected() {
        let mut framer = framer();
        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc"[..]);
        assert!(framer.decode(&mut buf).expect("decode").is_none());
        let err = framer.decode_eof(&mut buf).expect_err("truncated body");
        assert!(matches!(err, TransportError::UnexpectedEof));
    }
}
