//! HTTP/1.1 request encoding and response parsing.

use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::Method;

use crate::dispatcher::request::{Body, Headers, Origin, Request};
use crate::error::DispatchError;
use crate::http::{Expectation, ParserEvent, ResponseParser};

/// Default limit for a response head, in bytes.
pub const DEFAULT_MAX_HEADER_SIZE: usize = 16 * 1024;

const MAX_HEADERS: usize = 128;

/// Final chunk of a chunked body with no trailers.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// A serialized request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedHead {
    pub bytes: Bytes,
    /// The body must be sent with chunked framing.
    pub chunked: bool,
}

/// Serialize the request line and headers.
///
/// User headers keep their order and case. `host` is added unless the
/// caller supplied one; the `connection` header is always generated here.
pub fn encode_head(request: &Request, origin: &Origin, reset: bool) -> EncodedHead {
    let mut out = BytesMut::with_capacity(256);
    out.put_slice(request.method.as_str().as_bytes());
    out.put_u8(b' ');
    out.put_slice(request.path.as_bytes());
    out.put_slice(b" HTTP/1.1\r\n");

    if !request.headers.contains("host") {
        put_header(&mut out, "host", &origin.host_header());
    }
    for (name, value) in request.headers.iter() {
        if name.eq_ignore_ascii_case("connection") {
            continue;
        }
        put_header(&mut out, name, value);
    }

    if let Some(protocol) = &request.upgrade {
        put_header(&mut out, "connection", "upgrade");
        put_header(&mut out, "upgrade", protocol);
    } else if request.method != Method::CONNECT {
        put_header(&mut out, "connection", if reset { "close" } else { "keep-alive" });
    }

    let declared = request.headers.contains("content-length");
    let mut chunked = false;
    match &request.body {
        Body::Empty => {
            if !declared && expects_payload(&request.method) {
                put_header(&mut out, "content-length", "0");
            }
        }
        Body::Bytes(bytes) => {
            if !declared {
                put_header(&mut out, "content-length", &bytes.len().to_string());
            }
        }
        Body::Stream(_) => {
            if !declared {
                put_header(&mut out, "transfer-encoding", "chunked");
                chunked = true;
            }
        }
    }

    out.put_slice(b"\r\n");
    EncodedHead {
        bytes: out.freeze(),
        chunked,
    }
}

/// Frame one body chunk for chunked transfer encoding.
pub fn encode_chunk(data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(data.len() + 12);
    out.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.put_slice(data);
    out.put_slice(b"\r\n");
    out.freeze()
}

fn put_header(out: &mut BytesMut, name: &str, value: &str) {
    out.put_slice(name.as_bytes());
    out.put_slice(b": ");
    out.put_slice(value.as_bytes());
    out.put_slice(b"\r\n");
}

fn expects_payload(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT || *method == Method::PATCH
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Fixed(u64),
    Chunked,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Fixed(u64),
    Chunked(Chunk),
    Eof,
    Upgraded,
}

/// `httparse`-backed response parser supporting pipelined responses.
pub struct H1Parser {
    buf: BytesMut,
    state: State,
    expected: VecDeque<Expectation>,
    max_header_size: usize,
}

impl Default for H1Parser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEADER_SIZE)
    }
}

impl H1Parser {
    pub fn new(max_header_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            state: State::Head,
            expected: VecDeque::new(),
            max_header_size,
        }
    }

    /// Responses still owed by the server.
    pub fn outstanding(&self) -> usize {
        self.expected.len()
    }

    fn complete(&mut self, trailers: Headers, events: &mut Vec<ParserEvent>) {
        events.push(ParserEvent::Complete { trailers });
        self.expected.pop_front();
        self.state = State::Head;
    }

    fn check_overflow(&self) -> Result<(), DispatchError> {
        if self.buf.len() > self.max_header_size {
            Err(DispatchError::HeadersOverflow(self.max_header_size))
        } else {
            Ok(())
        }
    }

    /// Parse one response head. Returns `false` when more bytes are needed.
    fn parse_head(&mut self, events: &mut Vec<ParserEvent>) -> Result<bool, DispatchError> {
        let (len, status, version, headers) = {
            let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut response = httparse::Response::new(&mut slots);
            let len = match response.parse(&self.buf) {
                Ok(httparse::Status::Complete(len)) => len,
                Ok(httparse::Status::Partial) => {
                    self.check_overflow()?;
                    return Ok(false);
                }
                Err(httparse::Error::TooManyHeaders) => {
                    return Err(DispatchError::HeadersOverflow(self.max_header_size));
                }
                Err(e) => return Err(DispatchError::HttpParser(e.to_string())),
            };
            let status = response.code.unwrap_or(0);
            let version = response.version.unwrap_or(1);
            let headers: Headers = response
                .headers
                .iter()
                .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                .collect();
            (len, status, version, headers)
        };
        if len > self.max_header_size {
            return Err(DispatchError::HeadersOverflow(self.max_header_size));
        }
        self.buf.advance(len);

        if (100..200).contains(&status) && status != 101 {
            return Ok(true);
        }

        let expectation = *self
            .expected
            .front()
            .ok_or_else(|| DispatchError::HttpParser("response without a request".into()))?;

        let switching = status == 101 || (expectation.connect && (200..300).contains(&status));
        if switching {
            if !expectation.upgrade && !expectation.connect {
                return Err(DispatchError::HttpParser("unexpected protocol switch".into()));
            }
            self.expected.pop_front();
            self.state = State::Upgraded;
            let rest = self.buf.split().freeze();
            events.push(ParserEvent::Upgrade {
                status,
                headers,
                rest,
            });
            return Ok(true);
        }

        let (body, close) = body_kind(expectation.head, status, &headers)?;
        let keep_alive = match body {
            BodyKind::Eof => false,
            _ if version == 0 => has_token(&headers, "connection", "keep-alive"),
            _ => !close,
        };
        events.push(ParserEvent::Headers {
            status,
            headers,
            version,
            keep_alive,
        });
        match body {
            BodyKind::Fixed(0) => self.complete(Headers::new(), events),
            BodyKind::Fixed(n) => self.state = State::Fixed(n),
            BodyKind::Chunked => self.state = State::Chunked(Chunk::Size),
            BodyKind::Eof => self.state = State::Eof,
        }
        Ok(true)
    }

    /// Emit up to `remaining` buffered body bytes; returns what is left.
    fn take_body(&mut self, remaining: u64, events: &mut Vec<ParserEvent>) -> u64 {
        let n = remaining.min(self.buf.len() as u64);
        if n > 0 {
            let chunk = self.buf.split_to(n as usize).freeze();
            events.push(ParserEvent::Body(chunk));
        }
        remaining - n
    }
}

impl ResponseParser for H1Parser {
    fn expect(&mut self, expectation: Expectation) {
        self.expected.push_back(expectation);
    }

    fn feed(&mut self, data: &[u8], events: &mut Vec<ParserEvent>) -> Result<(), DispatchError> {
        if self.state == State::Upgraded {
            return Err(DispatchError::HttpParser("data after protocol switch".into()));
        }
        self.buf.extend_from_slice(data);
        loop {
            match self.state {
                State::Head => {
                    if self.buf.is_empty() || !self.parse_head(events)? {
                        return Ok(());
                    }
                }
                State::Fixed(remaining) => {
                    if self.buf.is_empty() {
                        return Ok(());
                    }
                    match self.take_body(remaining, events) {
                        0 => self.complete(Headers::new(), events),
                        left => self.state = State::Fixed(left),
                    }
                }
                State::Eof => {
                    if !self.buf.is_empty() {
                        events.push(ParserEvent::Body(self.buf.split().freeze()));
                    }
                    return Ok(());
                }
                State::Chunked(Chunk::Size) => match httparse::parse_chunk_size(&self.buf) {
                    Ok(httparse::Status::Complete((used, size))) => {
                        self.buf.advance(used);
                        self.state = if size == 0 {
                            State::Chunked(Chunk::Trailers)
                        } else {
                            State::Chunked(Chunk::Data(size))
                        };
                    }
                    Ok(httparse::Status::Partial) => {
                        self.check_overflow()?;
                        return Ok(());
                    }
                    Err(_) => return Err(DispatchError::HttpParser("invalid chunk size".into())),
                },
                State::Chunked(Chunk::Data(remaining)) => {
                    if self.buf.is_empty() {
                        return Ok(());
                    }
                    self.state = match self.take_body(remaining, events) {
                        0 => State::Chunked(Chunk::DataEnd),
                        left => State::Chunked(Chunk::Data(left)),
                    };
                }
                State::Chunked(Chunk::DataEnd) => {
                    if self.buf.len() < 2 {
                        return Ok(());
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(DispatchError::HttpParser("invalid chunk terminator".into()));
                    }
                    self.buf.advance(2);
                    self.state = State::Chunked(Chunk::Size);
                }
                State::Chunked(Chunk::Trailers) => {
                    let parsed = {
                        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
                        match httparse::parse_headers(&self.buf, &mut slots) {
                            Ok(httparse::Status::Complete((used, headers))) => Some((
                                used,
                                headers
                                    .iter()
                                    .map(|h| {
                                        (
                                            h.name.to_string(),
                                            String::from_utf8_lossy(h.value).into_owned(),
                                        )
                                    })
                                    .collect::<Headers>(),
                            )),
                            Ok(httparse::Status::Partial) => None,
                            Err(e) => return Err(DispatchError::HttpParser(e.to_string())),
                        }
                    };
                    match parsed {
                        Some((used, trailers)) => {
                            self.buf.advance(used);
                            self.complete(trailers, events);
                        }
                        None => {
                            self.check_overflow()?;
                            return Ok(());
                        }
                    }
                }
                State::Upgraded => return Ok(()),
            }
        }
    }

    fn finish(&mut self, events: &mut Vec<ParserEvent>) -> Result<(), DispatchError> {
        match self.state {
            State::Eof => {
                if !self.buf.is_empty() {
                    events.push(ParserEvent::Body(self.buf.split().freeze()));
                }
                self.complete(Headers::new(), events);
                Ok(())
            }
            State::Head if self.buf.is_empty() => Ok(()),
            State::Upgraded => Ok(()),
            _ => Err(DispatchError::socket_closed()),
        }
    }
}

/// Response body length (RFC 9112 section 6.3) and whether the server asked
/// to close the connection.
fn body_kind(head: bool, status: u16, headers: &Headers) -> Result<(BodyKind, bool), DispatchError> {
    let close = has_token(headers, "connection", "close");
    if head || (100..200).contains(&status) || status == 204 || status == 304 {
        return Ok((BodyKind::Fixed(0), close));
    }

    let chunked = headers
        .get_all("transfer-encoding")
        .flat_map(|v| v.split(','))
        .last()
        .is_some_and(|enc| enc.trim().eq_ignore_ascii_case("chunked"));

    let mut lengths = headers.get_all("content-length");
    let length = lengths.next();
    if lengths.next().is_some() {
        return Err(DispatchError::HttpParser("duplicate content-length".into()));
    }

    if chunked {
        // transfer-encoding wins over content-length, but the framing is suspect
        return Ok((BodyKind::Chunked, close || length.is_some()));
    }
    match length {
        Some(raw) => {
            let len = raw
                .trim()
                .parse::<u64>()
                .map_err(|_| DispatchError::HttpParser("invalid content-length".into()))?;
            Ok((BodyKind::Fixed(len), close))
        }
        None => Ok((BodyKind::Eof, true)),
    }
}

fn has_token(headers: &Headers, name: &str, token: &str) -> bool {
    headers
        .get_all(name)
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser_for(n: usize) -> H1Parser {
        let mut parser = H1Parser::default();
        for _ in 0..n {
            parser.expect(Expectation::default());
        }
        parser
    }

    fn feed(parser: &mut H1Parser, data: &[u8]) -> Vec<ParserEvent> {
        let mut events = Vec::new();
        parser.feed(data, &mut events).unwrap();
        events
    }

    #[test]
    fn test_encode_head_preserves_header_order() {
        let origin = Origin::parse("http://example.com:8080").unwrap();
        let request = Request::post("/submit")
            .header("X-First", "1")
            .header("x-second", "2")
            .body("hello");
        let head = encode_head(&request, &origin, false);
        assert_eq!(
            head.bytes,
            Bytes::from_static(
                b"POST /submit HTTP/1.1\r\nhost: example.com:8080\r\nX-First: 1\r\nx-second: 2\r\nconnection: keep-alive\r\ncontent-length: 5\r\n\r\n"
            )
        );
        assert!(!head.chunked);
    }

    #[test]
    fn test_encode_head_streaming_and_reset() {
        let origin = Origin::parse("http://example.com").unwrap();
        let request = Request::new(Method::PUT, "/up")
            .header("Host", "override")
            .body(Body::stream(std::iter::empty()));
        let head = encode_head(&request, &origin, true);
        let text = String::from_utf8(head.bytes.to_vec()).unwrap();
        assert!(text.contains("Host: override\r\n"));
        assert!(!text.contains("host: example.com"));
        assert!(text.contains("connection: close\r\n"));
        assert!(text.contains("transfer-encoding: chunked\r\n"));
        assert!(head.chunked);
        assert_eq!(encode_chunk(b"abc"), Bytes::from_static(b"3\r\nabc\r\n"));
    }

    #[test]
    fn test_encode_upgrade_request() {
        let origin = Origin::parse("http://example.com").unwrap();
        let head = encode_head(&Request::get("/ws").upgrade("websocket"), &origin, false);
        let text = String::from_utf8(head.bytes.to_vec()).unwrap();
        assert!(text.contains("connection: upgrade\r\nupgrade: websocket\r\n"));
    }

    #[test]
    fn test_fixed_body_split_across_feeds() {
        let mut parser = parser_for(1);
        let events = feed(&mut parser, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-A: b\r\n\r\nhe");
        assert_eq!(events.len(), 2);
        match &events[0] {
            ParserEvent::Headers {
                status,
                headers,
                keep_alive,
                ..
            } => {
                assert_eq!(*status, 200);
                assert_eq!(headers.get("x-a"), Some("b"));
                assert!(*keep_alive);
            }
            other => panic!("unexpected {other:?}"),
        }
        let events = feed(&mut parser, b"llo");
        assert_eq!(
            events,
            vec![
                ParserEvent::Body(Bytes::from_static(b"llo")),
                ParserEvent::Complete {
                    trailers: Headers::new()
                }
            ]
        );
        assert_eq!(parser.outstanding(), 0);
    }

    #[test]
    fn test_pipelined_responses_in_one_feed() {
        let mut parser = parser_for(2);
        let events = feed(
            &mut parser,
            b"HTTP/1.1 200 OK\r\ncontent-length: 1\r\n\r\naHTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n",
        );
        let completes = events
            .iter()
            .filter(|e| matches!(e, ParserEvent::Complete { .. }))
            .count();
        assert_eq!(completes, 2);
        assert!(matches!(events[3], ParserEvent::Headers { status: 404, .. }));
    }

    #[test]
    fn test_chunked_body_with_trailers() {
        let mut parser = parser_for(1);
        let mut events = feed(
            &mut parser,
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n3\r\nabc\r\n2\r",
        );
        events.extend(feed(&mut parser, b"\nde\r\n0\r\nx-checksum: 42\r\n\r\n"));
        let body: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                ParserEvent::Body(b) => Some(b.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(body, b"abcde");
        match events.last().unwrap() {
            ParserEvent::Complete { trailers } => assert_eq!(trailers.get("x-checksum"), Some("42")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_head_and_no_content_have_no_body() {
        let mut parser = H1Parser::default();
        parser.expect(Expectation {
            head: true,
            ..Default::default()
        });
        parser.expect(Expectation::default());
        let events = feed(
            &mut parser,
            b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n",
        );
        assert_eq!(events.len(), 4);
        assert_eq!(parser.outstanding(), 0);
    }

    #[test]
    fn test_interim_responses_are_skipped() {
        let mut parser = parser_for(1);
        let events = feed(
            &mut parser,
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n",
        );
        assert!(matches!(events[0], ParserEvent::Headers { status: 200, .. }));
    }

    #[test]
    fn test_upgrade_hands_over_remaining_bytes() {
        let mut parser = H1Parser::default();
        parser.expect(Expectation {
            upgrade: true,
            ..Default::default()
        });
        let events = feed(
            &mut parser,
            b"HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\n\r\nframe",
        );
        match &events[0] {
            ParserEvent::Upgrade { status, rest, .. } => {
                assert_eq!(*status, 101);
                assert_eq!(rest, &Bytes::from_static(b"frame"));
            }
            other => panic!("unexpected {other:?}"),
        }
        let mut more = Vec::new();
        assert!(parser.feed(b"x", &mut more).is_err());
    }

    #[test]
    fn test_close_delimited_body_completes_on_finish() {
        let mut parser = parser_for(1);
        let events = feed(&mut parser, b"HTTP/1.0 200 OK\r\n\r\npartial");
        assert!(matches!(
            events[0],
            ParserEvent::Headers {
                keep_alive: false,
                version: 0,
                ..
            }
        ));
        let mut done = Vec::new();
        parser.finish(&mut done).unwrap();
        assert!(matches!(done.last(), Some(ParserEvent::Complete { .. })));
    }

    #[test]
    fn test_truncated_body_fails_on_finish() {
        let mut parser = parser_for(1);
        feed(&mut parser, b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\nabc");
        let mut events = Vec::new();
        assert_eq!(
            parser.finish(&mut events).unwrap_err().kind(),
            crate::error::ErrorKind::Socket
        );
    }

    #[test]
    fn test_malformed_responses() {
        let mut parser = parser_for(1);
        let mut events = Vec::new();
        let err = parser
            .feed(
                b"HTTP/1.1 200 OK\r\ncontent-length: 1\r\ncontent-length: 1\r\n\r\n",
                &mut events,
            )
            .unwrap_err();
        assert!(matches!(err, DispatchError::HttpParser(_)));

        let mut unsolicited = H1Parser::default();
        assert!(unsolicited
            .feed(b"HTTP/1.1 200 OK\r\n\r\n", &mut Vec::new())
            .is_err());
    }

    #[test]
    fn test_header_overflow() {
        let mut parser = H1Parser::new(64);
        parser.expect(Expectation::default());
        let mut head = b"HTTP/1.1 200 OK\r\n".to_vec();
        head.extend(std::iter::repeat(b'x').take(100));
        let err = parser.feed(&head, &mut Vec::new()).unwrap_err();
        assert_eq!(err, DispatchError::HeadersOverflow(64));
    }

    #[test]
    fn test_connection_close_disables_keep_alive() {
        let mut parser = parser_for(1);
        let events = feed(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nConnection: close\r\ncontent-length: 0\r\n\r\n",
        );
        assert!(matches!(
            events[0],
            ParserEvent::Headers {
                keep_alive: false,
                ..
            }
        ));
    }
}
