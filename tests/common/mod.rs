//! Shared utilities for integration tests.
//!
//! - `FakeConnector` / `FakeSocket`: scripted in-memory sockets that record
//!   written bytes and let a test inject responses, closes and errors
//! - `Recorder`: a handler that records every callback
//! - `FakeSessions`: an HTTP/2 session double driven by queued events
//! - `start_mock_backend`: a real TCP server for socket-level tests

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use pipeliner::dispatcher::{Completion, DispatcherEvent, EventKind, Handler, Headers, Upgraded};
use pipeliner::http::h2::{H2Session, SessionEvent, SessionFactory, StreamId};
use pipeliner::net::{Connector, SocketEvents, Transport};
use pipeliner::resilience::timeouts;
use pipeliner::{DispatchError, Origin, Request};

// ---------------------------------------------------------------------------
// Sockets
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SocketState {
    written: Vec<u8>,
    destroyed: bool,
    fail_writes: bool,
}

/// Test-side handle on one fake socket.
#[derive(Clone)]
pub struct FakeSocket {
    pub origin: Origin,
    events: SocketEvents,
    state: Rc<RefCell<SocketState>>,
    alpn: Option<&'static str>,
}

impl FakeSocket {
    /// Everything the client wrote, lossily decoded.
    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.state.borrow().written).into_owned()
    }

    /// Number of request lines written so far.
    pub fn requests_written(&self) -> usize {
        self.written().matches(" HTTP/1.1\r\n").count()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.borrow().destroyed
    }

    /// Complete a manual connect.
    pub fn accept(&self) {
        self.events.connected(Box::new(FakeTransport {
            state: self.state.clone(),
            alpn: self.alpn,
        }));
    }

    /// Fail a manual connect.
    pub fn refuse(&self, error: DispatchError) {
        self.events.connect_failed(error);
    }

    /// Deliver bytes from the server.
    pub fn respond(&self, data: &str) {
        self.events.data(data.as_bytes());
    }

    /// The server closed the socket cleanly.
    pub fn close(&self) {
        self.events.closed(None);
    }

    /// The socket failed.
    pub fn fail(&self, error: DispatchError) {
        self.events.closed(Some(error));
    }

    /// Make every further write fail.
    pub fn fail_writes(&self) {
        self.state.borrow_mut().fail_writes = true;
    }
}

struct FakeTransport {
    state: Rc<RefCell<SocketState>>,
    alpn: Option<&'static str>,
}

impl Transport for FakeTransport {
    fn write(&mut self, data: Bytes) -> Result<(), DispatchError> {
        let mut state = self.state.borrow_mut();
        if state.destroyed {
            return Err(DispatchError::socket_closed());
        }
        if state.fail_writes {
            return Err(DispatchError::Socket {
                kind: std::io::ErrorKind::BrokenPipe,
                message: "broken pipe".into(),
            });
        }
        state.written.extend_from_slice(&data);
        Ok(())
    }

    fn destroy(&mut self) {
        self.state.borrow_mut().destroyed = true;
    }

    fn alpn_protocol(&self) -> Option<&str> {
        self.alpn
    }
}

#[derive(Default)]
struct ConnectorState {
    sockets: Vec<FakeSocket>,
    manual: bool,
    alpn: Option<&'static str>,
    refusals: VecDeque<DispatchError>,
}

/// Connector handing out `FakeSocket`s. Connects succeed immediately
/// unless the connector is manual or a refusal is queued.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Rc<RefCell<ConnectorState>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave connects pending until `FakeSocket::accept`.
    pub fn manual() -> Self {
        let connector = Self::default();
        connector.state.borrow_mut().manual = true;
        connector
    }

    /// Sockets report this ALPN protocol.
    pub fn with_alpn(self, alpn: &'static str) -> Self {
        self.state.borrow_mut().alpn = Some(alpn);
        self
    }

    /// Fail the next connect attempt with `error`.
    pub fn refuse_next(&self, error: DispatchError) {
        self.state.borrow_mut().refusals.push_back(error);
    }

    pub fn connects(&self) -> usize {
        self.state.borrow().sockets.len()
    }

    pub fn socket(&self, index: usize) -> FakeSocket {
        self.state.borrow().sockets[index].clone()
    }

    pub fn last_socket(&self) -> FakeSocket {
        let state = self.state.borrow();
        state.sockets[state.sockets.len() - 1].clone()
    }
}

impl Connector for FakeConnector {
    fn connect(&self, origin: &Origin, events: SocketEvents) {
        let (socket, refusal, manual) = {
            let mut state = self.state.borrow_mut();
            let socket = FakeSocket {
                origin: origin.clone(),
                events,
                state: Rc::new(RefCell::new(SocketState::default())),
                alpn: state.alpn,
            };
            state.sockets.push(socket.clone());
            (socket, state.refusals.pop_front(), state.manual)
        };
        match refusal {
            Some(error) => socket.refuse(error),
            None if !manual => socket.accept(),
            None => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct Record {
    pub connected: usize,
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub completion: Option<Completion>,
    pub error: Option<DispatchError>,
    pub upgraded: Option<Upgraded>,
    pub terminals: usize,
}

impl Record {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_done(&self) -> bool {
        self.terminals > 0
    }
}

/// Handler recording every callback. Terminal callbacks also append the
/// tag to a shared log, so tests can check cross-request order.
pub struct Recorder {
    record: Rc<RefCell<Record>>,
    tag: String,
    log: Rc<RefCell<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> (Box<dyn Handler>, Rc<RefCell<Record>>) {
        Self::tagged("", &Rc::new(RefCell::new(Vec::new())))
    }

    pub fn tagged(
        tag: &str,
        log: &Rc<RefCell<Vec<String>>>,
    ) -> (Box<dyn Handler>, Rc<RefCell<Record>>) {
        let record = Rc::new(RefCell::new(Record::default()));
        let handler = Recorder {
            record: record.clone(),
            tag: tag.to_string(),
            log: log.clone(),
        };
        (Box::new(handler), record)
    }
}

impl Handler for Recorder {
    fn on_connect(&mut self) {
        self.record.borrow_mut().connected += 1;
    }

    fn on_headers(&mut self, status: u16, headers: Headers) {
        let mut record = self.record.borrow_mut();
        record.status = Some(status);
        record.headers = headers.into_iter().collect();
    }

    fn on_data(&mut self, chunk: Bytes) {
        self.record.borrow_mut().body.extend_from_slice(&chunk);
    }

    fn on_complete(self: Box<Self>, completion: Completion) {
        let mut record = self.record.borrow_mut();
        record.completion = Some(completion);
        record.terminals += 1;
        self.log.borrow_mut().push(self.tag.clone());
    }

    fn on_error(self: Box<Self>, error: DispatchError) {
        let mut record = self.record.borrow_mut();
        record.error = Some(error);
        record.terminals += 1;
        self.log.borrow_mut().push(format!("{}!", self.tag));
    }

    fn on_upgrade(self: Box<Self>, status: u16, headers: Headers, socket: Upgraded) {
        let mut record = self.record.borrow_mut();
        record.status = Some(status);
        record.headers = headers.into_iter().collect();
        record.upgraded = Some(socket);
        record.terminals += 1;
    }
}

/// Observer collecting event kinds.
pub fn event_log() -> (
    Rc<RefCell<Vec<DispatcherEvent>>>,
    Box<dyn FnMut(&DispatcherEvent)>,
) {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    (log, Box::new(move |event| sink.borrow_mut().push(event.clone())))
}

pub fn count_events(log: &Rc<RefCell<Vec<DispatcherEvent>>>, kind: EventKind) -> usize {
    log.borrow().iter().filter(|e| e.kind == kind).count()
}

pub fn origin() -> Origin {
    Origin::parse("http://backend.test").unwrap()
}

pub fn get(path: &str) -> Request {
    Request::get(path).origin(origin())
}

/// A complete HTTP/1.1 response with a fixed-length body.
pub fn ok(body: &str) -> String {
    format!("HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{body}", body.len())
}

/// Fire every timer due within `ahead`.
pub fn advance_timers(ahead: Duration) -> usize {
    timeouts::advance(Instant::now() + ahead)
}

// ---------------------------------------------------------------------------
// HTTP/2
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct SessionLog {
    pub opened: Vec<(StreamId, String)>,
    pub data: Vec<(StreamId, Bytes, bool)>,
    pub resets: Vec<StreamId>,
    pub inbound: VecDeque<SessionEvent>,
    next_stream: StreamId,
}

/// Session factory whose sessions emit queued events on any inbound bytes.
#[derive(Clone, Default)]
pub struct FakeSessions {
    pub log: Rc<RefCell<SessionLog>>,
}

impl FakeSessions {
    /// Queue an event; it is delivered on the next `FakeSocket::respond`.
    pub fn push(&self, event: SessionEvent) {
        self.log.borrow_mut().inbound.push_back(event);
    }

    pub fn opened(&self) -> Vec<(StreamId, String)> {
        self.log.borrow().opened.clone()
    }
}

impl SessionFactory for FakeSessions {
    fn create(&self, _origin: &Origin) -> Box<dyn H2Session> {
        Box::new(FakeSession {
            log: self.log.clone(),
        })
    }
}

struct FakeSession {
    log: Rc<RefCell<SessionLog>>,
}

impl H2Session for FakeSession {
    fn start(&mut self, out: &mut Vec<Bytes>) {
        out.push(Bytes::from_static(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"));
    }

    fn open_stream(
        &mut self,
        request: &Request,
        _origin: &Origin,
        _end_stream: bool,
        out: &mut Vec<Bytes>,
    ) -> Result<StreamId, DispatchError> {
        let mut log = self.log.borrow_mut();
        let stream = log.next_stream * 2 + 1;
        log.next_stream += 1;
        log.opened.push((stream, request.path.clone()));
        out.push(Bytes::from(format!("HEADERS {stream}")));
        Ok(stream)
    }

    fn send_data(
        &mut self,
        stream: StreamId,
        chunk: Bytes,
        end_stream: bool,
        _out: &mut Vec<Bytes>,
    ) -> Result<(), DispatchError> {
        self.log.borrow_mut().data.push((stream, chunk, end_stream));
        Ok(())
    }

    fn reset_stream(&mut self, stream: StreamId, out: &mut Vec<Bytes>) {
        self.log.borrow_mut().resets.push(stream);
        out.push(Bytes::from(format!("RST_STREAM {stream}")));
    }

    fn receive(
        &mut self,
        _data: &[u8],
        events: &mut Vec<SessionEvent>,
        _out: &mut Vec<Bytes>,
    ) -> Result<(), DispatchError> {
        events.extend(self.log.borrow_mut().inbound.drain(..));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Real sockets
// ---------------------------------------------------------------------------

/// Start a keep-alive backend on an ephemeral port that answers every
/// request head it reads with `200 OK` and `response` as the body.
pub async fn start_mock_backend(response: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut buffer = Vec::new();
                        let mut chunk = [0u8; 4096];
                        loop {
                            let n = match socket.read(&mut chunk).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => n,
                            };
                            buffer.extend_from_slice(&chunk[..n]);
                            while let Some(end) = find_head_end(&buffer) {
                                buffer.drain(..end);
                                let response_str = format!(
                                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                                    response.len(),
                                    response
                                );
                                if socket.write_all(response_str.as_bytes()).await.is_err() {
                                    return;
                                }
                            }
                        }
                    });
                }
                Err(_) => break,
            }
        }
    });
    addr
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
}

/// Counter shared with closures in tests.
pub fn counter() -> Rc<Cell<usize>> {
    Rc::new(Cell::new(0))
}
