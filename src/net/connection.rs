//! Connection state machine for a single origin.
//!
//! # Responsibilities
//! - Own at most one socket to the origin and reconnect on demand
//! - Pipeline HTTP/1.1 requests in FIFO order, or multiplex HTTP/2 streams
//! - Map parser/session events back to the request they answer
//! - Enforce connect, headers, body and keep-alive deadlines
//! - Re-queue idempotent collateral requests once after a socket failure
//!
//! # Data Flow
//! ```text
//! dispatch() → pending (VecDeque<Entry>)
//!     → connect() when no socket
//!     → write_h1() / write_h2() moves entries into the socket's in-flight set
//! socket bytes → h1_receive() / h2_receive() → handler callbacks
//! socket failure → teardown() → requeue idempotent entries, fail the rest
//! ```
//!
//! # Design Decisions
//! - Requests move between containers; no index slot can be observed empty
//! - The socket is taken out of the state while it is being worked on and
//!   put back by `settle()`, so every socket path ends in one place
//! - `written - completed` always equals the in-flight count

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::Bytes;
use http::Method;

use crate::dispatcher::abort::AbortRegistration;
use crate::dispatcher::events::Observers;
use crate::dispatcher::handler::HandlerCell;
use crate::dispatcher::request::{Body, Headers, Origin, Request};
use crate::dispatcher::{
    reject, tasks, Completion, Dispatcher, DispatcherEvent, DispatcherId, EventKind, Handler,
    Observer, Subscription, Upgraded,
};
use crate::error::DispatchError;
use crate::http::h1::{self, H1Parser, DEFAULT_MAX_HEADER_SIZE, LAST_CHUNK};
use crate::http::h2::{H2Session, SessionEvent, SessionFactory, StreamId};
use crate::http::{Expectation, ParserEvent, ResponseParser};
use crate::net::transport::{Connector, SocketEvents, SocketSink, Transport};
use crate::observability::metrics::{self, ConnectionEvent, Outcome};
use crate::resilience::timeouts::{self, TimerKey};

/// Tuning for one connection.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Maximum in-flight HTTP/1.1 requests. `0` closes the socket after
    /// every request.
    pub pipelining: usize,
    pub connect_timeout: Duration,
    pub headers_timeout: Duration,
    pub body_timeout: Duration,
    /// Idle time before a kept-alive socket is closed.
    pub keep_alive_timeout: Duration,
    /// Upper bound for a server-provided keep-alive hint.
    pub keep_alive_max_timeout: Duration,
    /// Subtracted from a server-provided keep-alive hint.
    pub keep_alive_timeout_threshold: Duration,
    pub max_header_size: usize,
    /// Reject requests whose content-length disagrees with the body.
    pub strict_content_length: bool,
    pub allow_h2: bool,
    pub max_concurrent_streams: usize,
    /// Session implementation used when ALPN selects `h2`.
    pub session_factory: Option<Rc<dyn SessionFactory>>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            pipelining: 1,
            connect_timeout: Duration::from_secs(10),
            headers_timeout: Duration::from_secs(300),
            body_timeout: Duration::from_secs(300),
            keep_alive_timeout: Duration::from_secs(4),
            keep_alive_max_timeout: Duration::from_secs(600),
            keep_alive_timeout_threshold: Duration::from_secs(2),
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            strict_content_length: true,
            allow_h2: false,
            max_concurrent_streams: 100,
            session_factory: None,
        }
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("pipelining", &self.pipelining)
            .field("connect_timeout", &self.connect_timeout)
            .field("headers_timeout", &self.headers_timeout)
            .field("body_timeout", &self.body_timeout)
            .field("keep_alive_timeout", &self.keep_alive_timeout)
            .field("keep_alive_max_timeout", &self.keep_alive_max_timeout)
            .field("keep_alive_timeout_threshold", &self.keep_alive_timeout_threshold)
            .field("max_header_size", &self.max_header_size)
            .field("strict_content_length", &self.strict_content_length)
            .field("allow_h2", &self.allow_h2)
            .field("max_concurrent_streams", &self.max_concurrent_streams)
            .field("session_factory", &self.session_factory.is_some())
            .finish()
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket and no connect attempt.
    Disconnected,
    Connecting,
    /// A socket is open; it may be idle or carrying requests.
    Connected,
    /// `close()` was called; queued requests are finishing.
    Draining,
    Closed,
    Destroyed,
}

/// Point-in-time counters for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub connected: bool,
    /// Queued, not yet written.
    pub pending: usize,
    /// Written, response not finished.
    pub running: usize,
    pub size: usize,
    pub busy: bool,
    /// Requests written to a socket.
    pub written: u64,
    /// Written requests that finished or were re-queued.
    pub completed: u64,
    /// Consecutive failed connect attempts.
    pub connect_failures: u32,
}

struct Entry {
    seq: u64,
    request: Request,
    handler: HandlerCell,
    requeued: bool,
    responded: bool,
    /// `on_connect` was delivered. A requeued entry keeps it.
    connected: bool,
    timer: Option<TimerKey>,
    abort: Option<AbortRegistration>,
}

impl Entry {
    fn notify_connect(&mut self) {
        if !self.connected {
            self.connected = true;
            self.handler.connect();
        }
    }
}

struct H1State {
    parser: H1Parser,
    in_flight: VecDeque<Entry>,
    /// Nothing more may be written; the socket closes once in-flight drains.
    reset: bool,
}

struct H2State {
    session: Box<dyn H2Session>,
    streams: HashMap<StreamId, Entry>,
    max_streams: usize,
    going_away: bool,
}

enum Protocol {
    H1(H1State),
    H2(H2State),
}

impl Protocol {
    fn running(&self) -> usize {
        match self {
            Protocol::H1(h1) => h1.in_flight.len(),
            Protocol::H2(h2) => h2.streams.len(),
        }
    }
}

struct Socket {
    transport: Box<dyn Transport>,
    events: SocketEvents,
    protocol: Protocol,
}

/// What happens to a socket after it was worked on.
enum SocketFate {
    Keep,
    Close {
        error: DispatchError,
        culprit: Option<u64>,
    },
    Upgrade {
        entry: Entry,
        status: u16,
        headers: Headers,
        rest: Bytes,
    },
}

struct ConnectionInner {
    id: DispatcherId,
    origin: Origin,
    origin_label: String,
    options: ConnectionOptions,
    connector: Rc<dyn Connector>,
    pending: VecDeque<Entry>,
    socket: Option<Socket>,
    connecting: Option<SocketEvents>,
    connect_timer: Option<TimerKey>,
    keep_alive_timer: Option<TimerKey>,
    keep_alive_timeout: Duration,
    written: u64,
    completed: u64,
    next_seq: u64,
    need_drain: bool,
    closing: bool,
    closed: bool,
    destroyed: bool,
    close_callbacks: Vec<Box<dyn FnOnce()>>,
    connect_failures: u32,
    observers: Observers,
    sink: Rc<dyn SocketSink>,
    weak_self: Weak<RefCell<ConnectionInner>>,
}

struct ConnectionSink {
    inner: Weak<RefCell<ConnectionInner>>,
}

impl SocketSink for ConnectionSink {
    fn connected(&self, mut transport: Box<dyn Transport>) {
        match self.inner.upgrade() {
            Some(inner) => inner.borrow_mut().on_connected(transport),
            None => transport.destroy(),
        }
    }

    fn connect_failed(&self, error: DispatchError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.borrow_mut().on_connect_failed(error);
        }
    }

    fn data(&self, chunk: &[u8]) {
        if let Some(inner) = self.inner.upgrade() {
            inner.borrow_mut().on_data(chunk);
        }
    }

    fn closed(&self, error: Option<DispatchError>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.borrow_mut().on_closed(error);
        }
    }
}

/// A dispatcher bound to one origin over at most one socket at a time.
#[derive(Clone)]
pub struct Connection {
    id: DispatcherId,
    inner: Rc<RefCell<ConnectionInner>>,
}

impl Connection {
    pub fn new(origin: Origin, connector: Rc<dyn Connector>, options: ConnectionOptions) -> Self {
        let id = DispatcherId::new();
        let inner = Rc::new_cyclic(|weak: &Weak<RefCell<ConnectionInner>>| {
            let sink: Rc<dyn SocketSink> = Rc::new(ConnectionSink {
                inner: weak.clone(),
            });
            RefCell::new(ConnectionInner {
                id,
                origin_label: origin.to_string(),
                origin,
                keep_alive_timeout: options.keep_alive_timeout,
                options,
                connector,
                pending: VecDeque::new(),
                socket: None,
                connecting: None,
                connect_timer: None,
                keep_alive_timer: None,
                written: 0,
                completed: 0,
                next_seq: 0,
                need_drain: false,
                closing: false,
                closed: false,
                destroyed: false,
                close_callbacks: Vec::new(),
                connect_failures: 0,
                observers: Observers::default(),
                sink,
                weak_self: weak.clone(),
            })
        });
        Self { id, inner }
    }

    pub fn origin(&self) -> Origin {
        self.inner.borrow().origin.clone()
    }

    pub fn state(&self) -> ConnectionState {
        let inner = self.inner.borrow();
        if inner.destroyed {
            ConnectionState::Destroyed
        } else if inner.closed {
            ConnectionState::Closed
        } else if inner.closing {
            ConnectionState::Draining
        } else if inner.socket.is_some() {
            ConnectionState::Connected
        } else if inner.connecting.is_some() {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        let inner = self.inner.borrow();
        let running = inner.running();
        ConnectionStats {
            connected: inner.socket.is_some(),
            pending: inner.pending.len(),
            running,
            size: inner.pending.len() + running,
            busy: inner.is_busy(),
            written: inner.written,
            completed: inner.completed,
            connect_failures: inner.connect_failures,
        }
    }

    /// Whether another dispatch would exceed the pipelining or stream limit.
    pub fn is_busy(&self) -> bool {
        self.inner.borrow().is_busy()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.borrow().destroyed
    }

    pub fn is_closed(&self) -> bool {
        let inner = self.inner.borrow();
        inner.closing || inner.destroyed
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("origin", &self.inner.borrow().origin)
            .finish()
    }
}

impl Dispatcher for Connection {
    fn id(&self) -> DispatcherId {
        self.id
    }

    fn dispatch(&self, request: Request, handler: Box<dyn Handler>) -> bool {
        tasks::enter(|| self.inner.borrow_mut().dispatch(request, handler))
    }

    fn close(&self, callback: Option<Box<dyn FnOnce()>>) {
        tasks::enter(|| self.inner.borrow_mut().close(callback))
    }

    fn destroy(&self, error: Option<DispatchError>) {
        tasks::enter(|| self.inner.borrow_mut().destroy(error))
    }

    fn subscribe(&self, observer: Observer) -> Subscription {
        self.inner.borrow().observers.subscribe(observer)
    }
}

impl ConnectionInner {
    fn running(&self) -> usize {
        self.socket.as_ref().map_or(0, |s| s.protocol.running())
    }

    fn limit(&self) -> usize {
        match self.socket.as_ref().map(|s| &s.protocol) {
            Some(Protocol::H2(h2)) => h2.max_streams,
            _ => self.options.pipelining.max(1),
        }
    }

    fn is_busy(&self) -> bool {
        self.pending.len() + self.running() >= self.limit()
    }

    fn emit(&self, kind: EventKind, error: Option<DispatchError>) {
        let mut event = DispatcherEvent::new(kind, Some(self.origin.clone()), self.id);
        if let Some(error) = error {
            event = event.with_error(error);
        }
        self.observers.emit(event);
    }

    fn dispatch(&mut self, mut request: Request, handler: Box<dyn Handler>) -> bool {
        if self.destroyed {
            reject(handler, DispatchError::ClientDestroyed);
            return false;
        }
        if self.closing {
            reject(handler, DispatchError::ClientClosed);
            return false;
        }

        let mismatch = request
            .origin
            .as_ref()
            .filter(|origin| **origin != self.origin)
            .map(|origin| format!("request origin {origin} does not match {}", self.origin));
        if let Some(message) = mismatch {
            reject(handler, DispatchError::InvalidArgument(message));
            return !self.is_busy();
        }
        if request.origin.is_none() {
            request.origin = Some(self.origin.clone());
        }
        if let Err(e) = request.validate(self.options.strict_content_length) {
            tracing::debug!(connection_id = %self.id, error = %e, "request rejected");
            reject(handler, e);
            return !self.is_busy();
        }
        if request.is_aborted() {
            reject(handler, DispatchError::RequestAborted);
            return !self.is_busy();
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let abort = request.signal.as_ref().and_then(|signal| {
            let weak = self.weak_self.clone();
            signal.on_abort(move || {
                let weak = weak.clone();
                tasks::post(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.borrow_mut().abort(seq);
                    }
                });
            })
        });

        tracing::debug!(
            connection_id = %self.id,
            method = %request.method,
            path = %request.path,
            "request queued"
        );
        self.pending.push_back(Entry {
            seq,
            request,
            handler: HandlerCell::new(handler),
            requeued: false,
            responded: false,
            connected: false,
            timer: None,
            abort,
        });

        self.resume();

        let busy = self.is_busy();
        if busy {
            self.need_drain = true;
        }
        !busy
    }

    /// Drive the connection forward after any state change.
    fn resume(&mut self) {
        self.write_pending();
        if self.socket.is_none()
            && self.connecting.is_none()
            && !self.pending.is_empty()
            && !self.destroyed
            && !self.closed
        {
            self.connect();
        }
        self.update_keep_alive();
        self.maybe_finish_close();
        self.maybe_drain();
    }

    fn maybe_drain(&mut self) {
        if self.need_drain && !self.is_busy() && !self.closing && !self.destroyed {
            self.need_drain = false;
            self.emit(EventKind::Drain, None);
        }
    }

    fn connect(&mut self) {
        let events = SocketEvents::new(&self.sink);
        self.connecting = Some(events.clone());
        let weak = self.weak_self.clone();
        self.connect_timer = Some(timeouts::schedule(self.options.connect_timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.borrow_mut().on_connect_failed(DispatchError::ConnectTimeout);
            }
        }));
        tracing::debug!(connection_id = %self.id, origin = %self.origin, "connecting");
        self.connector.connect(&self.origin, events);
    }

    fn on_connected(&mut self, mut transport: Box<dyn Transport>) {
        let Some(events) = self.connecting.take() else {
            transport.destroy();
            return;
        };
        if let Some(key) = self.connect_timer.take() {
            timeouts::cancel(key);
        }

        let protocol = if transport.alpn_protocol() == Some("h2") {
            let factory = if self.options.allow_h2 {
                self.options.session_factory.clone()
            } else {
                None
            };
            match factory {
                Some(factory) => {
                    let mut session = factory.create(&self.origin);
                    let mut out = Vec::new();
                    session.start(&mut out);
                    if let Err(e) = flush(transport.as_mut(), out) {
                        events.sever();
                        transport.destroy();
                        self.fail_connect(e);
                        return;
                    }
                    Protocol::H2(H2State {
                        session,
                        streams: HashMap::new(),
                        max_streams: self.options.max_concurrent_streams.max(1),
                        going_away: false,
                    })
                }
                None => {
                    events.sever();
                    transport.destroy();
                    self.fail_connect(DispatchError::NotSupported(
                        "server negotiated h2 but it is not enabled".into(),
                    ));
                    return;
                }
            }
        } else {
            Protocol::H1(H1State {
                parser: H1Parser::new(self.options.max_header_size),
                in_flight: VecDeque::new(),
                reset: false,
            })
        };

        let alpn = match protocol {
            Protocol::H1(_) => "http/1.1",
            Protocol::H2(_) => "h2",
        };
        self.connect_failures = 0;
        tracing::info!(
            connection_id = %self.id,
            origin = %self.origin,
            protocol = alpn,
            "connected"
        );
        metrics::record_connection(&self.origin_label, ConnectionEvent::Connect);
        self.socket = Some(Socket {
            transport,
            events,
            protocol,
        });
        self.emit(EventKind::Connect, None);
        self.resume();
    }

    fn on_connect_failed(&mut self, error: DispatchError) {
        let Some(events) = self.connecting.take() else {
            return;
        };
        events.sever();
        if let Some(key) = self.connect_timer.take() {
            timeouts::cancel(key);
        }
        self.fail_connect(error);
        self.resume();
    }

    fn fail_connect(&mut self, error: DispatchError) {
        self.connect_failures = self.connect_failures.saturating_add(1);
        tracing::warn!(
            connection_id = %self.id,
            origin = %self.origin,
            failures = self.connect_failures,
            error = %error,
            "connect failed"
        );
        metrics::record_connection(&self.origin_label, ConnectionEvent::ConnectError);
        let pending: Vec<Entry> = self.pending.drain(..).collect();
        for entry in pending {
            self.fail_unwritten(entry, error.clone());
        }
        self.emit(EventKind::ConnectionError, Some(error));
    }

    fn on_data(&mut self, chunk: &[u8]) {
        let Some(mut socket) = self.socket.take() else {
            return;
        };
        tracing::trace!(connection_id = %self.id, bytes = chunk.len(), "socket data");
        let fate = match &mut socket.protocol {
            Protocol::H1(h1) => self.h1_receive(h1, Some(chunk)),
            Protocol::H2(h2) => self.h2_receive(socket.transport.as_mut(), h2, chunk),
        };
        self.settle(socket, fate);
        self.resume();
    }

    fn on_closed(&mut self, error: Option<DispatchError>) {
        let Some(mut socket) = self.socket.take() else {
            return;
        };
        let fate = match error {
            Some(error) => SocketFate::Close {
                error,
                culprit: None,
            },
            None => match &mut socket.protocol {
                Protocol::H1(h1) => self.h1_receive(h1, None),
                Protocol::H2(_) => SocketFate::Close {
                    error: DispatchError::socket_closed(),
                    culprit: None,
                },
            },
        };
        self.settle(socket, fate);
        self.resume();
    }

    fn write_pending(&mut self) {
        let Some(mut socket) = self.socket.take() else {
            return;
        };
        let fate = match &mut socket.protocol {
            Protocol::H1(h1) => self.write_h1(socket.transport.as_mut(), h1),
            Protocol::H2(h2) => self.write_h2(socket.transport.as_mut(), h2),
        };
        self.settle(socket, fate);
    }

    fn write_h1(&mut self, transport: &mut dyn Transport, h1: &mut H1State) -> SocketFate {
        let limit = self.options.pipelining.max(1);
        loop {
            if h1.reset || h1.in_flight.len() >= limit {
                break;
            }
            if h1
                .in_flight
                .back()
                .is_some_and(|last| last.request.blocking || last.request.is_upgrade())
            {
                break;
            }
            let Some(next) = self.pending.front() else {
                break;
            };
            if !h1.in_flight.is_empty()
                && (!next.request.is_idempotent()
                    || next.request.is_upgrade()
                    || matches!(next.request.body, Body::Stream(_)))
            {
                break;
            }
            let Some(mut entry) = self.pending.pop_front() else {
                break;
            };

            let reset = entry.request.wants_reset() || self.options.pipelining == 0;
            if reset {
                h1.reset = true;
            }
            h1.parser.expect(Expectation {
                head: entry.request.method == Method::HEAD,
                upgrade: entry.request.upgrade.is_some(),
                connect: entry.request.method == Method::CONNECT,
            });
            entry.notify_connect();
            self.written += 1;

            let seq = entry.seq;
            let result = write_h1_request(transport, &entry.request, &self.origin, reset);
            if h1.in_flight.is_empty() {
                self.arm_headers_timer(&mut entry);
            }
            tracing::trace!(connection_id = %self.id, seq, "request written");
            h1.in_flight.push_back(entry);
            if let Err(error) = result {
                return SocketFate::Close {
                    error,
                    culprit: Some(seq),
                };
            }
        }
        SocketFate::Keep
    }

    fn write_h2(&mut self, transport: &mut dyn Transport, h2: &mut H2State) -> SocketFate {
        let mut out = Vec::new();
        while !h2.going_away && h2.streams.len() < h2.max_streams {
            let Some(mut entry) = self.pending.pop_front() else {
                break;
            };
            if entry.request.is_upgrade() {
                self.fail_unwritten(
                    entry,
                    DispatchError::NotSupported("upgrade over HTTP/2".into()),
                );
                continue;
            }

            let end_stream = matches!(&entry.request.body, Body::Empty)
                || matches!(&entry.request.body, Body::Bytes(b) if b.is_empty());
            let stream =
                match h2
                    .session
                    .open_stream(&entry.request, &self.origin, end_stream, &mut out)
                {
                    Ok(stream) => stream,
                    Err(e) => {
                        self.fail_unwritten(entry, e);
                        continue;
                    }
                };
            entry.notify_connect();
            self.written += 1;

            let body = if end_stream {
                Ok(())
            } else {
                send_h2_body(h2.session.as_mut(), stream, &entry.request.body, &mut out)
            };
            if let Err(e) = body {
                h2.session.reset_stream(stream, &mut out);
                self.finish_written(&mut entry, Outcome::Failed);
                entry.handler.error(e);
                continue;
            }

            self.arm_headers_timer(&mut entry);
            h2.streams.insert(stream, entry);
        }
        match flush(transport, out) {
            Ok(()) => SocketFate::Keep,
            Err(error) => SocketFate::Close {
                error,
                culprit: None,
            },
        }
    }

    fn h1_receive(&mut self, h1: &mut H1State, data: Option<&[u8]>) -> SocketFate {
        let mut events = Vec::new();
        let result = match data {
            Some(chunk) => h1.parser.feed(chunk, &mut events),
            None => h1.parser.finish(&mut events),
        };

        for event in events {
            match event {
                ParserEvent::Headers {
                    status,
                    headers,
                    version,
                    keep_alive,
                } => {
                    let Some(entry) = h1.in_flight.front_mut() else {
                        return unexpected_response();
                    };
                    entry.responded = true;
                    if !keep_alive {
                        h1.reset = true;
                    } else if let Some(hint) = keep_alive_hint(&headers) {
                        let timeout = hint
                            .saturating_sub(self.options.keep_alive_timeout_threshold)
                            .min(self.options.keep_alive_max_timeout);
                        if timeout < Duration::from_secs(1) {
                            h1.reset = true;
                        } else {
                            self.keep_alive_timeout = timeout;
                        }
                    } else {
                        self.keep_alive_timeout = self.options.keep_alive_timeout;
                    }
                    tracing::trace!(
                        connection_id = %self.id,
                        status,
                        version,
                        keep_alive,
                        "response headers"
                    );
                    self.arm_body_timer(entry);
                    entry.handler.headers(status, headers);
                }
                ParserEvent::Body(chunk) => {
                    let Some(entry) = h1.in_flight.front_mut() else {
                        return unexpected_response();
                    };
                    self.arm_body_timer(entry);
                    entry.handler.data(chunk);
                }
                ParserEvent::Complete { trailers } => {
                    let Some(mut entry) = h1.in_flight.pop_front() else {
                        return unexpected_response();
                    };
                    self.finish_written(&mut entry, Outcome::Completed);
                    entry.handler.complete(Completion {
                        trailers,
                        redirects: Vec::new(),
                    });
                    if let Some(next) = h1.in_flight.front_mut() {
                        self.arm_headers_timer(next);
                    }
                    if h1.reset {
                        return SocketFate::Close {
                            error: if h1.in_flight.is_empty() {
                                DispatchError::Informational("socket reset".into())
                            } else {
                                DispatchError::socket_closed()
                            },
                            culprit: None,
                        };
                    }
                }
                ParserEvent::Upgrade {
                    status,
                    headers,
                    rest,
                } => {
                    let Some(mut entry) = h1.in_flight.pop_front() else {
                        return unexpected_response();
                    };
                    self.finish_written(&mut entry, Outcome::Upgraded);
                    return SocketFate::Upgrade {
                        entry,
                        status,
                        headers,
                        rest,
                    };
                }
            }
        }

        match result {
            Err(error) => SocketFate::Close {
                error,
                culprit: h1.in_flight.front().map(|e| e.seq),
            },
            Ok(()) if data.is_none() => SocketFate::Close {
                error: DispatchError::socket_closed(),
                culprit: None,
            },
            Ok(()) => SocketFate::Keep,
        }
    }

    fn h2_receive(
        &mut self,
        transport: &mut dyn Transport,
        h2: &mut H2State,
        data: &[u8],
    ) -> SocketFate {
        let mut events = Vec::new();
        let mut out = Vec::new();
        let result = h2.session.receive(data, &mut events, &mut out);

        for event in events {
            match event {
                SessionEvent::Headers {
                    stream,
                    status,
                    headers,
                } => {
                    if let Some(entry) = h2.streams.get_mut(&stream) {
                        entry.responded = true;
                        self.arm_body_timer(entry);
                        entry.handler.headers(status, headers);
                    }
                }
                SessionEvent::Data { stream, chunk } => {
                    if let Some(entry) = h2.streams.get_mut(&stream) {
                        self.arm_body_timer(entry);
                        entry.handler.data(chunk);
                    }
                }
                SessionEvent::Complete { stream, trailers } => {
                    if let Some(mut entry) = h2.streams.remove(&stream) {
                        self.finish_written(&mut entry, Outcome::Completed);
                        entry.handler.complete(Completion {
                            trailers,
                            redirects: Vec::new(),
                        });
                    }
                }
                SessionEvent::Reset { stream, error } => {
                    if let Some(mut entry) = h2.streams.remove(&stream) {
                        self.finish_written(&mut entry, Outcome::Failed);
                        entry.handler.error(error);
                    }
                }
                SessionEvent::GoAway { last_stream, error } => {
                    if let Some(error) = error {
                        return SocketFate::Close {
                            error,
                            culprit: None,
                        };
                    }
                    tracing::debug!(connection_id = %self.id, last_stream, "received GOAWAY");
                    h2.going_away = true;
                    let mut refused: Vec<Entry> = Vec::new();
                    let ids: Vec<StreamId> =
                        h2.streams.keys().filter(|id| **id > last_stream).copied().collect();
                    for id in ids {
                        if let Some(entry) = h2.streams.remove(&id) {
                            refused.push(entry);
                        }
                    }
                    refused.sort_by_key(|e| e.seq);
                    self.salvage_all(refused, &goaway_error(), true);
                }
                SessionEvent::MaxConcurrentStreams(max) => {
                    h2.max_streams = max.min(self.options.max_concurrent_streams).max(1);
                }
            }
        }

        if let Err(error) = flush(transport, out) {
            return SocketFate::Close {
                error,
                culprit: None,
            };
        }
        match result {
            Err(error) => SocketFate::Close {
                error,
                culprit: None,
            },
            Ok(()) if h2.going_away && h2.streams.is_empty() => SocketFate::Close {
                error: goaway_error(),
                culprit: None,
            },
            Ok(()) => SocketFate::Keep,
        }
    }

    fn settle(&mut self, socket: Socket, fate: SocketFate) {
        match fate {
            SocketFate::Keep => self.socket = Some(socket),
            SocketFate::Close { error, culprit } => self.teardown(socket, error, culprit, true),
            SocketFate::Upgrade {
                entry,
                status,
                headers,
                rest,
            } => {
                let Socket {
                    transport, events, ..
                } = socket;
                self.cancel_keep_alive();
                tracing::info!(connection_id = %self.id, status, "socket upgraded");
                let upgraded = Upgraded::new(transport, events, rest);
                entry.handler.upgrade(status, headers, upgraded);
                metrics::record_connection(&self.origin_label, ConnectionEvent::Disconnect);
                self.emit(
                    EventKind::Disconnect,
                    Some(DispatchError::Informational("upgrade".into())),
                );
            }
        }
    }

    /// Destroy `socket` and resolve everything it carried.
    ///
    /// `culprit` receives `error`. With `recover`, unanswered idempotent
    /// requests that were never re-queued go back to the front of the queue.
    fn teardown(
        &mut self,
        socket: Socket,
        error: DispatchError,
        culprit: Option<u64>,
        recover: bool,
    ) {
        let Socket {
            mut transport,
            events,
            protocol,
        } = socket;
        events.sever();
        transport.destroy();
        self.cancel_keep_alive();

        let mut entries: Vec<Entry> = match protocol {
            Protocol::H1(h1) => h1.in_flight.into_iter().collect(),
            Protocol::H2(h2) => h2.streams.into_values().collect(),
        };
        entries.sort_by_key(|e| e.seq);

        let collateral = match error {
            DispatchError::RequestAborted => {
                DispatchError::Informational("socket closed after request abort".into())
            }
            ref other => other.clone(),
        };

        let mut survivors = Vec::new();
        for mut entry in entries {
            if Some(entry.seq) == culprit {
                let outcome = match error {
                    DispatchError::RequestAborted => Outcome::Aborted,
                    _ => Outcome::Failed,
                };
                self.finish_written(&mut entry, outcome);
                entry.handler.error(error.clone());
            } else {
                survivors.push(entry);
            }
        }
        self.salvage_all(survivors, &collateral, recover);

        match &error {
            DispatchError::Informational(_) | DispatchError::ClientClosed => {
                tracing::debug!(connection_id = %self.id, reason = %error, "socket closed")
            }
            _ => tracing::warn!(
                connection_id = %self.id,
                origin = %self.origin,
                error = %error,
                "socket closed with error"
            ),
        }
        metrics::record_connection(&self.origin_label, ConnectionEvent::Disconnect);
        self.emit(EventKind::Disconnect, Some(error));
    }

    /// Resolve written requests that lost their socket, in write order.
    fn salvage_all(&mut self, entries: Vec<Entry>, error: &DispatchError, recover: bool) {
        let mut requeue = Vec::new();
        for mut entry in entries {
            if let Some(key) = entry.timer.take() {
                timeouts::cancel(key);
            }
            self.completed += 1;
            if recover && !entry.responded && !entry.requeued && entry.request.is_idempotent() {
                entry.requeued = true;
                requeue.push(entry);
            } else {
                entry.abort = None;
                metrics::record_request(&self.origin_label, Outcome::Failed);
                entry.handler.error(error.clone());
            }
        }
        if !requeue.is_empty() {
            tracing::debug!(
                connection_id = %self.id,
                count = requeue.len(),
                "re-queueing idempotent requests"
            );
        }
        for entry in requeue.into_iter().rev() {
            self.pending.push_front(entry);
        }
    }

    fn finish_written(&mut self, entry: &mut Entry, outcome: Outcome) {
        if let Some(key) = entry.timer.take() {
            timeouts::cancel(key);
        }
        entry.abort = None;
        self.completed += 1;
        metrics::record_request(&self.origin_label, outcome);
    }

    fn fail_unwritten(&self, mut entry: Entry, error: DispatchError) {
        if let Some(key) = entry.timer.take() {
            timeouts::cancel(key);
        }
        entry.abort = None;
        let outcome = match error {
            DispatchError::RequestAborted => Outcome::Aborted,
            _ => Outcome::Failed,
        };
        metrics::record_request(&self.origin_label, outcome);
        entry.handler.error(error);
    }

    fn abort(&mut self, seq: u64) {
        if let Some(pos) = self.pending.iter().position(|e| e.seq == seq) {
            if let Some(entry) = self.pending.remove(pos) {
                tracing::debug!(connection_id = %self.id, seq, "queued request aborted");
                self.fail_unwritten(entry, DispatchError::RequestAborted);
            }
            self.resume();
            return;
        }
        self.fail_in_flight(seq, DispatchError::RequestAborted);
        self.resume();
    }

    fn on_timeout(&mut self, seq: u64, error: DispatchError) {
        tracing::warn!(connection_id = %self.id, seq, error = %error, "request timed out");
        self.fail_in_flight(seq, error);
        self.resume();
    }

    /// Fail one written request. HTTP/1.1 loses the socket; HTTP/2 resets
    /// the stream only.
    fn fail_in_flight(&mut self, seq: u64, error: DispatchError) {
        let Some(mut socket) = self.socket.take() else {
            return;
        };
        let fate = match &mut socket.protocol {
            Protocol::H1(h1) => {
                if h1.in_flight.iter().any(|e| e.seq == seq) {
                    SocketFate::Close {
                        error,
                        culprit: Some(seq),
                    }
                } else {
                    SocketFate::Keep
                }
            }
            Protocol::H2(h2) => {
                let stream = h2
                    .streams
                    .iter()
                    .find(|(_, e)| e.seq == seq)
                    .map(|(id, _)| *id);
                match stream.and_then(|id| h2.streams.remove(&id).map(|e| (id, e))) {
                    Some((id, mut entry)) => {
                        let mut out = Vec::new();
                        h2.session.reset_stream(id, &mut out);
                        let outcome = match error {
                            DispatchError::RequestAborted => Outcome::Aborted,
                            _ => Outcome::Failed,
                        };
                        self.finish_written(&mut entry, outcome);
                        entry.handler.error(error);
                        match flush(socket.transport.as_mut(), out) {
                            Ok(()) => SocketFate::Keep,
                            Err(error) => SocketFate::Close {
                                error,
                                culprit: None,
                            },
                        }
                    }
                    None => SocketFate::Keep,
                }
            }
        };
        self.settle(socket, fate);
    }

    fn arm_timer(&self, entry: &mut Entry, delay: Duration, error: DispatchError) {
        if let Some(key) = entry.timer.take() {
            timeouts::cancel(key);
        }
        let weak = self.weak_self.clone();
        let seq = entry.seq;
        entry.timer = Some(timeouts::schedule(delay, move || {
            if let Some(inner) = weak.upgrade() {
                inner.borrow_mut().on_timeout(seq, error);
            }
        }));
    }

    fn arm_headers_timer(&self, entry: &mut Entry) {
        let delay = entry
            .request
            .headers_timeout
            .unwrap_or(self.options.headers_timeout);
        self.arm_timer(entry, delay, DispatchError::HeadersTimeout);
    }

    fn arm_body_timer(&self, entry: &mut Entry) {
        let delay = entry.request.body_timeout.unwrap_or(self.options.body_timeout);
        self.arm_timer(entry, delay, DispatchError::BodyTimeout);
    }

    fn update_keep_alive(&mut self) {
        let idle = self.socket.is_some() && self.running() == 0 && self.pending.is_empty();
        if !idle {
            self.cancel_keep_alive();
            return;
        }
        if self.keep_alive_timer.is_some() {
            return;
        }
        let weak = self.weak_self.clone();
        self.keep_alive_timer = Some(timeouts::schedule(self.keep_alive_timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.borrow_mut().on_keep_alive_expired();
            }
        }));
    }

    fn cancel_keep_alive(&mut self) {
        if let Some(key) = self.keep_alive_timer.take() {
            timeouts::cancel(key);
        }
    }

    fn on_keep_alive_expired(&mut self) {
        self.keep_alive_timer = None;
        if self.running() > 0 || !self.pending.is_empty() {
            return;
        }
        if let Some(socket) = self.socket.take() {
            self.teardown(
                socket,
                DispatchError::Informational("socket idle timeout".into()),
                None,
                true,
            );
        }
        self.resume();
    }

    fn close(&mut self, callback: Option<Box<dyn FnOnce()>>) {
        if let Some(callback) = callback {
            if self.closed {
                tasks::defer(callback);
                return;
            }
            self.close_callbacks.push(callback);
        }
        if !self.closing {
            tracing::debug!(connection_id = %self.id, "closing");
        }
        self.closing = true;
        self.maybe_finish_close();
    }

    fn maybe_finish_close(&mut self) {
        if !self.closing || self.closed || !self.pending.is_empty() || self.running() > 0 {
            return;
        }
        if let Some(events) = self.connecting.take() {
            events.sever();
        }
        if let Some(key) = self.connect_timer.take() {
            timeouts::cancel(key);
        }
        self.closed = true;
        if let Some(socket) = self.socket.take() {
            self.teardown(socket, DispatchError::ClientClosed, None, false);
        }
        tracing::info!(connection_id = %self.id, origin = %self.origin, "connection closed");
        for callback in self.close_callbacks.drain(..) {
            tasks::defer(callback);
        }
    }

    fn destroy(&mut self, error: Option<DispatchError>) {
        if self.destroyed {
            return;
        }
        let error = error.unwrap_or(DispatchError::ClientDestroyed);
        self.destroyed = true;
        self.closing = true;
        self.closed = true;

        if let Some(events) = self.connecting.take() {
            events.sever();
        }
        if let Some(key) = self.connect_timer.take() {
            timeouts::cancel(key);
        }
        self.cancel_keep_alive();
        if let Some(socket) = self.socket.take() {
            self.teardown(socket, error.clone(), None, false);
        }
        let pending: Vec<Entry> = self.pending.drain(..).collect();
        for entry in pending {
            self.fail_unwritten(entry, error.clone());
        }
        tracing::info!(connection_id = %self.id, origin = %self.origin, "connection destroyed");
        for callback in self.close_callbacks.drain(..) {
            tasks::defer(callback);
        }
    }
}

fn write_h1_request(
    transport: &mut dyn Transport,
    request: &Request,
    origin: &Origin,
    reset: bool,
) -> Result<(), DispatchError> {
    let chunks = match &request.body {
        Body::Stream(stream) => Some(stream.take().ok_or_else(|| {
            DispatchError::InvalidArgument("request body stream already consumed".into())
        })?),
        _ => None,
    };
    let head = h1::encode_head(request, origin, reset);
    transport.write(head.bytes)?;

    if let Body::Bytes(bytes) = &request.body {
        if !bytes.is_empty() {
            transport.write(bytes.clone())?;
        }
    }
    if let Some(chunks) = chunks {
        for chunk in chunks {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            let framed = if head.chunked {
                h1::encode_chunk(&chunk)
            } else {
                chunk
            };
            transport.write(framed)?;
        }
        if head.chunked {
            transport.write(Bytes::from_static(LAST_CHUNK))?;
        }
    }
    Ok(())
}

fn send_h2_body(
    session: &mut dyn H2Session,
    stream: StreamId,
    body: &Body,
    out: &mut Vec<Bytes>,
) -> Result<(), DispatchError> {
    match body {
        Body::Empty => session.send_data(stream, Bytes::new(), true, out),
        Body::Bytes(bytes) => session.send_data(stream, bytes.clone(), true, out),
        Body::Stream(stream_body) => {
            let chunks = stream_body.take().ok_or_else(|| {
                DispatchError::InvalidArgument("request body stream already consumed".into())
            })?;
            for chunk in chunks {
                let chunk = chunk?;
                if !chunk.is_empty() {
                    session.send_data(stream, chunk, false, out)?;
                }
            }
            session.send_data(stream, Bytes::new(), true, out)
        }
    }
}

fn flush(transport: &mut dyn Transport, out: Vec<Bytes>) -> Result<(), DispatchError> {
    for bytes in out {
        transport.write(bytes)?;
    }
    Ok(())
}

fn unexpected_response() -> SocketFate {
    SocketFate::Close {
        error: DispatchError::HttpParser("response without a pending request".into()),
        culprit: None,
    }
}

fn goaway_error() -> DispatchError {
    DispatchError::Informational("HTTP/2: GOAWAY frame received".into())
}

/// `timeout=N` from a `Keep-Alive` response header.
fn keep_alive_hint(headers: &Headers) -> Option<Duration> {
    let value = headers.get("keep-alive")?;
    value.split(',').find_map(|part| {
        let (key, secs) = part.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("timeout") {
            secs.trim().parse::<u64>().ok().map(Duration::from_secs)
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_alive_hint_parsing() {
        let headers: Headers = [("Keep-Alive", "max=100, timeout=5")].into_iter().collect();
        assert_eq!(keep_alive_hint(&headers), Some(Duration::from_secs(5)));

        let headers: Headers = [("keep-alive", "timeout=abc")].into_iter().collect();
        assert_eq!(keep_alive_hint(&headers), None);
        assert_eq!(keep_alive_hint(&Headers::new()), None);
    }

    #[test]
    fn test_default_options() {
        let options = ConnectionOptions::default();
        assert_eq!(options.pipelining, 1);
        assert_eq!(options.keep_alive_timeout, Duration::from_secs(4));
        assert!(!options.allow_h2);
        assert!(format!("{options:?}").contains("session_factory: false"));
    }
}
