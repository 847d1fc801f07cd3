//! Caller-supplied lifecycle callbacks.
//!
//! Exactly one terminal callback (`on_complete`, `on_error` or
//! `on_upgrade`) fires per dispatched request. Terminal callbacks consume the
//! handler, so a second one cannot be expressed.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;
use url::Url;

use crate::dispatcher::request::Headers;
use crate::dispatcher::tasks;
use crate::error::DispatchError;
use crate::net::transport::{SocketEvents, SocketSink, Transport};

/// Final outcome of a successful request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub trailers: Headers,
    /// URLs left behind by followed redirects, in visitation order.
    pub redirects: Vec<Url>,
}

pub trait Handler {
    /// The request was written to a socket.
    fn on_connect(&mut self) {}

    /// The final response head arrived.
    fn on_headers(&mut self, status: u16, headers: Headers);

    fn on_data(&mut self, chunk: Bytes);

    fn on_complete(self: Box<Self>, completion: Completion);

    fn on_error(self: Box<Self>, error: DispatchError);

    /// The server accepted an upgrade or CONNECT; the socket now belongs to
    /// the handler.
    fn on_upgrade(self: Box<Self>, status: u16, headers: Headers, socket: Upgraded) {
        let _ = (status, headers);
        socket.destroy();
        self.on_error(DispatchError::NotSupported("upgrade".into()))
    }
}

/// Engine-side slot for a handler.
///
/// Every call is deferred to the delivery queue; terminal calls empty the
/// slot so later events for the same request are dropped.
#[derive(Clone)]
pub(crate) struct HandlerCell(Rc<RefCell<Option<Box<dyn Handler>>>>);

impl HandlerCell {
    pub(crate) fn new(handler: Box<dyn Handler>) -> Self {
        Self(Rc::new(RefCell::new(Some(handler))))
    }

    pub(crate) fn connect(&self) {
        let cell = self.0.clone();
        tasks::defer(move || {
            if let Some(h) = cell.borrow_mut().as_mut() {
                h.on_connect();
            }
        });
    }

    pub(crate) fn headers(&self, status: u16, headers: Headers) {
        let cell = self.0.clone();
        tasks::defer(move || {
            if let Some(h) = cell.borrow_mut().as_mut() {
                h.on_headers(status, headers);
            }
        });
    }

    pub(crate) fn data(&self, chunk: Bytes) {
        let cell = self.0.clone();
        tasks::defer(move || {
            if let Some(h) = cell.borrow_mut().as_mut() {
                h.on_data(chunk);
            }
        });
    }

    pub(crate) fn complete(self, completion: Completion) {
        tasks::defer(move || {
            let handler = self.0.borrow_mut().take();
            if let Some(h) = handler {
                h.on_complete(completion);
            }
        });
    }

    pub(crate) fn error(self, error: DispatchError) {
        tasks::defer(move || {
            let handler = self.0.borrow_mut().take();
            if let Some(h) = handler {
                h.on_error(error);
            }
        });
    }

    pub(crate) fn upgrade(self, status: u16, headers: Headers, socket: Upgraded) {
        tasks::defer(move || {
            let handler = self.0.borrow_mut().take();
            match handler {
                Some(h) => h.on_upgrade(status, headers, socket),
                None => socket.destroy(),
            }
        });
    }
}

/// Notification on an upgraded socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeEvent {
    Data(Bytes),
    Closed(Option<DispatchError>),
}

type UpgradeReader = Box<dyn FnMut(UpgradeEvent)>;

#[derive(Default)]
struct UpgradeShared {
    buffered: RefCell<VecDeque<UpgradeEvent>>,
    reader: RefCell<Option<UpgradeReader>>,
    closed: Cell<bool>,
}

impl UpgradeShared {
    fn deliver(&self, event: UpgradeEvent) {
        let mut reader = self.reader.borrow_mut();
        match reader.as_mut() {
            Some(read) => read(event),
            None => self.buffered.borrow_mut().push_back(event),
        }
    }
}

impl SocketSink for UpgradeShared {
    fn connected(&self, mut transport: Box<dyn Transport>) {
        transport.destroy();
    }

    fn connect_failed(&self, _error: DispatchError) {}

    fn data(&self, chunk: &[u8]) {
        self.deliver(UpgradeEvent::Data(Bytes::copy_from_slice(chunk)));
    }

    fn closed(&self, error: Option<DispatchError>) {
        if !self.closed.replace(true) {
            self.deliver(UpgradeEvent::Closed(error));
        }
    }
}

/// A socket handed over by an upgrade or CONNECT.
///
/// Bytes the server sent after the response head are delivered first.
/// Events arriving before a reader is attached are buffered.
pub struct Upgraded {
    transport: Box<dyn Transport>,
    events: SocketEvents,
    shared: Rc<UpgradeShared>,
}

impl Upgraded {
    pub(crate) fn new(transport: Box<dyn Transport>, events: SocketEvents, head: Bytes) -> Self {
        let shared = Rc::new(UpgradeShared::default());
        if !head.is_empty() {
            shared.buffered.borrow_mut().push_back(UpgradeEvent::Data(head));
        }
        let sink: Rc<dyn SocketSink> = shared.clone();
        events.attach(&sink);
        Self {
            transport,
            events,
            shared,
        }
    }

    /// Attach the reader. Buffered events are replayed immediately.
    pub fn on_event(&self, reader: impl FnMut(UpgradeEvent) + 'static) {
        let mut reader: UpgradeReader = Box::new(reader);
        let backlog: Vec<UpgradeEvent> = self.shared.buffered.borrow_mut().drain(..).collect();
        for event in backlog {
            reader(event);
        }
        *self.shared.reader.borrow_mut() = Some(reader);
    }

    pub fn write(&mut self, data: Bytes) -> Result<(), DispatchError> {
        if self.shared.closed.get() {
            return Err(DispatchError::socket_closed());
        }
        self.transport.write(data)
    }

    pub fn destroy(mut self) {
        self.events.sever();
        self.transport.destroy();
    }
}

impl Drop for Upgraded {
    fn drop(&mut self) {
        // The sink is only weakly referenced by the link.
        self.events.sever();
    }
}
