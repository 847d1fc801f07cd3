//! Transport and connector seam.
//!
//! # Responsibilities
//! - Abstract a byte-stream socket (plain TCP, TLS, in-memory test doubles)
//! - Carry socket notifications back to exactly one owner
//!
//! # Data Flow
//! ```text
//! Connection → Connector::connect(origin, SocketEvents)
//!     → SocketEvents::connected(transport) / connect_failed(err)
//!     → SocketEvents::data(bytes) ... closed(err)
//!     → owner (Connection, or Upgraded after a protocol switch)
//! ```
//!
//! # Design Decisions
//! - Notifications are posted to the delivery queue, never run inline
//! - A severed link drops late notifications from a discarded socket

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use bytes::Bytes;

use crate::dispatcher::request::Origin;
use crate::dispatcher::tasks;
use crate::error::DispatchError;

/// An established byte-stream socket.
pub trait Transport {
    /// Queue bytes for writing.
    fn write(&mut self, data: Bytes) -> Result<(), DispatchError>;

    /// Close the socket immediately. Further notifications are not expected.
    fn destroy(&mut self);

    /// Protocol negotiated through ALPN, if any.
    fn alpn_protocol(&self) -> Option<&str> {
        None
    }
}

/// Opens sockets to an origin.
pub trait Connector {
    /// Start connecting. The outcome is reported through `events`.
    fn connect(&self, origin: &Origin, events: SocketEvents);
}

/// Receiver of socket notifications.
pub(crate) trait SocketSink {
    fn connected(&self, transport: Box<dyn Transport>);
    fn connect_failed(&self, error: DispatchError);
    fn data(&self, chunk: &[u8]);
    fn closed(&self, error: Option<DispatchError>);
}

/// One-way link from a socket to its owner.
#[derive(Clone)]
pub struct SocketEvents {
    link: Rc<RefCell<Option<Weak<dyn SocketSink>>>>,
}

impl SocketEvents {
    pub(crate) fn new(sink: &Rc<dyn SocketSink>) -> Self {
        Self {
            link: Rc::new(RefCell::new(Some(Rc::downgrade(sink)))),
        }
    }

    /// Point the link at a new owner.
    pub(crate) fn attach(&self, sink: &Rc<dyn SocketSink>) {
        *self.link.borrow_mut() = Some(Rc::downgrade(sink));
    }

    /// Drop all further notifications.
    pub(crate) fn sever(&self) {
        self.link.borrow_mut().take();
    }

    /// Whether anyone still listens. Socket drivers stop reading once false.
    pub fn is_severed(&self) -> bool {
        self.sink().is_none()
    }

    fn sink(&self) -> Option<Rc<dyn SocketSink>> {
        self.link.borrow().as_ref().and_then(Weak::upgrade)
    }

    /// The socket connected.
    pub fn connected(&self, transport: Box<dyn Transport>) {
        let events = self.clone();
        tasks::post(move || match events.sink() {
            Some(sink) => sink.connected(transport),
            None => {
                let mut transport = transport;
                transport.destroy();
            }
        });
    }

    /// The connect attempt failed.
    pub fn connect_failed(&self, error: DispatchError) {
        let events = self.clone();
        tasks::post(move || {
            if let Some(sink) = events.sink() {
                sink.connect_failed(error);
            }
        });
    }

    /// Bytes arrived.
    pub fn data(&self, chunk: &[u8]) {
        let events = self.clone();
        let chunk = Bytes::copy_from_slice(chunk);
        tasks::post(move || {
            if let Some(sink) = events.sink() {
                sink.data(&chunk);
            }
        });
    }

    /// The socket closed, cleanly (`None`) or with an error.
    pub fn closed(&self, error: Option<DispatchError>) {
        let events = self.clone();
        tasks::post(move || {
            if let Some(sink) = events.sink() {
                sink.closed(error);
            }
        });
    }
}
