//! Dispatch contract shared by every layer of the client.
//!
//! # Data Flow
//! ```text
//! caller → interceptors (redirect, retry, ...)
//!     → Agent (per-origin routing)
//!     → ConnectionPool / BalancedPool
//!     → Connection (socket, parser, timers)
//!     → Handler callbacks, delivered through tasks.rs
//! ```
//!
//! # Design Decisions
//! - Every layer implements `Dispatcher`, so layers nest arbitrarily
//! - Dispatchers are cheap `Clone` handles over private state
//! - Single-threaded: state lives in `Rc<RefCell<_>>`, callbacks are deferred

pub mod abort;
pub mod events;
pub mod handler;
pub mod interceptor;
pub mod request;
pub(crate) mod tasks;

use std::sync::atomic::{AtomicU64, Ordering};

pub use abort::{AbortController, AbortRegistration, AbortSignal};
pub use events::{DispatcherEvent, EventKind, Observer, Subscription};
pub use handler::{Completion, Handler, UpgradeEvent, Upgraded};
pub use interceptor::{compose, Interceptor};
pub use request::{Body, Headers, Origin, Request, StreamBody};

use crate::error::DispatchError;

/// Only uniqueness matters, so relaxed ordering is enough.
static DISPATCHER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a dispatcher, used in events and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatcherId(u64);

impl DispatcherId {
    pub fn new() -> Self {
        Self(DISPATCHER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for DispatcherId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DispatcherId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "disp-{}", self.0)
    }
}

/// Something requests can be dispatched to.
pub trait Dispatcher {
    fn id(&self) -> DispatcherId;

    /// Queue `request`; `handler` receives its lifecycle.
    ///
    /// Returns `false` when the dispatcher is saturated. The request is still
    /// accepted, but the caller should wait for a `Drain` event before
    /// dispatching more.
    fn dispatch(&self, request: Request, handler: Box<dyn Handler>) -> bool;

    /// Stop accepting requests, let queued ones finish, then release sockets
    /// and invoke `callback`.
    fn close(&self, callback: Option<Box<dyn FnOnce()>>);

    /// Fail every queued and in-flight request with `error` (default
    /// `ClientDestroyed`) and release sockets immediately.
    fn destroy(&self, error: Option<DispatchError>);

    fn subscribe(&self, observer: Observer) -> Subscription;
}

/// Shared dispatchers, e.g. the output of [`compose`], dispatch like the
/// dispatcher they point to.
impl Dispatcher for std::rc::Rc<dyn Dispatcher> {
    fn id(&self) -> DispatcherId {
        (**self).id()
    }

    fn dispatch(&self, request: Request, handler: Box<dyn Handler>) -> bool {
        (**self).dispatch(request, handler)
    }

    fn close(&self, callback: Option<Box<dyn FnOnce()>>) {
        (**self).close(callback)
    }

    fn destroy(&self, error: Option<DispatchError>) {
        (**self).destroy(error)
    }

    fn subscribe(&self, observer: Observer) -> Subscription {
        (**self).subscribe(observer)
    }
}

/// Deliver `error` to a handler whose request never reached a queue.
/// Must run inside a delivery scope.
pub(crate) fn reject(handler: Box<dyn Handler>, error: DispatchError) {
    handler::HandlerCell::new(handler).error(error);
}
