//! Connection pool for one origin.
//!
//! # Responsibilities
//! - Spread requests over up to `connections` sockets to the same origin
//! - Queue requests no connection can take, FIFO across the whole pool
//! - Re-dispatch queued requests when a connection drains
//! - Re-emit connection events with the pool prepended to `targets`
//! - Forget connections that went away with nothing left to do

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::dispatcher::abort::AbortRegistration;
use crate::dispatcher::events::Observers;
use crate::dispatcher::request::{Origin, Request};
use crate::dispatcher::{
    reject, tasks, Dispatcher, DispatcherEvent, DispatcherId, EventKind, Handler, Observer,
    Subscription,
};
use crate::error::DispatchError;
use crate::net::connection::{Connection, ConnectionOptions, ConnectionState};
use crate::net::transport::Connector;
use crate::observability::metrics::{self, Outcome};
use crate::queue::FixedQueue;

#[derive(Debug, Clone, Default)]
pub struct PoolOptions {
    /// Maximum sockets to the origin. `None` is unlimited.
    pub connections: Option<usize>,
    pub connection: ConnectionOptions,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    /// Connections with an open socket.
    pub connected: usize,
    /// Connected and able to take another request.
    pub free: usize,
    /// Requests not yet written: pool queue plus connection queues.
    pub pending: usize,
    /// Requests waiting in the pool's own queue.
    pub queued: usize,
    /// Requests written and awaiting a response.
    pub running: usize,
    /// Everything the pool is responsible for.
    pub size: usize,
}

struct Queued {
    request: Request,
    handler: Box<dyn Handler>,
    abort: Option<AbortRegistration>,
}

/// A queue slot. Emptied in place when its request is aborted.
type QueueSlot = Rc<RefCell<Option<Queued>>>;

struct PoolClient {
    connection: Connection,
    _subscription: Subscription,
}

struct CloseState {
    done: bool,
    callbacks: Vec<Box<dyn FnOnce()>>,
}

struct PoolInner {
    id: DispatcherId,
    origin: Origin,
    origin_label: String,
    options: PoolOptions,
    connector: Rc<dyn Connector>,
    clients: Vec<PoolClient>,
    queue: FixedQueue<QueueSlot>,
    /// Live entries in `queue`.
    queued: usize,
    need_drain: bool,
    closing: bool,
    /// Connections were asked to close.
    close_started: bool,
    destroyed: bool,
    close: Rc<RefCell<CloseState>>,
    observers: Observers,
    weak_self: Weak<RefCell<PoolInner>>,
}

#[derive(Clone)]
pub struct ConnectionPool {
    id: DispatcherId,
    inner: Rc<RefCell<PoolInner>>,
}

impl ConnectionPool {
    pub fn new(origin: Origin, connector: Rc<dyn Connector>, options: PoolOptions) -> Self {
        let id = DispatcherId::new();
        let inner = Rc::new_cyclic(|weak| {
            RefCell::new(PoolInner {
                id,
                origin_label: origin.to_string(),
                origin,
                options,
                connector,
                clients: Vec::new(),
                queue: FixedQueue::new(),
                queued: 0,
                need_drain: false,
                closing: false,
                close_started: false,
                destroyed: false,
                close: Rc::new(RefCell::new(CloseState {
                    done: false,
                    callbacks: Vec::new(),
                })),
                observers: Observers::default(),
                weak_self: weak.clone(),
            })
        });
        Self { id, inner }
    }

    pub fn origin(&self) -> Origin {
        self.inner.borrow().origin.clone()
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.borrow().stats()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.borrow().is_busy()
    }

    /// Number of connections the pool has opened.
    pub fn connection_count(&self) -> usize {
        self.inner.borrow().clients.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.borrow().destroyed
    }
}

impl Dispatcher for ConnectionPool {
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

impl PoolInner {
    fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            queued: self.queued,
            pending: self.queued,
            size: self.queued,
            ..PoolStats::default()
        };
        for client in &self.clients {
            let s = client.connection.stats();
            if s.connected {
                stats.connected += 1;
                if !s.busy {
                    stats.free += 1;
                }
            }
            stats.pending += s.pending;
            stats.running += s.running;
            stats.size += s.size;
        }
        stats
    }

    fn at_capacity(&self) -> bool {
        self.options
            .connections
            .is_some_and(|max| self.clients.len() >= max)
    }

    fn is_busy(&self) -> bool {
        self.queued > 0
            || (self.at_capacity() && self.clients.iter().all(|c| c.connection.is_busy()))
    }

    /// The least busy connection that can take a request, opening a new one
    /// when all are busy and the limit allows.
    fn pick(&mut self) -> Option<Connection> {
        let idle = self
            .clients
            .iter()
            .filter(|c| !c.connection.is_busy() && !c.connection.is_closed())
            .min_by_key(|c| c.connection.stats().size)
            .map(|c| c.connection.clone());
        if idle.is_some() {
            return idle;
        }
        if self.at_capacity() || self.destroyed {
            return None;
        }
        Some(self.open_connection())
    }

    fn open_connection(&mut self) -> Connection {
        let connection = Connection::new(
            self.origin.clone(),
            self.connector.clone(),
            self.options.connection.clone(),
        );
        let weak = self.weak_self.clone();
        let subscription = connection.subscribe(Box::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.borrow_mut().on_child_event(event);
            }
        }));
        tracing::debug!(
            pool_id = %self.id,
            connection_id = %connection.id(),
            connections = self.clients.len() + 1,
            "opening pool connection"
        );
        self.clients.push(PoolClient {
            connection: connection.clone(),
            _subscription: subscription,
        });
        connection
    }

    fn dispatch(&mut self, request: Request, handler: Box<dyn Handler>) -> bool {
        if self.destroyed {
            reject(handler, DispatchError::ClientDestroyed);
            return false;
        }
        if self.closing {
            reject(handler, DispatchError::ClientClosed);
            return false;
        }
        if let Some(origin) = &request.origin {
            if *origin != self.origin {
                let message = format!("request origin {origin} does not match {}", self.origin);
                reject(handler, DispatchError::InvalidArgument(message));
                return !self.is_busy();
            }
        }
        if let Err(e) = request.validate(self.options.connection.strict_content_length) {
            tracing::debug!(pool_id = %self.id, error = %e, "request rejected");
            reject(handler, e);
            return !self.is_busy();
        }
        if request.is_aborted() {
            reject(handler, DispatchError::RequestAborted);
            return !self.is_busy();
        }

        let target = if self.queued == 0 { self.pick() } else { None };
        match target {
            Some(connection) => {
                connection.dispatch(request, handler);
            }
            None => self.enqueue(request, handler),
        }

        let busy = self.is_busy();
        if busy {
            self.need_drain = true;
        }
        !busy
    }

    fn enqueue(&mut self, request: Request, handler: Box<dyn Handler>) {
        let slot: QueueSlot = Rc::new(RefCell::new(None));
        let abort = request.signal.as_ref().and_then(|signal| {
            let weak_slot = Rc::downgrade(&slot);
            let weak_pool = self.weak_self.clone();
            signal.on_abort(move || {
                let (weak_slot, weak_pool) = (weak_slot.clone(), weak_pool.clone());
                tasks::post(move || {
                    if let (Some(slot), Some(pool)) = (weak_slot.upgrade(), weak_pool.upgrade()) {
                        pool.borrow_mut().abort_queued(&slot);
                    }
                });
            })
        });
        *slot.borrow_mut() = Some(Queued {
            request,
            handler,
            abort,
        });
        self.queue.push(slot);
        self.queued += 1;
        tracing::debug!(pool_id = %self.id, queued = self.queued, "request queued in pool");
        metrics::set_queue_depth(&self.origin_label, self.queued);
    }

    fn abort_queued(&mut self, slot: &QueueSlot) {
        let taken = slot.borrow_mut().take();
        if let Some(queued) = taken {
            self.queued -= 1;
            metrics::set_queue_depth(&self.origin_label, self.queued);
            metrics::record_request(&self.origin_label, Outcome::Aborted);
            drop(queued.abort);
            reject(queued.handler, DispatchError::RequestAborted);
            self.after_progress();
        }
    }

    fn drain_queue(&mut self) {
        let before = self.queued;
        while self.queued > 0 {
            let Some(connection) = self.pick() else {
                break;
            };
            let Some(slot) = self.queue.shift() else {
                break;
            };
            let Some(queued) = slot.borrow_mut().take() else {
                continue;
            };
            self.queued -= 1;
            let Queued {
                request,
                handler,
                abort,
            } = queued;
            drop(abort);
            connection.dispatch(request, handler);
        }
        if self.queued != before {
            metrics::set_queue_depth(&self.origin_label, self.queued);
        }
        self.after_progress();
    }

    fn after_progress(&mut self) {
        if self.need_drain && !self.is_busy() && !self.closing && !self.destroyed {
            self.need_drain = false;
            self.observers.emit(DispatcherEvent::new(
                EventKind::Drain,
                Some(self.origin.clone()),
                self.id,
            ));
        }
        self.maybe_finish_close();
    }

    fn on_child_event(&mut self, event: &DispatcherEvent) {
        if event.kind != EventKind::Drain {
            self.observers.emit(event.through(self.id));
        }
        if matches!(event.kind, EventKind::Disconnect | EventKind::ConnectionError) {
            self.prune();
        }
        if !self.destroyed {
            self.drain_queue();
        }
    }

    /// Drops destroyed connections and disconnected ones with no requests.
    fn prune(&mut self) {
        if self.closing {
            return;
        }
        let before = self.clients.len();
        self.clients.retain(|client| {
            let connection = &client.connection;
            let idle = connection.state() == ConnectionState::Disconnected
                && connection.stats().size == 0;
            !(idle || connection.is_destroyed())
        });
        if self.clients.len() != before {
            tracing::debug!(
                pool_id = %self.id,
                removed = before - self.clients.len(),
                connections = self.clients.len(),
                "pruned pool connections"
            );
        }
    }

    fn close(&mut self, callback: Option<Box<dyn FnOnce()>>) {
        if let Some(callback) = callback {
            let mut close = self.close.borrow_mut();
            if close.done {
                tasks::defer(callback);
            } else {
                close.callbacks.push(callback);
            }
        }
        if self.closing {
            return;
        }
        tracing::debug!(pool_id = %self.id, queued = self.queued, "closing pool");
        self.closing = true;
        self.maybe_finish_close();
    }

    fn maybe_finish_close(&mut self) {
        if !self.closing || self.close_started || self.destroyed || self.queued > 0 {
            return;
        }
        self.close_started = true;
        let remaining = Rc::new(RefCell::new(self.clients.len()));
        if self.clients.is_empty() {
            finish_close(&self.close);
        }
        for client in &self.clients {
            let remaining = remaining.clone();
            let close = self.close.clone();
            client.connection.close(Some(Box::new(move || {
                let left = {
                    let mut left = remaining.borrow_mut();
                    *left -= 1;
                    *left
                };
                if left == 0 {
                    finish_close(&close);
                }
            })));
        }
    }

    fn destroy(&mut self, error: Option<DispatchError>) {
        if self.destroyed {
            return;
        }
        let error = error.unwrap_or(DispatchError::ClientDestroyed);
        self.destroyed = true;
        self.closing = true;
        tracing::debug!(pool_id = %self.id, error = %error, "destroying pool");

        while let Some(slot) = self.queue.shift() {
            let taken = slot.borrow_mut().take();
            if let Some(queued) = taken {
                metrics::record_request(&self.origin_label, Outcome::Failed);
                drop(queued.abort);
                reject(queued.handler, error.clone());
            }
        }
        self.queued = 0;
        metrics::set_queue_depth(&self.origin_label, 0);

        for client in std::mem::take(&mut self.clients) {
            client.connection.destroy(Some(error.clone()));
        }
        finish_close(&self.close);
    }
}

fn finish_close(close: &Rc<RefCell<CloseState>>) {
    let callbacks = {
        let mut close = close.borrow_mut();
        close.done = true;
        std::mem::take(&mut close.callbacks)
    };
    for callback in callbacks {
        tasks::defer(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::NullConnector;

    #[test]
    fn test_stats_of_fresh_pool() {
        let pool = ConnectionPool::new(
            Origin::parse("http://localhost:1").unwrap(),
            Rc::new(NullConnector),
            PoolOptions::default(),
        );
        assert_eq!(pool.stats(), PoolStats::default());
        assert!(!pool.is_busy());
    }

    #[test]
    fn test_limit_opens_at_most_configured_connections() {
        let pool = ConnectionPool::new(
            Origin::parse("http://localhost:1").unwrap(),
            Rc::new(NullConnector),
            PoolOptions {
                connections: Some(2),
                ..PoolOptions::default()
            },
        );
        struct Ignore;
        impl Handler for Ignore {
            fn on_headers(&mut self, _: u16, _: crate::dispatcher::Headers) {}
            fn on_data(&mut self, _: bytes::Bytes) {}
            fn on_complete(self: Box<Self>, _: crate::dispatcher::Completion) {}
            fn on_error(self: Box<Self>, _: DispatchError) {}
        }

        assert!(pool.dispatch(Request::get("/a"), Box::new(Ignore)));
        assert!(!pool.dispatch(Request::get("/b"), Box::new(Ignore)));
        assert!(!pool.dispatch(Request::get("/c"), Box::new(Ignore)));
        assert_eq!(pool.connection_count(), 2);

        let stats = pool.stats();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.size, 3);
        pool.destroy(None);
        assert_eq!(pool.stats().size, 0);
    }
}
