//! Client-side load balancing across equivalent origins.
//!
//! # Responsibilities
//! - Hold one `ConnectionPool` per upstream origin
//! - Pick an upstream per request through a `LoadBalancer` policy
//! - Track passive health from connect outcomes
//! - Add and remove upstreams at runtime
//!
//! # Design Decisions
//! - A request's origin is rewritten to the chosen upstream
//! - Removed upstreams close gracefully; their in-flight requests finish

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::dispatcher::events::Observers;
use crate::dispatcher::request::{Origin, Request};
use crate::dispatcher::{
    reject, tasks, Dispatcher, DispatcherEvent, DispatcherId, EventKind, Handler, Observer,
    Subscription,
};
use crate::error::DispatchError;
use crate::load_balancer::pool::{ConnectionPool, PoolOptions, PoolStats};
use crate::load_balancer::upstream::{HealthState, Upstream};
use crate::load_balancer::LoadBalancer;
use crate::net::transport::Connector;

#[derive(Debug, Clone)]
pub struct BalancedOptions {
    /// Options for each upstream's pool.
    pub pool: PoolOptions,
    /// Consecutive successful connects before an upstream is healthy again.
    pub healthy_threshold: usize,
    /// Consecutive failed connects before an upstream is skipped.
    pub unhealthy_threshold: usize,
}

impl Default for BalancedOptions {
    fn default() -> Self {
        Self {
            pool: PoolOptions::default(),
            healthy_threshold: 1,
            unhealthy_threshold: 3,
        }
    }
}

struct BalancedInner {
    id: DispatcherId,
    connector: Rc<dyn Connector>,
    options: BalancedOptions,
    balancer: Box<dyn LoadBalancer>,
    upstreams: Vec<Rc<Upstream>>,
    /// Removed upstreams that are still finishing requests.
    retiring: Vec<Rc<Upstream>>,
    need_drain: bool,
    closing: bool,
    destroyed: bool,
    observers: Observers,
    weak_self: Weak<RefCell<BalancedInner>>,
}

/// A dispatcher spreading requests over several origins.
#[derive(Clone)]
pub struct BalancedPool {
    id: DispatcherId,
    inner: Rc<RefCell<BalancedInner>>,
}

impl BalancedPool {
    pub fn new(
        origins: impl IntoIterator<Item = Origin>,
        connector: Rc<dyn Connector>,
        balancer: Box<dyn LoadBalancer>,
        options: BalancedOptions,
    ) -> Self {
        let id = DispatcherId::new();
        let inner = Rc::new_cyclic(|weak| {
            RefCell::new(BalancedInner {
                id,
                connector,
                options,
                balancer,
                upstreams: Vec::new(),
                retiring: Vec::new(),
                need_drain: false,
                closing: false,
                destroyed: false,
                observers: Observers::default(),
                weak_self: weak.clone(),
            })
        });
        let pool = Self { id, inner };
        for origin in origins {
            pool.add_upstream(origin);
        }
        pool
    }

    /// Start balancing onto `origin`. Adding a known origin is a no-op.
    pub fn add_upstream(&self, origin: Origin) {
        tasks::enter(|| self.inner.borrow_mut().add_upstream(origin))
    }

    /// Stop sending requests to `origin`. Returns whether it was known.
    pub fn remove_upstream(&self, origin: &Origin) -> bool {
        tasks::enter(|| self.inner.borrow_mut().remove_upstream(origin))
    }

    pub fn upstreams(&self) -> Vec<Origin> {
        self.inner
            .borrow()
            .upstreams
            .iter()
            .map(|u| u.origin().clone())
            .collect()
    }

    pub fn health(&self) -> Vec<(Origin, HealthState)> {
        self.inner
            .borrow()
            .upstreams
            .iter()
            .map(|u| (u.origin().clone(), u.health()))
            .collect()
    }

    /// Counters summed over every upstream pool.
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.borrow();
        inner
            .upstreams
            .iter()
            .chain(inner.retiring.iter())
            .map(|u| u.stats())
            .fold(PoolStats::default(), |acc, s| PoolStats {
                connected: acc.connected + s.connected,
                free: acc.free + s.free,
                pending: acc.pending + s.pending,
                queued: acc.queued + s.queued,
                running: acc.running + s.running,
                size: acc.size + s.size,
            })
    }
}

impl Dispatcher for BalancedPool {
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

impl BalancedInner {
    fn add_upstream(&mut self, origin: Origin) {
        if self.closing || self.upstreams.iter().any(|u| *u.origin() == origin) {
            return;
        }
        let pool = ConnectionPool::new(
            origin.clone(),
            self.connector.clone(),
            self.options.pool.clone(),
        );
        let upstream = Rc::new(Upstream::new(origin, pool));

        let weak_upstream = Rc::downgrade(&upstream);
        let weak = self.weak_self.clone();
        let healthy = self.options.healthy_threshold.max(1);
        let unhealthy = self.options.unhealthy_threshold.max(1);
        let subscription = upstream.pool().subscribe(Box::new(move |event| {
            if let Some(upstream) = weak_upstream.upgrade() {
                match event.kind {
                    EventKind::Connect => upstream.mark_success(healthy),
                    EventKind::ConnectionError => upstream.mark_failure(unhealthy),
                    _ => {}
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.borrow_mut().on_child_event(event);
            }
        }));
        upstream.hold(subscription);

        tracing::info!(balancer_id = %self.id, origin = %upstream.origin(), "upstream added");
        self.upstreams.push(upstream);
        self.maybe_drain();
    }

    fn remove_upstream(&mut self, origin: &Origin) -> bool {
        let Some(index) = self.upstreams.iter().position(|u| u.origin() == origin) else {
            return false;
        };
        let upstream = self.upstreams.remove(index);
        tracing::info!(balancer_id = %self.id, origin = %origin, "upstream removed");

        let weak = self.weak_self.clone();
        let retired = origin.clone();
        upstream.pool().close(Some(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .borrow_mut()
                    .retiring
                    .retain(|u| *u.origin() != retired);
            }
        })));
        self.retiring.push(upstream);
        true
    }

    fn is_busy(&self) -> bool {
        self.upstreams.iter().all(|u| u.pool().is_busy())
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
        let selected = self
            .balancer
            .select(&self.upstreams, &request)
            .and_then(|index| self.upstreams.get(index).cloned());
        let Some(upstream) = selected else {
            reject(handler, DispatchError::NoUpstream);
            self.need_drain = true;
            return false;
        };
        tracing::debug!(
            balancer_id = %self.id,
            origin = %upstream.origin(),
            path = %request.path,
            "upstream selected"
        );
        request.origin = Some(upstream.origin().clone());
        upstream.pool().dispatch(request, handler);

        let busy = self.is_busy();
        if busy {
            self.need_drain = true;
        }
        !busy
    }

    fn maybe_drain(&mut self) {
        if self.need_drain && !self.is_busy() && !self.closing && !self.destroyed {
            self.need_drain = false;
            self.observers
                .emit(DispatcherEvent::new(EventKind::Drain, None, self.id));
        }
    }

    fn on_child_event(&mut self, event: &DispatcherEvent) {
        if event.kind == EventKind::Drain {
            self.maybe_drain();
        } else {
            self.observers.emit(event.through(self.id));
        }
    }

    fn close(&mut self, callback: Option<Box<dyn FnOnce()>>) {
        self.closing = true;
        let pools: Vec<ConnectionPool> = self
            .upstreams
            .iter()
            .chain(self.retiring.iter())
            .map(|u| u.pool().clone())
            .collect();
        close_all(pools, callback);
    }

    fn destroy(&mut self, error: Option<DispatchError>) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.closing = true;
        for upstream in self.upstreams.iter().chain(self.retiring.iter()) {
            upstream.pool().destroy(error.clone());
        }
    }
}

/// Close every dispatcher, then run `callback` once all have closed.
pub(crate) fn close_all<D: Dispatcher>(dispatchers: Vec<D>, callback: Option<Box<dyn FnOnce()>>) {
    let Some(callback) = callback else {
        for dispatcher in dispatchers {
            dispatcher.close(None);
        }
        return;
    };
    if dispatchers.is_empty() {
        tasks::defer(callback);
        return;
    }
    let remaining = Rc::new(RefCell::new((dispatchers.len(), Some(callback))));
    for dispatcher in dispatchers {
        let remaining = remaining.clone();
        dispatcher.close(Some(Box::new(move || {
            let done = {
                let mut state = remaining.borrow_mut();
                state.0 -= 1;
                if state.0 == 0 {
                    state.1.take()
                } else {
                    None
                }
            };
            if let Some(callback) = done {
                callback();
            }
        })));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::{NullConnector, RoundRobin};

    fn balanced(origins: &[&str]) -> BalancedPool {
        BalancedPool::new(
            origins.iter().map(|o| Origin::parse(o).unwrap()),
            Rc::new(NullConnector),
            Box::new(RoundRobin::new()),
            BalancedOptions::default(),
        )
    }

    #[test]
    fn test_add_and_remove_upstreams() {
        let pool = balanced(&["http://a:80", "http://b:80"]);
        assert_eq!(pool.upstreams().len(), 2);

        pool.add_upstream(Origin::parse("http://a:80").unwrap());
        assert_eq!(pool.upstreams().len(), 2);

        assert!(pool.remove_upstream(&Origin::parse("http://a:80").unwrap()));
        assert!(!pool.remove_upstream(&Origin::parse("http://a:80").unwrap()));
        assert_eq!(pool.upstreams(), vec![Origin::parse("http://b:80").unwrap()]);
    }

    #[test]
    fn test_out_of_range_selection_rejects() {
        struct Stale;
        impl LoadBalancer for Stale {
            fn select(&self, _: &[Rc<Upstream>], _: &Request) -> Option<usize> {
                Some(7)
            }
        }
        struct Capture(Rc<RefCell<Option<DispatchError>>>);
        impl Handler for Capture {
            fn on_headers(&mut self, _: u16, _: crate::dispatcher::Headers) {}
            fn on_data(&mut self, _: bytes::Bytes) {}
            fn on_complete(self: Box<Self>, _: crate::dispatcher::Completion) {}
            fn on_error(self: Box<Self>, error: DispatchError) {
                *self.0.borrow_mut() = Some(error);
            }
        }

        let pool = BalancedPool::new(
            [Origin::parse("http://a:80").unwrap()],
            Rc::new(NullConnector),
            Box::new(Stale),
            BalancedOptions::default(),
        );
        let error = Rc::new(RefCell::new(None));
        assert!(!pool.dispatch(Request::get("/"), Box::new(Capture(error.clone()))));
        assert_eq!(*error.borrow(), Some(DispatchError::NoUpstream));
    }

    #[test]
    fn test_new_upstreams_start_unknown() {
        let pool = balanced(&["http://a:80"]);
        assert_eq!(pool.health()[0].1, HealthState::Unknown);
    }
}
