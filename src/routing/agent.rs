//! Per-origin request routing.
//!
//! # Responsibilities
//! - Route each request to the dispatcher for its origin
//! - Create dispatchers on first use
//! - Re-emit child events with the agent prepended to `targets`
//! - Drop an origin's dispatcher once it is disconnected and idle

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::dispatcher::events::Observers;
use crate::dispatcher::request::{Origin, Request};
use crate::dispatcher::{
    reject, tasks, Dispatcher, DispatcherEvent, DispatcherId, EventKind, Handler, Observer,
    Subscription,
};
use crate::error::DispatchError;
use crate::load_balancer::balanced::close_all;
use crate::load_balancer::pool::{ConnectionPool, PoolOptions};
use crate::net::connection::{Connection, ConnectionState};
use crate::net::transport::Connector;

#[derive(Debug, Clone, Default)]
pub struct AgentOptions {
    /// Options for every per-origin dispatcher. `connections == Some(1)`
    /// uses a single `Connection` instead of a pool.
    pub pool: PoolOptions,
}

enum RouteTarget {
    Connection(Connection),
    Pool(ConnectionPool),
}

impl RouteTarget {
    fn dispatcher(&self) -> Rc<dyn Dispatcher> {
        match self {
            RouteTarget::Connection(connection) => Rc::new(connection.clone()),
            RouteTarget::Pool(pool) => Rc::new(pool.clone()),
        }
    }

    /// No open socket and nothing queued or in flight.
    fn is_idle(&self) -> bool {
        match self {
            RouteTarget::Connection(connection) => {
                connection.state() == ConnectionState::Disconnected
                    && connection.stats().size == 0
            }
            RouteTarget::Pool(pool) => {
                let stats = pool.stats();
                stats.connected == 0 && stats.size == 0
            }
        }
    }
}

struct Route {
    target: RouteTarget,
    _subscription: Subscription,
}

struct AgentInner {
    id: DispatcherId,
    connector: Rc<dyn Connector>,
    options: AgentOptions,
    routes: HashMap<Origin, Route>,
    closing: bool,
    destroyed: bool,
    observers: Observers,
    weak_self: Weak<RefCell<AgentInner>>,
}

/// A dispatcher for requests to any origin.
#[derive(Clone)]
pub struct Agent {
    id: DispatcherId,
    inner: Rc<RefCell<AgentInner>>,
}

impl Agent {
    pub fn new(connector: Rc<dyn Connector>, options: AgentOptions) -> Self {
        let id = DispatcherId::new();
        let inner = Rc::new_cyclic(|weak| {
            RefCell::new(AgentInner {
                id,
                connector,
                options,
                routes: HashMap::new(),
                closing: false,
                destroyed: false,
                observers: Observers::default(),
                weak_self: weak.clone(),
            })
        });
        Self { id, inner }
    }

    /// Origins with a live dispatcher.
    pub fn origins(&self) -> Vec<Origin> {
        self.inner.borrow().routes.keys().cloned().collect()
    }
}

impl Dispatcher for Agent {
    fn id(&self) -> DispatcherId {
        self.id
    }

    fn dispatch(&self, request: Request, handler: Box<dyn Handler>) -> bool {
        tasks::enter(|| {
            let target = self.inner.borrow_mut().route(&request);
            match target {
                Ok(dispatcher) => dispatcher.dispatch(request, handler),
                Err((error, accepted)) => {
                    reject(handler, error);
                    accepted
                }
            }
        })
    }

    fn close(&self, callback: Option<Box<dyn FnOnce()>>) {
        tasks::enter(|| {
            let dispatchers = self.inner.borrow_mut().begin_close();
            close_all(dispatchers, callback);
        })
    }

    fn destroy(&self, error: Option<DispatchError>) {
        tasks::enter(|| {
            let dispatchers = self.inner.borrow_mut().begin_destroy();
            for dispatcher in dispatchers {
                dispatcher.destroy(error.clone());
            }
        })
    }

    fn subscribe(&self, observer: Observer) -> Subscription {
        self.inner.borrow().observers.subscribe(observer)
    }
}

impl AgentInner {
    /// The dispatcher for the request's origin, or the rejection and the
    /// value `dispatch` should return.
    fn route(&mut self, request: &Request) -> Result<Rc<dyn Dispatcher>, (DispatchError, bool)> {
        if self.destroyed {
            return Err((DispatchError::ClientDestroyed, false));
        }
        if self.closing {
            return Err((DispatchError::ClientClosed, false));
        }
        let Some(origin) = &request.origin else {
            return Err((
                DispatchError::InvalidArgument("request origin is required".into()),
                true,
            ));
        };
        if let Some(route) = self.routes.get(origin) {
            return Ok(route.target.dispatcher());
        }

        let target = if self.options.pool.connections == Some(1) {
            RouteTarget::Connection(Connection::new(
                origin.clone(),
                self.connector.clone(),
                self.options.pool.connection.clone(),
            ))
        } else {
            RouteTarget::Pool(ConnectionPool::new(
                origin.clone(),
                self.connector.clone(),
                self.options.pool.clone(),
            ))
        };
        let dispatcher = target.dispatcher();
        let weak = self.weak_self.clone();
        let subscription = dispatcher.subscribe(Box::new(move |event| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let released = inner.borrow_mut().on_child_event(event);
            if let Some(dispatcher) = released {
                dispatcher.close(None);
            }
        }));
        tracing::debug!(
            agent_id = %self.id,
            origin = %origin,
            dispatcher_id = %dispatcher.id(),
            "created origin dispatcher"
        );
        self.routes.insert(
            origin.clone(),
            Route {
                target,
                _subscription: subscription,
            },
        );
        Ok(dispatcher)
    }

    /// Re-emits `event` and removes the origin's route when its dispatcher
    /// went idle. Returns the removed dispatcher so the caller can close it
    /// outside the borrow.
    fn on_child_event(&mut self, event: &DispatcherEvent) -> Option<Rc<dyn Dispatcher>> {
        self.observers.emit(event.through(self.id));
        if self.closing || !matches!(event.kind, EventKind::Disconnect | EventKind::ConnectionError)
        {
            return None;
        }
        let origin = event.origin.as_ref()?;
        if !self.routes.get(origin)?.target.is_idle() {
            return None;
        }
        let route = self.routes.remove(origin)?;
        tracing::debug!(
            agent_id = %self.id,
            origin = %origin,
            routes = self.routes.len(),
            "released idle origin dispatcher"
        );
        Some(route.target.dispatcher())
    }

    fn begin_close(&mut self) -> Vec<Rc<dyn Dispatcher>> {
        self.closing = true;
        self.routes.values().map(|r| r.target.dispatcher()).collect()
    }

    fn begin_destroy(&mut self) -> Vec<Rc<dyn Dispatcher>> {
        self.destroyed = true;
        self.closing = true;
        self.routes.values().map(|r| r.target.dispatcher()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::NullConnector;

    #[test]
    fn test_routes_by_origin() {
        let agent = Agent::new(Rc::new(NullConnector), AgentOptions::default());
        struct Ignore;
        impl Handler for Ignore {
            fn on_headers(&mut self, _: u16, _: crate::dispatcher::Headers) {}
            fn on_data(&mut self, _: bytes::Bytes) {}
            fn on_complete(self: Box<Self>, _: crate::dispatcher::Completion) {}
            fn on_error(self: Box<Self>, _: DispatchError) {}
        }

        let a = Origin::parse("http://a:80").unwrap();
        let b = Origin::parse("http://b:80").unwrap();
        agent.dispatch(Request::get("/").origin(a.clone()), Box::new(Ignore));
        agent.dispatch(Request::get("/x").origin(a), Box::new(Ignore));
        agent.dispatch(Request::get("/").origin(b), Box::new(Ignore));
        assert_eq!(agent.origins().len(), 2);

        assert!(agent.dispatch(Request::get("/"), Box::new(Ignore)));
        agent.destroy(None);
    }

    #[test]
    fn test_event_kinds_pass_through() {
        let agent = Agent::new(Rc::new(NullConnector), AgentOptions::default());
        let child = DispatcherId::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let _sub = agent.subscribe(Box::new(move |e| s.borrow_mut().push(e.targets.clone())));

        tasks::enter(|| {
            agent
                .inner
                .borrow_mut()
                .on_child_event(&DispatcherEvent::new(EventKind::Drain, None, child));
        });
        assert_eq!(*seen.borrow(), vec![vec![agent.id(), child]]);
    }
}
