//! Redirect following.
//!
//! # Responsibilities
//! - Follow 3xx responses carrying a `Location` header through `next`
//! - Rewrite method and body per status (303 and legacy 301/302 POST → GET)
//! - Strip `host`, body headers and credentials where they no longer apply
//! - Report visited URLs in `Completion::redirects`, or in
//!   `DispatchError::Redirect` when a later hop fails
//!
//! # Design Decisions
//! - The redirect response itself is never shown to the caller
//! - When the budget runs out the last 3xx is surfaced unchanged
//! - A 307/308 with a streamed body cannot be replayed and is surfaced

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bytes::Bytes;
use http::Method;
use url::Url;

use crate::dispatcher::request::path_of;
use crate::dispatcher::{
    tasks, Body, Completion, Dispatcher, DispatcherId, Handler, Headers, Interceptor, Observer,
    Origin, Request, Subscription, Upgraded,
};
use crate::error::DispatchError;
use crate::observability::metrics;

const BODY_HEADERS: &[&str] = &[
    "content-length",
    "content-type",
    "content-encoding",
    "content-language",
    "content-location",
    "transfer-encoding",
];

const CREDENTIAL_HEADERS: &[&str] = &["authorization", "cookie", "proxy-authorization"];

#[derive(Debug, Clone)]
pub struct RedirectOptions {
    /// Redirects followed per request unless the request overrides it.
    pub max_redirections: u32,
}

impl Default for RedirectOptions {
    fn default() -> Self {
        Self { max_redirections: 5 }
    }
}

pub struct RedirectDispatcher {
    id: DispatcherId,
    next: Rc<dyn Dispatcher>,
    options: RedirectOptions,
}

impl RedirectDispatcher {
    pub fn new(next: Rc<dyn Dispatcher>, options: RedirectOptions) -> Self {
        Self {
            id: DispatcherId::new(),
            next,
            options,
        }
    }
}

/// Interceptor adding [`RedirectDispatcher`].
pub fn redirect(options: RedirectOptions) -> Interceptor {
    Box::new(move |next| Rc::new(RedirectDispatcher::new(next, options)))
}

impl Dispatcher for RedirectDispatcher {
    fn id(&self) -> DispatcherId {
        self.id
    }

    fn dispatch(&self, request: Request, handler: Box<dyn Handler>) -> bool {
        let budget = request
            .max_redirections
            .unwrap_or(self.options.max_redirections);
        if budget == 0 {
            return self.next.dispatch(request, handler);
        }
        tasks::enter(|| {
            let state = Rc::new(RedirectState {
                next: self.next.clone(),
                request: RefCell::new(request),
                handler: RefCell::new(Some(handler)),
                remaining: Cell::new(budget),
                history: RefCell::new(Vec::new()),
            });
            RedirectState::follow(&state)
        })
    }

    fn close(&self, callback: Option<Box<dyn FnOnce()>>) {
        self.next.close(callback)
    }

    fn destroy(&self, error: Option<DispatchError>) {
        self.next.destroy(error)
    }

    fn subscribe(&self, observer: Observer) -> Subscription {
        self.next.subscribe(observer)
    }
}

struct RedirectState {
    next: Rc<dyn Dispatcher>,
    /// The request of the current hop.
    request: RefCell<Request>,
    handler: RefCell<Option<Box<dyn Handler>>>,
    remaining: Cell<u32>,
    history: RefCell<Vec<Url>>,
}

impl RedirectState {
    fn follow(state: &Rc<Self>) -> bool {
        let request = state.request.borrow().clone();
        let hop = HopHandler {
            state: state.clone(),
            target: None,
        };
        state.next.dispatch(request, Box::new(hop))
    }

    /// Where a response redirects to, if it should be followed.
    fn target(&self, status: u16, headers: &Headers) -> Option<Url> {
        if !matches!(status, 300 | 301 | 302 | 303 | 307 | 308) || self.remaining.get() == 0 {
            return None;
        }
        let location = headers.get("location")?;
        let request = self.request.borrow();
        if matches!(status, 307 | 308) && !request.body.is_replayable() {
            tracing::debug!(status, "redirect needs a streamed body again; not followed");
            return None;
        }
        let current = request.url().ok()?;
        match current.join(location) {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::debug!(location, error = %e, "unusable redirect location");
                None
            }
        }
    }

    /// Rewrite the current request for the next hop.
    fn advance(&self, status: u16, target: &Url) -> Result<(), DispatchError> {
        let origin = Origin::from_url(target)?;
        let mut request = self.request.borrow_mut();
        let previous = request.url()?;

        let to_get = (status == 303 && request.method != Method::HEAD)
            || (matches!(status, 301 | 302) && request.method == Method::POST);
        if to_get {
            request.method = Method::GET;
            request.body = Body::Empty;
            for name in BODY_HEADERS {
                request.headers.remove(name);
            }
        }
        request.headers.remove("host");
        let cross_origin = request.origin.as_ref() != Some(&origin);
        if cross_origin {
            for name in CREDENTIAL_HEADERS {
                request.headers.remove(name);
            }
        }

        tracing::debug!(status, from = %previous, to = %target, "following redirect");
        metrics::record_redirect(&origin.to_string());
        request.origin = Some(origin);
        request.path = path_of(target);
        self.history.borrow_mut().push(previous);
        self.remaining.set(self.remaining.get() - 1);
        Ok(())
    }

    /// Deliver `error`, carrying the history when a hop was followed.
    fn fail(&self, error: DispatchError) {
        let Some(handler) = self.take_handler() else {
            return;
        };
        let redirects = self.history.take();
        if redirects.is_empty() {
            handler.on_error(error);
        } else {
            handler.on_error(DispatchError::Redirect {
                source: Box::new(error),
                redirects,
            });
        }
    }

    fn take_handler(&self) -> Option<Box<dyn Handler>> {
        self.handler.borrow_mut().take()
    }

    fn with_handler(&self, f: impl FnOnce(&mut Box<dyn Handler>)) {
        if let Some(handler) = self.handler.borrow_mut().as_mut() {
            f(handler);
        }
    }
}

/// Handler for one hop of the chain.
struct HopHandler {
    state: Rc<RedirectState>,
    /// Set when this hop's response is a redirect being followed.
    target: Option<(u16, Url)>,
}

impl Handler for HopHandler {
    fn on_connect(&mut self) {
        if self.state.history.borrow().is_empty() {
            self.state.with_handler(|h| h.on_connect());
        }
    }

    fn on_headers(&mut self, status: u16, headers: Headers) {
        if let Some(url) = self.state.target(status, &headers) {
            self.target = Some((status, url));
            return;
        }
        self.state.with_handler(|h| h.on_headers(status, headers));
    }

    fn on_data(&mut self, chunk: Bytes) {
        if self.target.is_none() {
            self.state.with_handler(|h| h.on_data(chunk));
        }
    }

    fn on_complete(self: Box<Self>, mut completion: Completion) {
        if let Some((status, url)) = &self.target {
            match self.state.advance(*status, url) {
                Ok(()) => {
                    RedirectState::follow(&self.state);
                }
                Err(error) => self.state.fail(error),
            }
            return;
        }
        completion.redirects = self.state.history.take();
        if let Some(handler) = self.state.take_handler() {
            handler.on_complete(completion);
        }
    }

    fn on_error(self: Box<Self>, error: DispatchError) {
        self.state.fail(error);
    }

    fn on_upgrade(self: Box<Self>, status: u16, headers: Headers, socket: Upgraded) {
        match self.state.take_handler() {
            Some(handler) => handler.on_upgrade(status, headers, socket),
            None => socket.destroy(),
        }
    }
}
