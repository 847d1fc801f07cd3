//! Retry logic.
//!
//! # Responsibilities
//! - Decide whether a failed attempt is retryable (method, status, error kind)
//! - Re-dispatch with exponential backoff + jitter, or `Retry-After`
//! - Enforce the retry budget (`max_retries` per request)
//! - Let a decision callback override the default policy
//!
//! # Design Decisions
//! - Bodies that cannot be replayed are never retried
//! - Once response headers reached the caller, a failure is terminal
//! - The wait between attempts is cancelled by the request's abort signal
//! - A retryable status that exhausts the budget is surfaced as-is

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::Method;

use crate::dispatcher::abort::AbortRegistration;
use crate::dispatcher::request::{Headers, Request};
use crate::dispatcher::{
    reject, tasks, Completion, Dispatcher, DispatcherId, Handler, Interceptor, Observer,
    Subscription, Upgraded,
};
use crate::error::{DispatchError, ErrorKind};
use crate::observability::metrics;
use crate::resilience::backoff::{calculate_backoff, parse_retry_after};
use crate::resilience::timeouts::{self, TimerKey};

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Dispatch again after the delay.
    Retry(Duration),
    /// Surface the failure to the caller.
    Stop,
}

/// State of a request after a failed attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// 1-based number of the retry being considered.
    pub attempt: u32,
    /// Time since the first attempt was dispatched.
    pub elapsed: Duration,
    pub method: Method,
    /// The error, for failed attempts.
    pub error: Option<DispatchError>,
    /// The status, for retryable responses.
    pub status: Option<u16>,
    /// What the configured policy would do.
    pub proposed: RetryDecision,
}

pub type RetryCallback = Rc<dyn Fn(&RetryContext) -> RetryDecision>;

#[derive(Clone)]
pub struct RetryOptions {
    pub max_retries: u32,
    /// Delay before the first retry.
    pub min_timeout: Duration,
    /// Upper bound for any delay, including `Retry-After`.
    pub max_timeout: Duration,
    pub timeout_factor: f64,
    /// Honor `Retry-After` on retryable statuses.
    pub retry_after: bool,
    pub methods: Vec<Method>,
    pub status_codes: Vec<u16>,
    pub error_kinds: Vec<ErrorKind>,
    /// Overrides the policy's decision for every failed attempt.
    pub decide: Option<RetryCallback>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            min_timeout: Duration::from_millis(500),
            max_timeout: Duration::from_secs(30),
            timeout_factor: 2.0,
            retry_after: true,
            methods: vec![
                Method::GET,
                Method::HEAD,
                Method::OPTIONS,
                Method::PUT,
                Method::DELETE,
                Method::TRACE,
            ],
            status_codes: vec![429, 500, 502, 503, 504],
            error_kinds: vec![
                ErrorKind::Socket,
                ErrorKind::ConnectTimeout,
                ErrorKind::HeadersTimeout,
            ],
            decide: None,
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("min_timeout", &self.min_timeout)
            .field("max_timeout", &self.max_timeout)
            .field("timeout_factor", &self.timeout_factor)
            .field("retry_after", &self.retry_after)
            .field("methods", &self.methods)
            .field("status_codes", &self.status_codes)
            .field("error_kinds", &self.error_kinds)
            .field("decide", &self.decide.is_some())
            .finish()
    }
}

impl RetryOptions {
    fn backoff(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.min_timeout, self.max_timeout, self.timeout_factor)
    }

    fn policy(&self, attempt: u32, method: &Method, failure: &Failure<'_>) -> RetryDecision {
        if attempt > self.max_retries || !self.methods.contains(method) {
            return RetryDecision::Stop;
        }
        match failure {
            Failure::Error(error) => {
                if self.error_kinds.contains(&error.kind()) {
                    RetryDecision::Retry(self.backoff(attempt))
                } else {
                    RetryDecision::Stop
                }
            }
            Failure::Status(status, headers) => {
                if !self.status_codes.contains(status) {
                    return RetryDecision::Stop;
                }
                let hinted = if self.retry_after {
                    headers
                        .get("retry-after")
                        .and_then(parse_retry_after)
                        .map(|d| d.min(self.max_timeout))
                } else {
                    None
                };
                RetryDecision::Retry(hinted.unwrap_or_else(|| self.backoff(attempt)))
            }
        }
    }
}

enum Failure<'a> {
    Error(&'a DispatchError),
    Status(u16, &'a Headers),
}

/// Dispatcher that retries failed attempts through `next`.
pub struct RetryDispatcher {
    id: DispatcherId,
    next: Rc<dyn Dispatcher>,
    options: Rc<RetryOptions>,
}

impl RetryDispatcher {
    pub fn new(next: Rc<dyn Dispatcher>, options: RetryOptions) -> Self {
        Self {
            id: DispatcherId::new(),
            next,
            options: Rc::new(options),
        }
    }
}

/// Interceptor adding [`RetryDispatcher`].
pub fn retry(options: RetryOptions) -> Interceptor {
    Box::new(move |next| Rc::new(RetryDispatcher::new(next, options)))
}

impl Dispatcher for RetryDispatcher {
    fn id(&self) -> DispatcherId {
        self.id
    }

    fn dispatch(&self, request: Request, handler: Box<dyn Handler>) -> bool {
        tasks::enter(|| {
            let state = Rc::new(RetryState {
                next: self.next.clone(),
                options: self.options.clone(),
                label: request
                    .origin
                    .as_ref()
                    .map(|o| o.to_string())
                    .unwrap_or_default(),
                request,
                handler: RefCell::new(Some(handler)),
                started: Instant::now(),
                retries: Cell::new(0),
                connected: Cell::new(false),
                waiting: RefCell::new(None),
                abort: RefCell::new(None),
            });
            RetryState::watch_abort(&state);
            RetryState::attempt(&state)
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

struct RetryState {
    next: Rc<dyn Dispatcher>,
    options: Rc<RetryOptions>,
    label: String,
    /// Template for every attempt.
    request: Request,
    handler: RefCell<Option<Box<dyn Handler>>>,
    started: Instant,
    retries: Cell<u32>,
    connected: Cell<bool>,
    /// Backoff timer while waiting between attempts.
    waiting: RefCell<Option<TimerKey>>,
    abort: RefCell<Option<AbortRegistration>>,
}

impl RetryState {
    fn watch_abort(state: &Rc<Self>) {
        let Some(signal) = &state.request.signal else {
            return;
        };
        let weak = Rc::downgrade(state);
        let registration = signal.on_abort(move || {
            let weak = weak.clone();
            tasks::post(move || {
                if let Some(state) = weak.upgrade() {
                    state.cancel_wait();
                }
            });
        });
        *state.abort.borrow_mut() = registration;
    }

    /// Abort while waiting between attempts. During an attempt the abort
    /// reaches the attempt itself.
    fn cancel_wait(&self) {
        let Some(key) = self.waiting.borrow_mut().take() else {
            return;
        };
        timeouts::cancel(key);
        tracing::debug!(origin = %self.label, "retry wait aborted");
        self.fail(DispatchError::RequestAborted);
    }

    fn attempt(state: &Rc<Self>) -> bool {
        let handler = AttemptHandler {
            state: state.clone(),
            retry_delay: None,
            surfaced: false,
        };
        state
            .next
            .dispatch(state.request.clone(), Box::new(handler))
    }

    /// Consult the policy and the decision callback.
    fn decide(&self, failure: Failure<'_>) -> RetryDecision {
        if !self.request.body.is_replayable() {
            return RetryDecision::Stop;
        }
        let attempt = self.retries.get() + 1;
        let proposed = self.options.policy(attempt, &self.request.method, &failure);
        let Some(decide) = &self.options.decide else {
            return proposed;
        };
        let (error, status) = match failure {
            Failure::Error(error) => (Some(error.clone()), None),
            Failure::Status(status, _) => (None, Some(status)),
        };
        decide(&RetryContext {
            attempt,
            elapsed: self.started.elapsed(),
            method: self.request.method.clone(),
            error,
            status,
            proposed,
        })
    }

    fn schedule(state: &Rc<Self>, delay: Duration, reason: &dyn fmt::Display) {
        if state.request.is_aborted() {
            state.fail(DispatchError::RequestAborted);
            return;
        }
        let attempt = state.retries.get() + 1;
        state.retries.set(attempt);
        tracing::warn!(
            origin = %state.label,
            path = %state.request.path,
            attempt,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "retrying request"
        );
        metrics::record_retry(&state.label);

        // The timer owns the state until the next attempt starts.
        let next = state.clone();
        let key = timeouts::schedule(delay, move || {
            next.waiting.borrow_mut().take();
            RetryState::attempt(&next);
        });
        *state.waiting.borrow_mut() = Some(key);
    }

    fn take_handler(&self) -> Option<Box<dyn Handler>> {
        self.abort.borrow_mut().take();
        self.handler.borrow_mut().take()
    }

    fn fail(&self, error: DispatchError) {
        if let Some(handler) = self.take_handler() {
            reject(handler, error);
        }
    }

    fn with_handler(&self, f: impl FnOnce(&mut Box<dyn Handler>)) {
        if let Some(handler) = self.handler.borrow_mut().as_mut() {
            f(handler);
        }
    }
}

/// Handler for one attempt. Forwards to the caller unless the attempt is
/// going to be retried.
struct AttemptHandler {
    state: Rc<RetryState>,
    /// Set when the response status is being retried; its body is dropped.
    retry_delay: Option<Duration>,
    /// Response headers were forwarded to the caller.
    surfaced: bool,
}

impl Handler for AttemptHandler {
    fn on_connect(&mut self) {
        if !self.state.connected.replace(true) {
            self.state.with_handler(|h| h.on_connect());
        }
    }

    fn on_headers(&mut self, status: u16, headers: Headers) {
        let retryable = self.state.options.status_codes.contains(&status);
        if !retryable {
            self.surfaced = true;
            self.state.with_handler(|h| h.on_headers(status, headers));
            return;
        }
        if let RetryDecision::Retry(delay) = self.state.decide(Failure::Status(status, &headers)) {
            self.retry_delay = Some(delay);
            return;
        }
        self.surfaced = true;
        self.state.with_handler(|h| h.on_headers(status, headers));
    }

    fn on_data(&mut self, chunk: Bytes) {
        if self.retry_delay.is_none() {
            self.state.with_handler(|h| h.on_data(chunk));
        }
    }

    fn on_complete(self: Box<Self>, completion: Completion) {
        if let Some(delay) = self.retry_delay {
            RetryState::schedule(&self.state, delay, &"retryable status");
            return;
        }
        if let Some(handler) = self.state.take_handler() {
            handler.on_complete(completion);
        }
    }

    fn on_error(self: Box<Self>, error: DispatchError) {
        if let Some(delay) = self.retry_delay {
            RetryState::schedule(&self.state, delay, &error);
            return;
        }
        if !self.surfaced {
            if let RetryDecision::Retry(delay) = self.state.decide(Failure::Error(&error)) {
                RetryState::schedule(&self.state, delay, &error);
                return;
            }
        }
        if let Some(handler) = self.state.take_handler() {
            handler.on_error(error);
        }
    }

    fn on_upgrade(self: Box<Self>, status: u16, headers: Headers, socket: Upgraded) {
        match self.state.take_handler() {
            Some(handler) => handler.on_upgrade(status, headers, socket),
            None => socket.destroy(),
        }
    }
}
