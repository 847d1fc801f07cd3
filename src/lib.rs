//! HTTP/1.1 pipelining client library
//!
//! # Architecture Overview
//!
//! ```text
//!   caller ──dispatch(request, handler)──▶ interceptors (redirect, retry)
//!                                               │
//!                                               ▼
//!                                     ┌──────────────────┐
//!                                     │ routing::Agent   │ one dispatcher per origin
//!                                     └────────┬─────────┘
//!                                              ▼
//!                          ┌───────────────────────────────────────┐
//!                          │ load_balancer: BalancedPool,          │
//!                          │ ConnectionPool (FixedQueue backlog)   │
//!                          └────────┬──────────────────────────────┘
//!                                   ▼
//!                          ┌──────────────────┐    ┌──────────────────┐
//!                          │ net::Connection  │───▶│ http: h1 / h2    │
//!                          │ (state machine)  │    │ (sans-IO codecs) │
//!                          └────────┬─────────┘    └──────────────────┘
//!                                   ▼
//!                          Transport / Connector (tokio TCP or test double)
//!
//!   Cross-cutting: resilience::timeouts (timer wheel), dispatcher::tasks
//!   (callback delivery), config, observability
//! ```
//!
//! Every dispatcher is single-threaded: run it on a current-thread runtime
//! inside a `LocalSet`, with [`net::install_timer_driver`] active.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod queue;
pub mod resilience;
pub mod routing;

pub use config::ClientConfig;
pub use dispatcher::{
    compose, AbortController, AbortSignal, Body, Completion, Dispatcher, DispatcherEvent,
    EventKind, Handler, Headers, Interceptor, Origin, Request, Upgraded,
};
pub use error::{DispatchError, ErrorKind};
pub use load_balancer::{BalancedPool, ConnectionPool, PoolStats};
pub use net::{Connection, ConnectionOptions, TcpConnector};
pub use resilience::{redirect, retry, RedirectOptions, RetryOptions};
pub use routing::Agent;
