//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request from caller:
//!     → redirects.rs (follow 3xx with a Location header)
//!     → retries.rs (re-dispatch retryable failures after backoff.rs delay)
//!     → inner dispatcher
//!         → timeouts.rs (connect, headers, body and keep-alive deadlines)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every socket wait has a deadline
//! - Retries only for configured methods and replayable bodies
//! - Policies are interceptors, so they compose around any dispatcher

pub mod backoff;
pub mod redirects;
pub mod retries;
pub mod timeouts;

pub use redirects::{redirect, RedirectDispatcher, RedirectOptions};
pub use retries::{retry, RetryContext, RetryDecision, RetryDispatcher, RetryOptions};
