//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! dispatch(request with origin)
//!     → agent.rs (origin lookup)
//!     → existing dispatcher for the origin, or a new one:
//!         - Connection when `connections == Some(1)`
//!         - ConnectionPool otherwise
//! ```
//!
//! # Design Decisions
//! - O(1) origin lookup via HashMap
//! - Dispatchers are created lazily and kept until close/destroy
//! - Explicit InvalidArgument for requests without an origin

pub mod agent;

pub use agent::{Agent, AgentOptions};
