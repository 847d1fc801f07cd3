//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! dispatch(request)
//!     → balanced.rs (pick an upstream origin)
//!         - round_robin.rs (rotate through upstreams)
//!         - least_busy.rs (fewest queued + in-flight requests)
//!         - affinity.rs (hash of a request header)
//!     → pool.rs (pick or open a connection to that origin)
//!     → net::connection (socket)
//! ```
//!
//! # Design Decisions
//! - Policies are stateless apart from their rotation counter
//! - Unhealthy upstreams are skipped while a healthy one exists
//! - Each upstream owns its own `ConnectionPool`

pub mod affinity;
pub mod balanced;
pub mod least_busy;
pub mod pool;
pub mod round_robin;
pub mod upstream;

use std::rc::Rc;

use crate::dispatcher::request::Request;

pub use affinity::Affinity;
pub use balanced::{BalancedOptions, BalancedPool};
pub use least_busy::LeastBusy;
pub use pool::{ConnectionPool, PoolOptions, PoolStats};
pub use round_robin::RoundRobin;
pub use upstream::{HealthState, Upstream};

/// Upstream selection policy.
pub trait LoadBalancer {
    /// Index into `upstreams` of the one that should take `request`.
    fn select(&self, upstreams: &[Rc<Upstream>], request: &Request) -> Option<usize>;
}

/// Connector that never completes, for tests that only inspect queueing.
#[cfg(test)]
pub(crate) struct NullConnector;

#[cfg(test)]
impl crate::net::transport::Connector for NullConnector {
    fn connect(
        &self,
        _origin: &crate::dispatcher::request::Origin,
        _events: crate::net::transport::SocketEvents,
    ) {
    }
}

#[cfg(test)]
pub(crate) fn test_upstreams(origins: &[&str]) -> Vec<Rc<Upstream>> {
    use crate::dispatcher::request::Origin;
    origins
        .iter()
        .map(|o| {
            let origin = Origin::parse(o).unwrap();
            let pool = ConnectionPool::new(
                origin.clone(),
                Rc::new(NullConnector),
                PoolOptions::default(),
            );
            Rc::new(Upstream::new(origin, pool))
        })
        .collect()
}
