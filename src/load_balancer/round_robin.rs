//! Round-robin load balancing strategy.

use std::cell::Cell;
use std::rc::Rc;

use crate::dispatcher::request::Request;
use crate::load_balancer::{upstream::Upstream, LoadBalancer};

/// Round-robin selector.
/// Stores an internal counter to rotate through upstreams.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: Cell<usize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next index in rotation, preferring healthy upstreams.
    pub(crate) fn next_index(&self, upstreams: &[Rc<Upstream>]) -> Option<usize> {
        if upstreams.is_empty() {
            return None;
        }
        let start = self.counter.get();
        self.counter.set(start.wrapping_add(1));
        let len = upstreams.len();

        for i in 0..len {
            let index = (start + i) % len;
            if upstreams[index].is_healthy() {
                return Some(index);
            }
        }
        // Nothing healthy: keep rotating over everything.
        Some(start % len)
    }
}

impl LoadBalancer for RoundRobin {
    fn select(&self, upstreams: &[Rc<Upstream>], _request: &Request) -> Option<usize> {
        self.next_index(upstreams)
    }
}
