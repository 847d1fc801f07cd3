//! Header affinity load balancing strategy.
//!
//! Requests carrying the same affinity header value land on the same
//! upstream while the upstream set and health are stable. Requests without
//! the header rotate round-robin.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::dispatcher::request::Request;
use crate::load_balancer::{round_robin::RoundRobin, upstream::Upstream, LoadBalancer};

#[derive(Debug)]
pub struct Affinity {
    header: String,
    fallback: RoundRobin,
}

impl Affinity {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            fallback: RoundRobin::new(),
        }
    }
}

impl LoadBalancer for Affinity {
    fn select(&self, upstreams: &[Rc<Upstream>], request: &Request) -> Option<usize> {
        let Some(key) = request.headers.get(&self.header) else {
            return self.fallback.next_index(upstreams);
        };
        let mut candidates: Vec<usize> = (0..upstreams.len())
            .filter(|&i| upstreams[i].is_healthy())
            .collect();
        if candidates.is_empty() {
            candidates = (0..upstreams.len()).collect();
        }
        if candidates.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let slot = (hasher.finish() % candidates.len() as u64) as usize;
        Some(candidates[slot])
    }
}
