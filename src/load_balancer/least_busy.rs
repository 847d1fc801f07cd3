//! Least busy load balancing strategy.

use std::rc::Rc;

use crate::dispatcher::request::Request;
use crate::load_balancer::{upstream::Upstream, LoadBalancer};

/// Selects the upstream with the fewest queued plus in-flight requests.
#[derive(Debug, Default)]
pub struct LeastBusy;

impl LeastBusy {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastBusy {
    fn select(&self, upstreams: &[Rc<Upstream>], _request: &Request) -> Option<usize> {
        // In case of tie, the first one is selected (stability)
        let healthy = upstreams
            .iter()
            .enumerate()
            .filter(|(_, u)| u.is_healthy())
            .min_by_key(|(_, u)| u.load())
            .map(|(i, _)| i);
        healthy.or_else(|| {
            upstreams
                .iter()
                .enumerate()
                .min_by_key(|(_, u)| u.load())
                .map(|(i, _)| i)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_upstreams;

    #[test]
    fn test_least_busy_prefers_first_on_tie() {
        let lb = LeastBusy::new();
        let upstreams = test_upstreams(&["http://a:80", "http://b:80"]);
        assert_eq!(lb.select(&upstreams, &Request::get("/")), Some(0));
    }

    #[test]
    fn test_least_busy_skips_unhealthy() {
        let lb = LeastBusy::new();
        let upstreams = test_upstreams(&["http://a:80", "http://b:80"]);
        upstreams[0].mark_failure(1);
        assert_eq!(lb.select(&upstreams, &Request::get("/")), Some(1));
    }
}
