//! Upstream abstraction.
//!
//! # Responsibilities
//! - Represent one origin behind a balanced pool
//! - Own the connection pool for that origin
//! - Track passive health state (Unknown/Healthy/Unhealthy)

use std::cell::{Cell, RefCell};

use crate::dispatcher::request::Origin;
use crate::dispatcher::Subscription;
use crate::load_balancer::pool::{ConnectionPool, PoolStats};

/// Health State enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

/// A single upstream origin.
pub struct Upstream {
    origin: Origin,
    pool: ConnectionPool,
    state: Cell<HealthState>,
    consecutive_failures: Cell<usize>,
    consecutive_successes: Cell<usize>,
    subscription: RefCell<Option<Subscription>>,
}

impl Upstream {
    pub fn new(origin: Origin, pool: ConnectionPool) -> Self {
        Self {
            origin,
            pool,
            state: Cell::new(HealthState::Unknown),
            consecutive_failures: Cell::new(0),
            consecutive_successes: Cell::new(0),
            subscription: RefCell::new(None),
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Queued plus in-flight requests, used by least-busy selection.
    pub fn load(&self) -> usize {
        self.pool.stats().size
    }

    pub fn health(&self) -> HealthState {
        self.state.get()
    }

    /// Healthy or Unknown.
    pub fn is_healthy(&self) -> bool {
        self.state.get() != HealthState::Unhealthy
    }

    pub(crate) fn hold(&self, subscription: Subscription) {
        *self.subscription.borrow_mut() = Some(subscription);
    }

    /// Report a successful connect.
    pub fn mark_success(&self, healthy_threshold: usize) {
        self.consecutive_failures.set(0);
        if self.state.get() == HealthState::Healthy {
            return;
        }
        let successes = self.consecutive_successes.get() + 1;
        self.consecutive_successes.set(successes);
        if successes >= healthy_threshold {
            if self.state.get() == HealthState::Unhealthy {
                tracing::info!(origin = %self.origin, "upstream recovered");
            }
            self.state.set(HealthState::Healthy);
        }
    }

    /// Report a failed connect.
    pub fn mark_failure(&self, unhealthy_threshold: usize) {
        self.consecutive_successes.set(0);
        if self.state.get() == HealthState::Unhealthy {
            return;
        }
        let failures = self.consecutive_failures.get() + 1;
        self.consecutive_failures.set(failures);
        if failures >= unhealthy_threshold {
            tracing::warn!(origin = %self.origin, failures, "upstream marked unhealthy");
            self.state.set(HealthState::Unhealthy);
        }
    }
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("origin", &self.origin)
            .field("state", &self.state.get())
            .finish()
    }
}
