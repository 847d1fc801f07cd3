//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the client.
//! All types derive Serde traits for deserialization from config files, and
//! convert into the option structs the engine consumes.

use std::str::FromStr;
use std::time::Duration;

use http::Method;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::http::h1::DEFAULT_MAX_HEADER_SIZE;
use crate::load_balancer::{
    Affinity, BalancedOptions, LeastBusy, LoadBalancer, PoolOptions, RoundRobin,
};
use crate::net::ConnectionOptions;
use crate::resilience::{RedirectOptions, RetryOptions};

/// Root configuration for the client.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-socket behavior.
    pub connection: ConnectionConfig,

    /// Connections per origin.
    pub pool: PoolConfig,

    /// Load balancing across equivalent origins.
    pub balancer: BalancerConfig,

    /// Retry interceptor.
    pub retry: RetryConfig,

    /// Redirect interceptor.
    pub redirect: RedirectConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

/// Connection configuration. Durations are in milliseconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Maximum in-flight requests per socket (0 = close after each).
    pub pipelining: usize,
    pub connect_timeout_ms: u64,
    pub headers_timeout_ms: u64,
    pub body_timeout_ms: u64,
    pub keep_alive_timeout_ms: u64,
    pub keep_alive_max_timeout_ms: u64,
    pub keep_alive_timeout_threshold_ms: u64,
    pub max_header_size: usize,
    pub strict_content_length: bool,
    pub allow_h2: bool,
    pub max_concurrent_streams: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pipelining: 1,
            connect_timeout_ms: 10_000,
            headers_timeout_ms: 300_000,
            body_timeout_ms: 300_000,
            keep_alive_timeout_ms: 4_000,
            keep_alive_max_timeout_ms: 600_000,
            keep_alive_timeout_threshold_ms: 2_000,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            strict_content_length: true,
            allow_h2: false,
            max_concurrent_streams: 100,
        }
    }
}

impl ConnectionConfig {
    pub fn to_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            pipelining: self.pipelining,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            headers_timeout: Duration::from_millis(self.headers_timeout_ms),
            body_timeout: Duration::from_millis(self.body_timeout_ms),
            keep_alive_timeout: Duration::from_millis(self.keep_alive_timeout_ms),
            keep_alive_max_timeout: Duration::from_millis(self.keep_alive_max_timeout_ms),
            keep_alive_timeout_threshold: Duration::from_millis(
                self.keep_alive_timeout_threshold_ms,
            ),
            max_header_size: self.max_header_size,
            strict_content_length: self.strict_content_length,
            allow_h2: self.allow_h2,
            max_concurrent_streams: self.max_concurrent_streams,
            session_factory: None,
        }
    }
}

/// Pool configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum connections per origin. Unset means unbounded.
    pub connections: Option<usize>,
}

/// Upstream selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerPolicy {
    #[default]
    RoundRobin,
    LeastBusy,
    Affinity,
}

/// Balanced pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Equivalent origins (e.g., "http://10.0.0.1:8080").
    pub upstreams: Vec<String>,

    pub policy: BalancerPolicy,

    /// Header hashed by the affinity policy.
    pub affinity_header: String,

    /// Consecutive successful connects before an upstream is healthy again.
    pub healthy_threshold: usize,

    /// Consecutive failed connects before an upstream is skipped.
    pub unhealthy_threshold: usize,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            upstreams: Vec::new(),
            policy: BalancerPolicy::RoundRobin,
            affinity_header: "x-affinity-key".to_string(),
            healthy_threshold: 1,
            unhealthy_threshold: 3,
        }
    }
}

impl BalancerConfig {
    pub fn balancer(&self) -> Box<dyn LoadBalancer> {
        match self.policy {
            BalancerPolicy::RoundRobin => Box::new(RoundRobin::new()),
            BalancerPolicy::LeastBusy => Box::new(LeastBusy::new()),
            BalancerPolicy::Affinity => Box::new(Affinity::new(self.affinity_header.clone())),
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable the retry interceptor.
    pub enabled: bool,

    /// Maximum number of retries per request.
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds.
    pub min_timeout_ms: u64,

    /// Maximum delay between attempts in milliseconds.
    pub max_timeout_ms: u64,

    /// Growth factor of the delay.
    pub timeout_factor: f64,

    /// Honor `Retry-After` on retryable statuses.
    pub retry_after: bool,

    /// Methods eligible for retry.
    pub methods: Vec<String>,

    /// Response statuses that trigger a retry.
    pub status_codes: Vec<u16>,

    /// Error kinds that trigger a retry (e.g., "socket", "connect_timeout").
    pub error_kinds: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let defaults = RetryOptions::default();
        Self {
            enabled: true,
            max_retries: defaults.max_retries,
            min_timeout_ms: defaults.min_timeout.as_millis() as u64,
            max_timeout_ms: defaults.max_timeout.as_millis() as u64,
            timeout_factor: defaults.timeout_factor,
            retry_after: defaults.retry_after,
            methods: defaults.methods.iter().map(ToString::to_string).collect(),
            status_codes: defaults.status_codes,
            error_kinds: vec![
                "socket".to_string(),
                "connect_timeout".to_string(),
                "headers_timeout".to_string(),
            ],
        }
    }
}

impl RetryConfig {
    /// Unparseable methods and kinds are skipped; validation reports them.
    pub fn to_options(&self) -> RetryOptions {
        RetryOptions {
            max_retries: self.max_retries,
            min_timeout: Duration::from_millis(self.min_timeout_ms),
            max_timeout: Duration::from_millis(self.max_timeout_ms),
            timeout_factor: self.timeout_factor,
            retry_after: self.retry_after,
            methods: self
                .methods
                .iter()
                .filter_map(|m| Method::from_str(m).ok())
                .collect(),
            status_codes: self.status_codes.clone(),
            error_kinds: self
                .error_kinds
                .iter()
                .filter_map(|k| parse_error_kind(k))
                .collect(),
            decide: None,
        }
    }
}

/// Config name of an [`ErrorKind`].
pub fn parse_error_kind(name: &str) -> Option<ErrorKind> {
    let kind = match name {
        "socket" => ErrorKind::Socket,
        "connect_timeout" => ErrorKind::ConnectTimeout,
        "headers_timeout" => ErrorKind::HeadersTimeout,
        "body_timeout" => ErrorKind::BodyTimeout,
        "parser" => ErrorKind::Parser,
        "informational" => ErrorKind::Informational,
        "no_upstream" => ErrorKind::NoUpstream,
        _ => return None,
    };
    Some(kind)
}

/// Redirect configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RedirectConfig {
    /// Redirects followed per request (0 disables following).
    pub max_redirections: u32,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            max_redirections: RedirectOptions::default().max_redirections,
        }
    }
}

impl RedirectConfig {
    pub fn to_options(&self) -> RedirectOptions {
        RedirectOptions {
            max_redirections: self.max_redirections,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            connections: self.pool.connections,
            connection: self.connection.to_options(),
        }
    }

    pub fn balanced_options(&self) -> BalancedOptions {
        BalancedOptions {
            pool: self.pool_options(),
            healthy_threshold: self.balancer.healthy_threshold,
            unhealthy_threshold: self.balancer.unhealthy_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_engine_defaults() {
        let config = ClientConfig::default();
        let options = config.connection.to_options();
        let engine = ConnectionOptions::default();
        assert_eq!(options.pipelining, engine.pipelining);
        assert_eq!(options.keep_alive_timeout, engine.keep_alive_timeout);
        assert_eq!(options.headers_timeout, engine.headers_timeout);

        let retry = config.retry.to_options();
        assert_eq!(retry.methods, RetryOptions::default().methods);
        assert_eq!(retry.error_kinds, RetryOptions::default().error_kinds);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
            [connection]
            pipelining = 4

            [balancer]
            policy = "least_busy"
            upstreams = ["http://a:80"]
            "#,
        )
        .unwrap();
        assert_eq!(config.connection.pipelining, 4);
        assert_eq!(config.connection.connect_timeout_ms, 10_000);
        assert_eq!(config.balancer.policy, BalancerPolicy::LeastBusy);
        assert_eq!(config.redirect.max_redirections, 5);
    }
}
