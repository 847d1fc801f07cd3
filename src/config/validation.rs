//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, thresholds ≥ 1)
//! - Check that upstreams, methods and addresses parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ClientConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;
use std::str::FromStr;

use http::Method;

use crate::config::schema::{parse_error_kind, ClientConfig};
use crate::dispatcher::Origin;

/// One rejected setting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Dotted path of the offending setting (e.g. `connection.pipelining`).
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &ClientConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let connection = &config.connection;
    for (field, value) in [
        ("connection.connect_timeout_ms", connection.connect_timeout_ms),
        ("connection.headers_timeout_ms", connection.headers_timeout_ms),
        ("connection.body_timeout_ms", connection.body_timeout_ms),
        ("connection.keep_alive_timeout_ms", connection.keep_alive_timeout_ms),
        ("connection.keep_alive_max_timeout_ms", connection.keep_alive_max_timeout_ms),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }
    if connection.keep_alive_timeout_ms > connection.keep_alive_max_timeout_ms {
        errors.push(ValidationError::new(
            "connection.keep_alive_timeout_ms",
            "must not exceed keep_alive_max_timeout_ms",
        ));
    }
    if connection.max_header_size < 1024 {
        errors.push(ValidationError::new(
            "connection.max_header_size",
            "must be at least 1024 bytes",
        ));
    }
    if connection.max_concurrent_streams == 0 {
        errors.push(ValidationError::new(
            "connection.max_concurrent_streams",
            "must be greater than 0",
        ));
    }

    if config.pool.connections == Some(0) {
        errors.push(ValidationError::new(
            "pool.connections",
            "must be greater than 0 when set",
        ));
    }

    let balancer = &config.balancer;
    for upstream in &balancer.upstreams {
        if let Err(e) = Origin::parse(upstream) {
            errors.push(ValidationError::new("balancer.upstreams", e.to_string()));
        }
    }
    if balancer.healthy_threshold == 0 {
        errors.push(ValidationError::new(
            "balancer.healthy_threshold",
            "must be at least 1",
        ));
    }
    if balancer.unhealthy_threshold == 0 {
        errors.push(ValidationError::new(
            "balancer.unhealthy_threshold",
            "must be at least 1",
        ));
    }
    if balancer.affinity_header.trim().is_empty() {
        errors.push(ValidationError::new(
            "balancer.affinity_header",
            "must not be empty",
        ));
    }

    let retry = &config.retry;
    if retry.min_timeout_ms > retry.max_timeout_ms {
        errors.push(ValidationError::new(
            "retry.min_timeout_ms",
            "must not exceed max_timeout_ms",
        ));
    }
    if !retry.timeout_factor.is_finite() || retry.timeout_factor < 1.0 {
        errors.push(ValidationError::new(
            "retry.timeout_factor",
            "must be a finite number ≥ 1",
        ));
    }
    for method in &retry.methods {
        if Method::from_str(method).is_err() {
            errors.push(ValidationError::new(
                "retry.methods",
                format!("invalid method {method:?}"),
            ));
        }
    }
    for status in &retry.status_codes {
        if !(100..=599).contains(status) {
            errors.push(ValidationError::new(
                "retry.status_codes",
                format!("{status} is not an HTTP status"),
            ));
        }
    }
    for kind in &retry.error_kinds {
        if parse_error_kind(kind).is_none() {
            errors.push(ValidationError::new(
                "retry.error_kinds",
                format!("unknown error kind {kind:?}"),
            ));
        }
    }

    let observability = &config.observability;
    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("invalid address {:?}", observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(validate_config(&ClientConfig::default()), Ok(()));
    }

    #[test]
    fn test_reports_every_error() {
        let mut config = ClientConfig::default();
        config.connection.connect_timeout_ms = 0;
        config.pool.connections = Some(0);
        config.balancer.upstreams = vec!["not a url".to_string()];
        config.retry.methods.push("GE T".to_string());
        config.retry.error_kinds.push("gremlins".to_string());

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "connection.connect_timeout_ms",
                "pool.connections",
                "balancer.upstreams",
                "retry.methods",
                "retry.error_kinds",
            ]
        );
    }
}
