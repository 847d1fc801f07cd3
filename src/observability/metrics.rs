//! Metrics collection and exposition.
//!
//! # Metrics
//! - `pipeliner_requests_total` (counter): terminal outcomes by origin
//! - `pipeliner_connections_total` (counter): connect, disconnect and
//!   connect error events by origin
//! - `pipeliner_retries_total` (counter): retry attempts by origin
//! - `pipeliner_redirects_total` (counter): followed redirects by origin
//! - `pipeliner_queue_depth` (gauge): requests waiting in a pool queue
//!
//! # Design Decisions
//! - Recording is a no-op until an exporter is installed, so the engine
//!   records unconditionally
//! - Labels stay low-cardinality: origin and a fixed outcome vocabulary

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Outcome label for `pipeliner_requests_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
    Aborted,
    Upgraded,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Failed => "failed",
            Outcome::Aborted => "aborted",
            Outcome::Upgraded => "upgraded",
        }
    }
}

/// Event label for `pipeliner_connections_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    Disconnect,
    ConnectError,
}

impl ConnectionEvent {
    fn as_str(self) -> &'static str {
        match self {
            ConnectionEvent::Connect => "connect",
            ConnectionEvent::Disconnect => "disconnect",
            ConnectionEvent::ConnectError => "connect_error",
        }
    }
}

pub fn record_request(origin: &str, outcome: Outcome) {
    metrics::counter!(
        "pipeliner_requests_total",
        "origin" => origin.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

pub fn record_connection(origin: &str, event: ConnectionEvent) {
    metrics::counter!(
        "pipeliner_connections_total",
        "origin" => origin.to_string(),
        "event" => event.as_str()
    )
    .increment(1);
}

pub fn record_retry(origin: &str) {
    metrics::counter!("pipeliner_retries_total", "origin" => origin.to_string()).increment(1);
}

pub fn record_redirect(origin: &str) {
    metrics::counter!("pipeliner_redirects_total", "origin" => origin.to_string()).increment(1);
}

pub fn set_queue_depth(origin: &str, depth: usize) {
    metrics::gauge!("pipeliner_queue_depth", "origin" => origin.to_string()).set(depth as f64);
}

/// Install the Prometheus exporter with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "failed to install metrics exporter"),
    }
}
