//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Connections, pools and interceptors produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters and gauges)
//!
//! Consumers:
//!     → stderr via tracing-subscriber
//!     → Metrics endpoint (Prometheus scrape, CLI opt-in)
//! ```
//!
//! # Design Decisions
//! - Lifecycle notices for embedders go through `DispatcherEvent`
//!   observers; this module only covers logs and metrics

pub mod logging;
pub mod metrics;
