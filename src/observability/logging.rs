//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber once per process
//! - Honor `RUST_LOG` before the configured level
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - Engine code logs with fields (`origin`, `connection_id`, `error`)
//!   rather than formatted strings

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. A second call is a no-op.
///
/// `level` is an `EnvFilter` directive used when `RUST_LOG` is unset,
/// e.g. `"info"` or `"pipeliner=debug"`.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
