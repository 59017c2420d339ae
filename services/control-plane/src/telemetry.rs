//! Tracing setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the JSON subscriber. `RUST_LOG` wins over `log_level` when set.
///
/// Calling this more than once is harmless; later calls leave the first
/// subscriber in place.
pub fn init(log_level: &str) {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .with(tracing_subscriber::fmt::layer().json())
        .try_init();
}
