//! Tracing setup for the viability service.
//!
//! Initialization is guarded by `OnceLock` so tests and the binary can call it
//! repeatedly.
use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs the fmt subscriber filtered by `RUST_LOG` (default `info`).
pub fn init_tracing(service_name: &str) {
    TRACING_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
        if tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .is_ok()
        {
            tracing::debug!(service = service_name, "tracing initialized");
        }
    });
}
