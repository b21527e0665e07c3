//! # Structured Logging
//!
//! Environment-driven structured logging for embedders that do not install
//! their own subscriber. The engine itself only emits `tracing` events;
//! calling [`init_telemetry`] is optional and tolerated alongside an
//! existing global subscriber.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TELEMETRY_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize a fmt subscriber with an env-driven level filter
///
/// The level comes from `RUST_LOG` (default `info`). Safe to call more
/// than once and safe when the embedder already installed a subscriber.
pub fn init_telemetry() {
    TELEMETRY_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true));

        if subscriber.try_init().is_err() {
            tracing::debug!("global tracing subscriber already installed, keeping it");
        }
    });
}
