//! Structured logging bootstrap and span helpers.
//!
//! Every gateway binary calls [`init_logging`] once at startup; library code
//! only emits `tracing` events and never installs a subscriber.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs, one object per line.
    Json,
    /// Human-readable logs for local development.
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; subsequent calls are no-ops. Honors
/// `RUST_LOG` for per-target filtering and defaults to `info`.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer())
                    .init();
            }
        }
    });
}

/// Creates a span for per-shard pipeline operations.
#[must_use]
pub fn shard_span(operation: &str, shard: &str) -> Span {
    tracing::info_span!("shard", op = operation, shard = shard)
}
