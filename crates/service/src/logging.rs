//! Structured logging for the daemon.

use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Initialize logging once, idempotently. `sentrad` normally runs under a
/// process supervisor, so the default output is one JSON object per line
/// with the current span flattened in; `SENTRA_LOG=plain` switches to a
/// compact human-readable form for development. The filter comes from
/// `RUST_LOG`, e.g. "info,service=debug".
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let plain = std::env::var("SENTRA_LOG").map(|v| v == "plain").unwrap_or(false);
    if plain {
        let layer = fmt::layer().compact().with_target(false);
        tracing::subscriber::set_global_default(Registry::default().with(filter).with(layer))
            .ok();
    } else {
        let layer = fmt::layer().json().flatten_event(true).with_current_span(true);
        tracing::subscriber::set_global_default(Registry::default().with(filter).with(layer))
            .ok();
    }
}
