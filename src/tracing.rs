//! Tracing/logging initialization
//!
//! Console logging via tracing-subscriber with an env-driven filter.
//! Session and VM spans are created at the call sites (`info_span!`);
//! this module only installs the subscriber.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subsystem
///
/// Sets up console logging with a target field and an `EnvFilter` read from
/// `RUST_LOG`, defaulting to info globally and debug for this crate.
///
/// Safe to call more than once; later calls are no-ops (useful in tests).
pub fn init_tracing(service_name: &str) {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,agentvisor=debug"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();

    tracing::info!(service = service_name, "tracing initialized");
}
