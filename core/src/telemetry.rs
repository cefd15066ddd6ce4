// Logging setup. Weft only emits `tracing` events; exporting them is left to
// the embedding application.
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::RuntimeConfig;

/// Install a fmt subscriber filtered by `RUST_LOG`, or by `default_filter`
/// when `RUST_LOG` is unset or invalid.
///
/// Returns false if a global subscriber was already installed, so it is safe
/// to call from every test.
pub fn init_tracing(default_filter: &str) -> bool {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .is_ok();

    if installed {
        info!(target: "telemetry", filter = %default_filter, "Tracing initialized");
    }
    installed
}

/// [`init_tracing`] with the config's `log_filter`.
pub fn init_from_config(config: &RuntimeConfig) -> bool {
    init_tracing(&config.log_filter)
}
