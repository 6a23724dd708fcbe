use bs_core::config::LogFormat;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber in the configured format.
///
/// Uses `RUST_LOG` if set, otherwise `default_level` (e.g. "info",
/// "bs_daemon=debug,warn"). Safe to call more than once; later calls are
/// no-ops.
pub fn init_logging(service_name: &str, default_level: &str, format: LogFormat) {
    match format {
        LogFormat::Human => init_human(default_level),
        LogFormat::Json => init_json(default_level),
    }
    tracing::info!(service = service_name, format = ?format, "logging initialised");
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn init_human(default_level: &str) {
    fmt()
        .with_env_filter(filter(default_level))
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .try_init()
        .ok();
}

/// One JSON object per line (Vector / Loki / journald friendly).
fn init_json(default_level: &str) {
    fmt()
        .json()
        .with_env_filter(filter(default_level))
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_current_span(true)
        .with_level(true)
        .try_init()
        .ok();
}
