use tracing_subscriber::{fmt, EnvFilter};

/// Output format selected from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Human,
    Json,
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize logging with human-readable output format.
///
/// `RUST_LOG` wins over `default_level` (e.g. "info", "tf_daemon=debug,warn").
/// Safe to call multiple times; later calls are no-ops.
pub fn init_logging(service_name: &str, default_level: &str) {
    fmt()
        .with_env_filter(filter(default_level))
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .try_init()
        .ok();

    tracing::debug!(service = service_name, "logging initialised (human-readable)");
}

/// Initialize logging with JSON lines on stderr.
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    fmt()
        .json()
        .with_env_filter(filter(default_level))
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_current_span(true)
        .with_level(true)
        .try_init()
        .ok();

    tracing::debug!(service = service_name, "logging initialised (json)");
}

pub fn init(service_name: &str, default_level: &str, format: Format) {
    match format {
        Format::Human => init_logging(service_name, default_level),
        Format::Json => init_logging_json(service_name, default_level),
    }
}
