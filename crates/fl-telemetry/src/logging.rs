use tracing_subscriber::{fmt, EnvFilter};

/// Where log lines go and how they look.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogOutput {
    /// Human-readable lines on stderr.
    #[default]
    Pretty,
    /// One JSON object per line on stderr, for log shippers.
    Json,
}

impl LogOutput {
    pub fn init(self, service_name: &str, default_level: &str) {
        match self {
            LogOutput::Pretty => init_logging(service_name, default_level),
            LogOutput::Json => init_logging_json(service_name, default_level),
        }
    }
}

/// Build the filter: `RUST_LOG` if set, else `default_level`.
///
/// An unparsable `default_level` falls back to `info` rather than
/// silencing everything.
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize human-readable logging.
///
/// Safe to call more than once; only the first call installs a subscriber.
/// Output goes to stderr so command results on stdout stay machine-readable.
pub fn init_logging(service_name: &str, default_level: &str) {
    let installed = fmt()
        .with_env_filter(env_filter(default_level))
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(service = service_name, "logging initialised (human-readable)");
    }
}

/// Initialize JSON logging, one object per line.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    let installed = fmt()
        .json()
        .with_env_filter(env_filter(default_level))
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_current_span(true)
        .with_level(true)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(service = service_name, "logging initialised (json)");
    }
}
