use tracing_subscriber::EnvFilter;

use crate::{FluuxError, config::LoggingConfig};

/// Directive used when `RUST_LOG` is not set: the configured level for the
/// engine crates, `warn` for everything else.
pub fn default_directive(level: &str) -> String {
    format!("warn,fluux_core={level},fluux_presence={level},fluux_xmpp={level}")
}

pub fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(&config.level)))
}

/// Install the global fmt subscriber. Fails if one is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), FluuxError> {
    tracing_subscriber::fmt()
        .with_env_filter(build_filter(config))
        .with_target(true)
        .try_init()
        .map_err(|e| FluuxError::Logging(e.to_string()))
}
