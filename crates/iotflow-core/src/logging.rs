/*!
 * Logging setup.
 *
 * `RUST_LOG` wins when set; otherwise the configured level is used.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize logging from the `[logging]` configuration section
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    install(&config.level, config.with_target)
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "iotflow_devices=debug")
pub fn init_with_filter(filter: &str) -> Result<()> {
    install(filter, true)
}

fn install(filter: &str, with_target: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .map_err(|e| Error::config(format!("Invalid log filter '{}': {}", filter, e)))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(with_target))
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a span for a long-lived component (manager, collector, rule loop)
pub fn component_span(name: &str, id: Option<&str>) -> Span {
    match id {
        Some(id) => tracing::info_span!("component", name = %name, id = %id),
        None => tracing::info_span!("component", name = %name),
    }
}

/// Create a span for one operation against a device
pub fn device_span(operation: &str, device_id: &str) -> Span {
    tracing::debug_span!("device", op = %operation, device_id = %device_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_fails_cleanly() {
        let _ = init();
        // a global subscriber is now installed either way
        assert!(init_with_filter("debug").is_err());
    }

    #[test]
    fn test_spans_are_disabled_without_subscriber() {
        let span = component_span("manager", Some("primary"));
        let _ = span.is_none();
        let span = device_span("connect", "lamp-1");
        let _ = span.is_none();
    }
}
