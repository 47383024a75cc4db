/*!
 * iotflow core
 *
 * Device and telemetry data model, configuration, logging, the event bus
 * and the persistence boundary shared by the device and engine crates.
 */

#![warn(missing_docs)]

pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod logging;
pub mod prelude;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod utils;

pub use error::{Error, Result};

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use async_trait;
    pub use chrono;
    pub use futures;
    pub use serde;
    pub use serde_json;
    pub use tokio;
    pub use tracing;
    pub use uuid;
}

/// iotflow core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install logging from configuration and announce the version
pub fn init(config: &config::Config) -> Result<()> {
    logging::init_from_config(&config.logging)?;
    tracing::info!(version = VERSION, env = %config.general.environment, "iotflow core initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
