/*!
 * iotflow devices
 *
 * Protocol adapters, the device registry and the device manager. Each wire
 * protocol is reached through a [`ProtocolAdapter`]. MQTT and HTTP ride on
 * their client libraries; the remaining built-in ones are a generic
 * [`FramedAdapter`] driven by a per-protocol dialect.
 */

#![warn(missing_docs)]

// Re-export core types
pub use iotflow_core::prelude;

pub mod adapter;
pub mod correlation;
pub mod discovery;
pub mod error;
pub mod framed;
pub mod manager;
pub mod protocols;
pub mod registry;
pub mod session;
pub mod state;
pub mod topic;
pub mod transport;

pub use adapter::{
    AdapterTable, ConnectOptions, InboundKind, InboundMessage, ProtocolAdapter, SharedAdapter,
    Subscription,
};
pub use discovery::{DiscoveredDevice, DiscoverySource, StaticDiscovery};
pub use error::{DeviceError, Result};
pub use framed::{Dialect, FramedAdapter};
pub use protocols::{HttpAdapter, MqttAdapter, MqttConfig};
pub use session::SessionHub;
pub use manager::{DeviceManager, SharedDeviceManager};
pub use registry::{DeviceRegistry, RegistryEvent, SharedDeviceRegistry};
pub use state::{SharedStateCache, StateCache};
pub use transport::{Connector, MemoryConnector, SharedConnector, TcpConnector, Wire};

/// iotflow devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device system
pub fn init() -> std::result::Result<(), iotflow_core::error::Error> {
    tracing::info!(version = VERSION, protocols = ?available_protocols(), "iotflow devices initialized");
    Ok(())
}

/// Protocols with a built-in adapter
pub fn available_protocols() -> Vec<&'static str> {
    iotflow_core::device::Protocol::ALL
        .iter()
        .map(|p| p.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_protocols() {
        let protocols = available_protocols();
        assert_eq!(protocols.len(), 10);
        assert!(protocols.contains(&"can_bus"));
        assert!(protocols.contains(&"obd2"));
    }
}
