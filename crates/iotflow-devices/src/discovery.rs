/*!
 * Device discovery.
 *
 * Adapters answer discovery requests through a [`DiscoverySource`]. A source
 * reports what it found; deciding what is new and announcing it is the
 * device manager's job. Discovered devices are never registered
 * automatically.
 */
use std::fmt::Debug;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use iotflow_core::device::{Device, DeviceType, Protocol};
use iotflow_core::types::{Params, Value};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::Result;

/// Metadata key linking a registered device to its discovery id
pub const DISCOVERED_ID_KEY: &str = "discovered_id";

/// A device seen by a discovery scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Protocol-specific identity: MAC, IEEE address, DevEUI, URL...
    pub discovery_id: String,
    /// Advertised name
    pub name: String,
    #[allow(missing_docs)]
    pub protocol: Protocol,
    #[allow(missing_docs)]
    pub address: Option<String>,
    #[allow(missing_docs)]
    pub port: Option<u16>,
    #[allow(missing_docs)]
    pub manufacturer: Option<String>,
    #[allow(missing_docs)]
    pub model: Option<String>,
    /// Everything else the device advertised
    #[serde(default)]
    pub advertised: Params,
}

impl DiscoveredDevice {
    /// A sighting with only an identity and a name
    pub fn new<I: Into<String>, N: Into<String>>(
        discovery_id: I,
        name: N,
        protocol: Protocol,
    ) -> Self {
        Self {
            discovery_id: discovery_id.into(),
            name: name.into(),
            protocol,
            address: None,
            port: None,
            manufacturer: None,
            model: None,
            advertised: Params::new(),
        }
    }

    /// Set the network address
    pub fn with_address<S: Into<String>>(mut self, address: S, port: Option<u16>) -> Self {
        self.address = Some(address.into());
        self.port = port;
        self
    }

    /// Device type guessed from the advertised name
    pub fn inferred_type(&self) -> DeviceType {
        infer_device_type(&self.name)
    }

    /// A device record pre-filled from this sighting, for callers that
    /// decide to register it
    pub fn to_device(&self) -> Device {
        let mut device = Device::new(&self.name, self.inferred_type(), self.protocol)
            .with_metadata(DISCOVERED_ID_KEY, json!(self.discovery_id));
        device.address = self.address.clone();
        device.port = self.port;
        device.manufacturer = self.manufacturer.clone();
        device.model = self.model.clone();
        for (key, value) in &self.advertised {
            device.attributes.insert(key.clone(), value.clone());
        }
        device
    }

    /// Payload of the `device_discovered` event
    pub fn to_event_data(&self) -> Params {
        let mut data = Params::new();
        data.insert("discovered_id".into(), json!(self.discovery_id));
        data.insert("name".into(), json!(self.name));
        data.insert("protocol".into(), json!(self.protocol));
        data.insert("device_type".into(), json!(self.inferred_type()));
        data.insert(
            "address".into(),
            self.address.clone().map(Value::from).unwrap_or(Value::Null),
        );
        if let Some(port) = self.port {
            data.insert("port".into(), json!(port));
        }
        if let Some(manufacturer) = &self.manufacturer {
            data.insert("manufacturer".into(), json!(manufacturer));
        }
        if let Some(model) = &self.model {
            data.insert("model".into(), json!(model));
        }
        data
    }
}

/// Guess a device type from an advertised name
pub fn infer_device_type(name: &str) -> DeviceType {
    let name = name.to_ascii_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| name.contains(w));

    if has(&["light", "bulb", "lamp"]) {
        DeviceType::Light
    } else if has(&["switch", "plug", "outlet"]) {
        DeviceType::Switch
    } else if has(&["thermostat"]) {
        DeviceType::Thermostat
    } else if has(&["lock"]) {
        DeviceType::Lock
    } else if has(&["camera", "cam"]) {
        DeviceType::Camera
    } else if has(&["sensor"]) {
        DeviceType::Sensor
    } else if has(&["speaker", "audio"]) {
        DeviceType::Speaker
    } else if has(&["gateway", "hub", "bridge"]) {
        DeviceType::Gateway
    } else {
        DeviceType::Custom
    }
}

/// Source of discovery results for one or more protocols
#[async_trait]
pub trait DiscoverySource: Send + Sync + Debug {
    /// Source name used in logs
    fn name(&self) -> &str;

    /// Report devices reachable over `protocol`, spending at most `timeout`
    async fn scan(&self, protocol: Protocol, timeout: Duration) -> Result<Vec<DiscoveredDevice>>;
}

/// Source answering from a list of announced devices. Gateways and
/// simulators push sightings into it; tests use it to script discovery.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    name: String,
    devices: RwLock<Vec<DiscoveredDevice>>,
}

impl StaticDiscovery {
    /// An empty source
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            devices: RwLock::new(Vec::new()),
        }
    }

    /// Add a sighting; a later sighting with the same id replaces it
    pub fn announce(&self, device: DiscoveredDevice) {
        let mut devices = match self.devices.write() {
            Ok(devices) => devices,
            Err(poisoned) => poisoned.into_inner(),
        };
        devices.retain(|d| d.discovery_id != device.discovery_id);
        devices.push(device);
    }

    /// Forget a sighting
    pub fn withdraw(&self, discovery_id: &str) -> bool {
        let mut devices = match self.devices.write() {
            Ok(devices) => devices,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = devices.len();
        devices.retain(|d| d.discovery_id != discovery_id);
        devices.len() != before
    }
}

#[async_trait]
impl DiscoverySource for StaticDiscovery {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scan(&self, protocol: Protocol, _timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
        let devices = match self.devices.read() {
            Ok(devices) => devices,
            Err(poisoned) => poisoned.into_inner(),
        };
        let found: Vec<DiscoveredDevice> = devices
            .iter()
            .filter(|d| d.protocol == protocol)
            .cloned()
            .collect();
        debug!(source = %self.name, %protocol, found = found.len(), "scan finished");
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_device_type() {
        assert_eq!(infer_device_type("Hue Bulb 2"), DeviceType::Light);
        assert_eq!(infer_device_type("Desk LAMP"), DeviceType::Light);
        assert_eq!(infer_device_type("Smart Plug"), DeviceType::Switch);
        assert_eq!(infer_device_type("Nest Thermostat"), DeviceType::Thermostat);
        assert_eq!(infer_device_type("Front Door Lock"), DeviceType::Lock);
        assert_eq!(infer_device_type("Porch Cam"), DeviceType::Camera);
        assert_eq!(infer_device_type("Motion Sensor"), DeviceType::Sensor);
        assert_eq!(infer_device_type("Kitchen Speaker"), DeviceType::Speaker);
        assert_eq!(infer_device_type("Zigbee Gateway"), DeviceType::Gateway);
        assert_eq!(infer_device_type("XYZ-100"), DeviceType::Custom);
    }

    #[test]
    fn test_to_device_carries_discovery_id() {
        let found = DiscoveredDevice::new("aa:bb:cc", "Porch Light", Protocol::Bluetooth)
            .with_address("aa:bb:cc", None);
        let device = found.to_device();
        assert_eq!(device.device_type, DeviceType::Light);
        assert_eq!(device.metadata.get(DISCOVERED_ID_KEY), Some(&json!("aa:bb:cc")));
        assert_eq!(found.to_event_data().get("device_type"), Some(&json!("light")));
    }

    #[tokio::test]
    async fn test_static_discovery_filters_by_protocol() {
        let source = StaticDiscovery::new("sim");
        source.announce(DiscoveredDevice::new("1", "Bulb", Protocol::Zigbee));
        source.announce(DiscoveredDevice::new("2", "Plug", Protocol::Mqtt));
        source.announce(DiscoveredDevice::new("1", "Bulb v2", Protocol::Zigbee));

        let found = source.scan(Protocol::Zigbee, Duration::from_secs(1)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Bulb v2");

        assert!(source.withdraw("2"));
        assert!(source.scan(Protocol::Mqtt, Duration::from_secs(1)).await.unwrap().is_empty());
    }
}
