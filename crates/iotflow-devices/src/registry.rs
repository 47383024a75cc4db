/*!
 * Device registry.
 *
 * Durable device records live in the store; the registry fronts them with
 * an in-process cache of immutable snapshots. A change replaces the
 * snapshot, so readers holding an `Arc<Device>` never see a half-applied
 * update.
 */
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use iotflow_core::device::{Device, DeviceFilter, DeviceStatus, DeviceUpdate};
use iotflow_core::store::SharedStore;
use iotflow_core::types::new_id;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::discovery::DISCOVERED_ID_KEY;
use crate::error::{DeviceError, Result};

/// Changes announced by the registry
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A device was registered
    DeviceAdded(Arc<Device>),
    /// A device was unregistered
    DeviceRemoved(String),
    /// A device record was updated
    DeviceUpdated(Arc<Device>),
    /// The connection status of a device changed
    StatusChanged {
        /// The device ID
        id: String,
        /// The old status
        old_status: DeviceStatus,
        /// The new status
        new_status: DeviceStatus,
    },
}

/// Device registry
pub struct DeviceRegistry {
    store: SharedStore,
    devices: DashMap<String, Arc<Device>>,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices.len())
            .finish_non_exhaustive()
    }
}

impl DeviceRegistry {
    /// Create an empty registry backed by `store`
    pub fn new(store: SharedStore) -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            store,
            devices: DashMap::new(),
            event_sender,
        }
    }

    /// Fill the cache from the store; returns the number of devices loaded
    pub async fn load(&self) -> Result<usize> {
        let devices = self.store.load_devices().await?;
        let count = devices.len();
        for device in devices {
            self.devices.insert(device.id.clone(), Arc::new(device));
        }
        info!(count, "loaded devices from store");
        Ok(count)
    }

    /// Register a device, assigning an id when it has none.
    ///
    /// Fails with a conflict when the id is taken; the registry is left
    /// unchanged in that case.
    pub async fn register(&self, mut device: Device) -> Result<Arc<Device>> {
        if device.id.is_empty() {
            device.id = new_id();
        }
        if self.devices.contains_key(&device.id) {
            return Err(DeviceError::Conflict(format!(
                "device {} already registered",
                device.id
            )));
        }
        device.normalize_capabilities();
        device.status = DeviceStatus::Offline;
        device.created_at = Utc::now();

        self.store.insert_device(&device).await?;
        let device = Arc::new(device);
        match self.devices.entry(device.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                // Lost a race with a concurrent registration of the same id
                let _ = self.store.disable_device(&device.id).await;
                return Err(DeviceError::Conflict(format!(
                    "device {} already registered",
                    device.id
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(device.clone());
            }
        }

        let _ = self
            .event_sender
            .send(RegistryEvent::DeviceAdded(device.clone()));
        debug!(device_id = %device.id, protocol = %device.protocol, "registered device");
        Ok(device)
    }

    /// Soft-delete a device in the store and drop it from the cache
    pub async fn unregister(&self, id: &str) -> Result<Arc<Device>> {
        if !self.devices.contains_key(id) {
            return Err(DeviceError::not_found(format!("device {}", id)));
        }
        self.store.disable_device(id).await?;
        let (_, device) = self
            .devices
            .remove(id)
            .ok_or_else(|| DeviceError::not_found(format!("device {}", id)))?;

        let _ = self
            .event_sender
            .send(RegistryEvent::DeviceRemoved(id.to_string()));
        debug!(device_id = %id, "unregistered device");
        Ok(device)
    }

    /// Get a device by ID
    pub fn get(&self, id: &str) -> Option<Arc<Device>> {
        self.devices.get(id).map(|d| d.value().clone())
    }

    /// Get a device by ID or fail with not-found
    pub fn require(&self, id: &str) -> Result<Arc<Device>> {
        self.get(id)
            .ok_or_else(|| DeviceError::not_found(format!("device {}", id)))
    }

    /// Devices matching `filter`, oldest registration first
    pub fn list(&self, filter: &DeviceFilter) -> Vec<Arc<Device>> {
        let mut devices: Vec<Arc<Device>> = self
            .devices
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        devices.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        devices
    }

    /// Apply a partial update and persist it
    pub async fn update(&self, id: &str, update: DeviceUpdate) -> Result<Arc<Device>> {
        let mut device = Device::clone(&*self.require(id)?);
        device.apply(update);
        self.store.update_device(&device).await?;

        let device = Arc::new(device);
        self.devices.insert(id.to_string(), device.clone());
        let _ = self
            .event_sender
            .send(RegistryEvent::DeviceUpdated(device.clone()));
        Ok(device)
    }

    /// Record a status transition, refreshing last-seen when `seen` is set.
    ///
    /// Returns the previous status.
    pub async fn set_status(&self, id: &str, status: DeviceStatus, seen: bool) -> Result<DeviceStatus> {
        let current = self.require(id)?;
        let last_seen = seen.then(Utc::now);
        self.store.update_status(id, status, last_seen).await?;

        let old_status = current.status;
        let mut device = Device::clone(&*current);
        device.status = status;
        if last_seen.is_some() {
            device.last_seen = last_seen;
        }
        self.devices.insert(id.to_string(), Arc::new(device));

        if old_status != status {
            debug!(device_id = %id, from = %old_status, to = %status, "status changed");
            let _ = self.event_sender.send(RegistryEvent::StatusChanged {
                id: id.to_string(),
                old_status,
                new_status: status,
            });
        }
        Ok(old_status)
    }

    /// Whether a registered device carries this discovery id
    pub fn has_discovery_id(&self, discovery_id: &str) -> bool {
        self.devices.iter().any(|entry| {
            entry
                .metadata
                .get(DISCOVERED_ID_KEY)
                .and_then(|v| v.as_str())
                == Some(discovery_id)
        })
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Check if a device is registered
    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    /// Count registered devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no device is registered
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Shared registry handle
pub type SharedDeviceRegistry = Arc<DeviceRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use iotflow_core::device::{Capability, DeviceType, Protocol};
    use iotflow_core::store::{DeviceStore, MemoryStore};
    use serde_json::json;

    fn registry() -> (Arc<MemoryStore>, DeviceRegistry) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), DeviceRegistry::new(store))
    }

    #[tokio::test]
    async fn test_register_assigns_id_and_dedups_capabilities() {
        let (_, registry) = registry();
        let device = Device::new("Lamp", DeviceType::Light, Protocol::Zigbee)
            .with_capability(Capability::OnOff)
            .with_capability(Capability::Dimming)
            .with_capability(Capability::OnOff);
        let mut events = registry.subscribe();

        let device = registry.register(device).await.unwrap();
        assert!(!device.id.is_empty());
        assert_eq!(device.capabilities, vec![Capability::OnOff, Capability::Dimming]);
        assert!(matches!(events.recv().await.unwrap(), RegistryEvent::DeviceAdded(_)));
    }

    #[tokio::test]
    async fn test_duplicate_id_conflicts_and_leaves_registry_unchanged() {
        let (_, registry) = registry();
        let first = Device::new("A", DeviceType::Switch, Protocol::Mqtt).with_id("dup");
        let second = Device::new("B", DeviceType::Light, Protocol::Coap).with_id("dup");

        registry.register(first).await.unwrap();
        let err = registry.register(second).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("dup").unwrap().name, "A");
    }

    #[tokio::test]
    async fn test_unregister_soft_deletes() {
        let (store, registry) = registry();
        registry
            .register(Device::new("A", DeviceType::Sensor, Protocol::Lora).with_id("a"))
            .await
            .unwrap();
        registry.unregister("a").await.unwrap();
        assert!(!registry.contains("a"));
        assert!(store.load_devices().await.unwrap().is_empty());
        assert!(registry.unregister("a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_update_replaces_snapshot() {
        let (store, registry) = registry();
        registry
            .register(Device::new("A", DeviceType::Sensor, Protocol::Mqtt).with_id("a"))
            .await
            .unwrap();
        let before = registry.get("a").unwrap();

        let update = DeviceUpdate {
            room: Some("kitchen".into()),
            ..Default::default()
        };
        registry.update("a", update).await.unwrap();

        assert_eq!(before.room, None);
        assert_eq!(registry.get("a").unwrap().room.as_deref(), Some("kitchen"));
        assert_eq!(store.load_devices().await.unwrap()[0].room.as_deref(), Some("kitchen"));
    }

    #[tokio::test]
    async fn test_set_status_and_filters() {
        let (_, registry) = registry();
        registry
            .register(Device::new("A", DeviceType::Light, Protocol::Zigbee).with_id("a"))
            .await
            .unwrap();
        registry
            .register(Device::new("B", DeviceType::Lock, Protocol::Bluetooth).with_id("b"))
            .await
            .unwrap();

        let old = registry.set_status("a", DeviceStatus::Online, true).await.unwrap();
        assert_eq!(old, DeviceStatus::Offline);
        assert!(registry.get("a").unwrap().last_seen.is_some());

        let online = DeviceFilter {
            status: Some(DeviceStatus::Online),
            ..Default::default()
        };
        let ids: Vec<String> = registry.list(&online).iter().map(|d| d.id.clone()).collect();
        assert_eq!(ids, vec!["a".to_string()]);
        assert_eq!(registry.list(&DeviceFilter::default()).len(), 2);
    }

    #[tokio::test]
    async fn test_load_and_discovery_ids() {
        let (store, registry) = registry();
        let device = Device::new("Bulb", DeviceType::Light, Protocol::Zigbee)
            .with_id("bulb")
            .with_metadata(DISCOVERED_ID_KEY, json!("00:17:88:01"));
        store.insert_device(&device).await.unwrap();

        assert_eq!(registry.load().await.unwrap(), 1);
        assert!(registry.has_discovery_id("00:17:88:01"));
        assert!(!registry.has_discovery_id("ff:ff"));
    }
}
