/*!
 * Device events and the in-process event bus.
 *
 * Events are appended to the store by their producer and then published on
 * an [`EventBus`], which keeps one broadcast channel per payload type so
 * that device events, inbound messages and engine notifications travel on
 * independent channels.
 */
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::{Error, Result};
use crate::types::{DeviceId, Params, Value};

/// Maximum number of events buffered per channel before slow receivers lag
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Well-known event types
pub mod kinds {
    /// A device session was established
    pub const CONNECTED: &str = "connected";
    /// A device session was closed
    pub const DISCONNECTED: &str = "disconnected";
    /// A discovery scan found an unknown device
    pub const DEVICE_DISCOVERED: &str = "device_discovered";
    /// A connected device stopped answering pings
    pub const HEALTH_CHECK_FAILED: &str = "health_check_failed";
    /// A telemetry detector flagged a sample
    pub const ANOMALY_DETECTED: &str = "anomaly_detected";
}

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[allow(missing_docs)]
    Info,
    #[allow(missing_docs)]
    Warning,
    #[allow(missing_docs)]
    Error,
    #[allow(missing_docs)]
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Info
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Something that happened to a device. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEvent {
    /// Source device, or a pseudo-source such as `discovery`
    pub device_id: DeviceId,
    /// Event type tag, see [`kinds`]
    pub event_type: String,
    /// Event payload
    #[serde(default)]
    pub data: Params,
    #[allow(missing_docs)]
    pub timestamp: DateTime<Utc>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub severity: Severity,
}

impl DeviceEvent {
    /// Create an informational event stamped now
    pub fn new<D: Into<String>, T: Into<String>>(device_id: D, event_type: T) -> Self {
        Self {
            device_id: device_id.into(),
            event_type: event_type.into(),
            data: Params::new(),
            timestamp: Utc::now(),
            severity: Severity::Info,
        }
    }

    /// Set the severity
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Set a payload field
    pub fn with_data<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Replace the payload
    pub fn with_payload(mut self, data: Params) -> Self {
        self.data = data;
        self
    }

    /// Whether the event has the given type
    pub fn is(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }
}

/// Typed publish/subscribe bus backed by one broadcast channel per type
pub struct EventBus {
    channels: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    capacity: usize,
}

impl Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create a bus with the default per-channel capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus with a specific per-channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender<T: Clone + Send + Sync + 'static>(&self) -> Result<broadcast::Sender<T>> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| Error::event("event bus lock poisoned"))?;
        let entry = channels
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(broadcast::channel::<T>(self.capacity).0));
        entry
            .downcast_ref::<broadcast::Sender<T>>()
            .cloned()
            .ok_or_else(|| Error::event("event channel type mismatch"))
    }

    /// Publish a value to every current subscriber of its type.
    ///
    /// Returns the number of receivers reached; publishing with no
    /// subscribers is not an error.
    pub fn publish<T: Clone + Send + Sync + 'static>(&self, event: T) -> Result<usize> {
        let sender = self.sender::<T>()?;
        match sender.send(event) {
            Ok(n) => {
                trace!(receivers = n, "event published");
                Ok(n)
            }
            Err(_) => Ok(0),
        }
    }

    /// Subscribe to values of type `T`
    pub fn subscribe<T: Clone + Send + Sync + 'static>(&self) -> Result<broadcast::Receiver<T>> {
        Ok(self.sender::<T>()?.subscribe())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to an event bus
pub type SharedEventBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq)]
    struct Ping(u32);

    #[tokio::test]
    async fn test_publish_subscribe() -> Result<()> {
        let bus = EventBus::new();
        let mut rx = bus.subscribe::<DeviceEvent>()?;

        let event = DeviceEvent::new("lamp-1", kinds::CONNECTED).with_data("protocol", json!("zigbee"));
        assert_eq!(bus.publish(event.clone())?, 1);

        let received = rx.recv().await.map_err(|e| Error::event(e.to_string()))?;
        assert_eq!(received, event);
        assert_eq!(received.severity, Severity::Info);
        Ok(())
    }

    #[tokio::test]
    async fn test_types_use_separate_channels() -> Result<()> {
        let bus = EventBus::new();
        let mut events = bus.subscribe::<DeviceEvent>()?;
        let mut pings = bus.subscribe::<Ping>()?;

        bus.publish(Ping(7))?;
        assert_eq!(pings.recv().await.map_err(|e| Error::event(e.to_string()))?, Ping(7));
        assert!(events.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(Ping(1)).unwrap(), 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = DeviceEvent::new("sensor-1", kinds::ANOMALY_DETECTED)
            .with_severity(Severity::Warning);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["severity"], json!("warning"));
        assert_eq!(value["event_type"], json!("anomaly_detected"));
    }
}
