/*!
 * Protocol adapter contract.
 *
 * Every wire protocol is reached through a [`ProtocolAdapter`]. The device
 * manager only ever talks to this trait; it picks the adapter for a device
 * from the [`AdapterTable`] built at startup.
 */
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use iotflow_core::device::{CommandResponse, Device, DeviceCommand, DeviceState, Protocol};
use iotflow_core::types::{as_number, Params, Value};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::discovery::{DiscoveredDevice, DiscoverySource};
use crate::error::Result;
use crate::protocols;
use crate::transport::SharedConnector;

/// Channel adapters hand inbound messages to
pub type InboundSender = mpsc::Sender<InboundMessage>;

/// Options passed to [`ProtocolAdapter::connect`]
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Deadline for opening the link
    pub timeout: Option<Duration>,
    /// Protocol-specific options, merged over the device attributes
    pub options: Params,
    /// Where inbound traffic of the session is forwarded
    pub inbound: Option<InboundSender>,
}

impl ConnectOptions {
    /// Empty options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connect deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add a protocol-specific option
    pub fn with_option<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Forward inbound traffic to `sender`
    pub fn with_inbound(mut self, sender: InboundSender) -> Self {
        self.inbound = Some(sender);
        self
    }

    /// Read a string option
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.options.get(key).and_then(|v| v.as_str()).map(str::to_string)
    }

    /// Read an integer option, accepting `0x` strings
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(|v| match v {
            Value::String(s) => iotflow_core::device::parse_int(s),
            other => other.as_u64(),
        })
    }

    /// Read a boolean option
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.options.get(key).and_then(Value::as_bool)
    }

    /// The connect deadline or `default`
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }
}

/// What an inbound message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundKind {
    /// Sensor readings
    Telemetry,
    /// A state report
    State,
    /// A device-originated event
    Event,
    /// Link or presence status
    Status,
    /// A command response nobody waited for
    Response,
    /// Anything else
    Other,
}

/// A message received from a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[allow(missing_docs)]
    pub device_id: String,
    #[allow(missing_docs)]
    pub protocol: Protocol,
    #[allow(missing_docs)]
    pub kind: InboundKind,
    /// Topic, path, characteristic or arbitration id the message arrived on
    pub topic: String,
    #[allow(missing_docs)]
    pub payload: Value,
    #[allow(missing_docs)]
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Stamp a message received now
    pub fn new<D: Into<String>, T: Into<String>>(
        device_id: D,
        protocol: Protocol,
        kind: InboundKind,
        topic: T,
        payload: Value,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            protocol,
            kind,
            topic: topic.into(),
            payload,
            received_at: Utc::now(),
        }
    }

    /// The payload as a JSON object, if it is one
    pub fn fields(&self) -> Option<&Params> {
        self.payload.as_object()
    }

    /// Numeric readings in the payload, `{"value": ..}` objects unwrapped
    pub fn readings(&self) -> Vec<(String, f64)> {
        let Some(fields) = self.fields() else {
            return Vec::new();
        };
        fields
            .iter()
            .filter_map(|(name, value)| {
                let reading = match value {
                    Value::Object(inner) => inner.get("value").and_then(as_number),
                    other => as_number(other),
                };
                reading.map(|v| (name.clone(), v))
            })
            .collect()
    }

    /// Whether this is a status message announcing the device went offline
    pub fn is_offline(&self) -> bool {
        self.kind == InboundKind::Status
            && self
                .payload
                .get("status")
                .and_then(Value::as_str)
                .map(|s| s == "offline")
                .unwrap_or(false)
    }
}

/// A live subscription. Messages matching the filter arrive on the
/// receiver until the subscription is removed or the session ends.
#[derive(Debug)]
pub struct Subscription {
    /// Identifier used with [`ProtocolAdapter::unsubscribe`]
    pub id: u64,
    #[allow(missing_docs)]
    pub device_id: String,
    #[allow(missing_docs)]
    pub filter: String,
    receiver: mpsc::Receiver<InboundMessage>,
}

impl Subscription {
    /// Wrap a receiver
    pub fn new<D: Into<String>, F: Into<String>>(
        id: u64,
        device_id: D,
        filter: F,
        receiver: mpsc::Receiver<InboundMessage>,
    ) -> Self {
        Self {
            id,
            device_id: device_id.into(),
            filter: filter.into(),
            receiver,
        }
    }

    /// Wait for the next matching message; `None` once the subscription ended
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.receiver.recv().await
    }

    /// Take a message if one is queued
    pub fn try_recv(&mut self) -> Option<InboundMessage> {
        self.receiver.try_recv().ok()
    }
}

/// Uniform contract implemented once per protocol
#[async_trait]
pub trait ProtocolAdapter: Send + Sync + Debug {
    /// Protocol served by this adapter
    fn protocol(&self) -> Protocol;

    /// Open a session. Returns `Ok(true)` when a session exists afterwards,
    /// including when one already existed. Nothing is left behind on error.
    async fn connect(&self, device: &Device, options: ConnectOptions) -> Result<bool>;

    /// Close a session. Returns `Ok(false)` when there was none.
    async fn disconnect(&self, device_id: &str) -> Result<bool>;

    /// Whether a session exists
    async fn is_connected(&self, device_id: &str) -> bool;

    /// Deliver a command. Request/response protocols wait for the
    /// correlated response up to `command.timeout`; fire-and-forget
    /// protocols return once the frame is on the link.
    async fn send_command(&self, device_id: &str, command: DeviceCommand)
        -> Result<CommandResponse>;

    /// Current device state as reported by the device or last observed
    async fn read_state(&self, device_id: &str) -> Result<DeviceState>;

    /// Subscribe to inbound messages matching `filter`
    async fn subscribe(&self, device_id: &str, filter: &str) -> Result<Subscription>;

    /// Remove a subscription. Returns `Ok(false)` when it did not exist.
    async fn unsubscribe(&self, device_id: &str, subscription_id: u64) -> Result<bool>;

    /// Liveness check used by health checks
    async fn ping(&self, device_id: &str) -> Result<bool>;

    /// Look for devices not yet known
    async fn discover(&self, _timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
        Ok(Vec::new())
    }
}

/// Shared adapter handle
pub type SharedAdapter = Arc<dyn ProtocolAdapter>;

/// Static protocol → adapter mapping built at startup
#[derive(Debug, Clone, Default)]
pub struct AdapterTable {
    adapters: HashMap<Protocol, SharedAdapter>,
}

impl AdapterTable {
    /// An empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in adapter of every protocol, all opening links through
    /// `connector`
    pub fn builtin(connector: SharedConnector) -> Self {
        Self::from_adapters(protocols::builtin_adapters(connector, None))
    }

    /// Like [`builtin`](Self::builtin), with `source` answering discovery
    pub fn builtin_with_discovery(
        connector: SharedConnector,
        source: Arc<dyn DiscoverySource>,
    ) -> Self {
        Self::from_adapters(protocols::builtin_adapters(connector, Some(source)))
    }

    fn from_adapters(adapters: Vec<SharedAdapter>) -> Self {
        let mut table = Self::new();
        for adapter in adapters {
            table.adapters.insert(adapter.protocol(), adapter);
        }
        table
    }

    /// Insert or replace the adapter of its protocol
    pub fn with_adapter(mut self, adapter: SharedAdapter) -> Self {
        self.adapters.insert(adapter.protocol(), adapter);
        self
    }

    /// Adapter for `protocol`
    pub fn get(&self, protocol: Protocol) -> Option<SharedAdapter> {
        self.adapters.get(&protocol).cloned()
    }

    /// Protocols with an adapter
    pub fn protocols(&self) -> Vec<Protocol> {
        let mut protocols: Vec<Protocol> = self.adapters.keys().copied().collect();
        protocols.sort();
        protocols
    }

    /// Number of adapters
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Whether the table has no adapter
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
