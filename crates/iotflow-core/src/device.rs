/*!
 * Device data model.
 *
 * Records describing registered devices, their live state, the commands
 * sent to them and the groups and scenes they take part in.
 */
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::Error;
use crate::types::{as_number, as_switch, new_id, DeviceId, Params, Value};

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[allow(missing_docs)]
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            /// Every variant, in declaration order
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Wire name of the variant
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::invalid(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

string_enum!(
    /// Wire protocol a device speaks
    Protocol {
        Mqtt => "mqtt",
        Coap => "coap",
        Modbus => "modbus",
        Bluetooth => "bluetooth",
        Zigbee => "zigbee",
        Lora => "lora",
        WebSocket => "websocket",
        Http => "http",
        CanBus => "can_bus",
        Obd2 => "obd2",
    }
);

string_enum!(
    /// Kind of physical or virtual device
    DeviceType {
        Light => "light",
        Switch => "switch",
        Thermostat => "thermostat",
        Lock => "lock",
        Camera => "camera",
        Sensor => "sensor",
        Speaker => "speaker",
        Display => "display",
        Appliance => "appliance",
        Vehicle => "vehicle",
        Plc => "plc",
        Gateway => "gateway",
        Wearable => "wearable",
        Custom => "custom",
    }
);

string_enum!(
    /// Connection status, driven by the device manager
    DeviceStatus {
        Offline => "offline",
        Connecting => "connecting",
        Online => "online",
        Error => "error",
        Updating => "updating",
        Sleeping => "sleeping",
    }
);

string_enum!(
    /// A feature a device declares support for
    Capability {
        OnOff => "on_off",
        Dimming => "dimming",
        ColorControl => "color_control",
        TemperatureControl => "temperature_control",
        LockUnlock => "lock_unlock",
        MotionSensing => "motion_sensing",
        TemperatureSensing => "temperature_sensing",
        HumiditySensing => "humidity_sensing",
        LightSensing => "light_sensing",
        AudioPlayback => "audio_playback",
        VideoStreaming => "video_streaming",
        EnergyMonitoring => "energy_monitoring",
        PowerControl => "power_control",
        VehicleDiagnostics => "vehicle_diagnostics",
        RemoteStart => "remote_start",
        LocationTracking => "location_tracking",
        ClimateControl => "climate_control",
    }
);

string_enum!(
    /// Command priority
    Priority {
        Low => "low",
        Normal => "normal",
        High => "high",
        Critical => "critical",
    }
);

impl Default for DeviceStatus {
    fn default() -> Self {
        DeviceStatus::Offline
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Credential material handed to adapters. Opaque to the core.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    /// Bearer or session token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mask = |v: &Option<String>| v.as_ref().map(|_| "***");
        f.debug_struct("Credentials")
            .field("token", &mask(&self.token))
            .field("api_key", &mask(&self.api_key))
            .field("username", &self.username)
            .field("password", &mask(&self.password))
            .finish()
    }
}

/// A registered device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Stable identifier; assigned on registration when empty
    #[serde(default)]
    pub id: DeviceId,
    /// Display name
    pub name: String,
    /// Device kind
    pub device_type: DeviceType,
    /// Wire protocol
    pub protocol: Protocol,
    #[allow(missing_docs)]
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub model: Option<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub hardware_version: Option<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub serial_number: Option<String>,
    /// Network address (host, bus address, MAC, ...)
    #[serde(default)]
    pub address: Option<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub mac_address: Option<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub port: Option<u16>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub credentials: Credentials,
    /// Declared capabilities, in declaration order without duplicates
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Protocol specific attributes (register maps, characteristic ids, ...)
    #[serde(default)]
    pub attributes: Params,
    #[allow(missing_docs)]
    #[serde(default)]
    pub metadata: Params,
    #[allow(missing_docs)]
    #[serde(default)]
    pub location: Option<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub room: Option<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub groups: Vec<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub tags: Vec<String>,
    /// Current connection status
    #[serde(default)]
    pub status: DeviceStatus,
    /// Connect automatically when the manager starts
    #[serde(default)]
    pub auto_connect: bool,
    #[allow(missing_docs)]
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl Device {
    /// Create a device descriptor with an empty id
    pub fn new<S: Into<String>>(name: S, device_type: DeviceType, protocol: Protocol) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            device_type,
            protocol,
            manufacturer: None,
            model: None,
            firmware_version: None,
            hardware_version: None,
            serial_number: None,
            address: None,
            mac_address: None,
            port: None,
            credentials: Credentials::default(),
            capabilities: Vec::new(),
            attributes: Params::new(),
            metadata: Params::new(),
            location: None,
            room: None,
            groups: Vec::new(),
            tags: Vec::new(),
            status: DeviceStatus::Offline,
            auto_connect: false,
            created_at: Utc::now(),
            last_seen: None,
            last_updated: None,
        }
    }

    /// Set the id
    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = id.into();
        self
    }

    /// Set the network address and optional port
    pub fn with_address<S: Into<String>>(mut self, address: S, port: Option<u16>) -> Self {
        self.address = Some(address.into());
        self.port = port;
        self
    }

    /// Add a capability, ignoring duplicates
    pub fn with_capability(mut self, capability: Capability) -> Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    /// Set an attribute
    pub fn with_attribute<S: Into<String>>(mut self, key: S, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Set a metadata entry
    pub fn with_metadata<S: Into<String>>(mut self, key: S, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Set the room
    pub fn with_room<S: Into<String>>(mut self, room: S) -> Self {
        self.room = Some(room.into());
        self
    }

    /// Whether the device declares the capability
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Read an attribute as a string
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    /// Read an attribute as an unsigned integer
    pub fn attribute_u64(&self, key: &str) -> Option<u64> {
        self.attributes.get(key).and_then(|v| match v {
            Value::String(s) => parse_int(s),
            other => other.as_u64(),
        })
    }

    /// Drop duplicate capabilities while keeping the first occurrence order
    pub fn normalize_capabilities(&mut self) {
        let mut seen = Vec::with_capacity(self.capabilities.len());
        self.capabilities.retain(|c| {
            if seen.contains(c) {
                false
            } else {
                seen.push(*c);
                true
            }
        });
    }

    /// Apply a partial update, stamping `last_updated`
    pub fn apply(&mut self, update: DeviceUpdate) {
        let DeviceUpdate {
            name,
            firmware_version,
            address,
            port,
            credentials,
            capabilities,
            attributes,
            metadata,
            location,
            room,
            groups,
            tags,
            auto_connect,
        } = update;

        if let Some(v) = name {
            self.name = v;
        }
        if let Some(v) = firmware_version {
            self.firmware_version = Some(v);
        }
        if let Some(v) = address {
            self.address = Some(v);
        }
        if let Some(v) = port {
            self.port = Some(v);
        }
        if let Some(v) = credentials {
            self.credentials = v;
        }
        if let Some(v) = capabilities {
            self.capabilities = v;
            self.normalize_capabilities();
        }
        if let Some(v) = attributes {
            self.attributes.extend(v);
        }
        if let Some(v) = metadata {
            self.metadata.extend(v);
        }
        if let Some(v) = location {
            self.location = Some(v);
        }
        if let Some(v) = room {
            self.room = Some(v);
        }
        if let Some(v) = groups {
            self.groups = v;
        }
        if let Some(v) = tags {
            self.tags = v;
        }
        if let Some(v) = auto_connect {
            self.auto_connect = v;
        }
        self.last_updated = Some(Utc::now());
    }
}

/// Parse decimal or `0x` prefixed hexadecimal integers
pub fn parse_int(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// Partial update of a device record. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct DeviceUpdate {
    pub name: Option<String>,
    pub firmware_version: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub credentials: Option<Credentials>,
    pub capabilities: Option<Vec<Capability>>,
    pub attributes: Option<Params>,
    pub metadata: Option<Params>,
    pub location: Option<String>,
    pub room: Option<String>,
    pub groups: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub auto_connect: Option<bool>,
}

/// Criteria for listing devices. Every set field must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct DeviceFilter {
    pub device_type: Option<DeviceType>,
    pub protocol: Option<Protocol>,
    pub status: Option<DeviceStatus>,
    pub location: Option<String>,
    pub room: Option<String>,
    pub group: Option<String>,
    pub tag: Option<String>,
    pub capability: Option<Capability>,
}

impl DeviceFilter {
    /// Whether the device satisfies the filter
    pub fn matches(&self, device: &Device) -> bool {
        self.device_type.map_or(true, |t| device.device_type == t)
            && self.protocol.map_or(true, |p| device.protocol == p)
            && self.status.map_or(true, |s| device.status == s)
            && self
                .location
                .as_ref()
                .map_or(true, |l| device.location.as_ref() == Some(l))
            && self
                .room
                .as_ref()
                .map_or(true, |r| device.room.as_ref() == Some(r))
            && self.group.as_ref().map_or(true, |g| device.groups.contains(g))
            && self.tag.as_ref().map_or(true, |t| device.tags.contains(t))
            && self.capability.map_or(true, |c| device.has_capability(c))
    }
}

/// Latest known live state of a device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Whether the device answered recently
    #[serde(default)]
    pub online: bool,
    /// Generic key/value state not covered by the named fields
    #[serde(default)]
    pub state: Params,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<bool>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<i64>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<f64>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<f64>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub armed: Option<bool>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playing: Option<bool>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<i64>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    /// Latest sensor readings by metric name
    #[serde(default)]
    pub sensor_data: std::collections::BTreeMap<String, f64>,
    /// When this snapshot was last modified
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl DeviceState {
    /// An empty state stamped now
    pub fn new() -> Self {
        Self {
            updated_at: Utc::now(),
            ..Default::default()
        }
    }

    /// Look up an attribute: named fields first, then the state bag, then
    /// sensor readings.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        let named = match name {
            "online" => Some(json!(self.online)),
            "power" => self.power.map(|v| json!(v)),
            "brightness" => self.brightness.map(|v| json!(v)),
            "color" => self.color.as_ref().map(|v| json!(v)),
            "temperature" => self.temperature.map(|v| json!(v)),
            "humidity" => self.humidity.map(|v| json!(v)),
            "battery_level" => self.battery_level.map(|v| json!(v)),
            "signal_strength" => self.signal_strength.map(|v| json!(v)),
            "locked" => self.locked.map(|v| json!(v)),
            "armed" => self.armed.map(|v| json!(v)),
            "playing" => self.playing.map(|v| json!(v)),
            "volume" => self.volume.map(|v| json!(v)),
            "muted" => self.muted.map(|v| json!(v)),
            _ => None,
        };
        named
            .or_else(|| self.state.get(name).cloned())
            .or_else(|| self.sensor_data.get(name).map(|v| json!(v)))
    }

    /// Write an attribute. Known names update the named field when the
    /// value has the right shape; anything else lands in the state bag.
    pub fn set_attribute(&mut self, name: &str, value: Value) {
        let stored = match name {
            "online" => as_switch(&value).map(|v| self.online = v).is_some(),
            "power" => as_switch(&value).map(|v| self.power = Some(v)).is_some(),
            "brightness" => as_number(&value)
                .map(|v| self.brightness = Some(v.round() as i64))
                .is_some(),
            "color" => match &value {
                Value::String(s) => {
                    self.color = Some(s.clone());
                    true
                }
                _ => false,
            },
            "temperature" => as_number(&value).map(|v| self.temperature = Some(v)).is_some(),
            "humidity" => as_number(&value).map(|v| self.humidity = Some(v)).is_some(),
            "battery_level" => as_number(&value).map(|v| self.battery_level = Some(v)).is_some(),
            "signal_strength" => as_number(&value)
                .map(|v| self.signal_strength = Some(v))
                .is_some(),
            "locked" => as_switch(&value).map(|v| self.locked = Some(v)).is_some(),
            "armed" => as_switch(&value).map(|v| self.armed = Some(v)).is_some(),
            "playing" => as_switch(&value).map(|v| self.playing = Some(v)).is_some(),
            "volume" => as_number(&value)
                .map(|v| self.volume = Some(v.round() as i64))
                .is_some(),
            "muted" => as_switch(&value).map(|v| self.muted = Some(v)).is_some(),
            _ => false,
        };
        if !stored {
            self.state.insert(name.to_string(), value);
        }
        self.updated_at = Utc::now();
    }

    /// Merge a JSON object reported by a device into this snapshot
    pub fn merge_report(&mut self, report: &Params) {
        for (key, value) in report {
            match (key.as_str(), value) {
                ("sensor_data", Value::Object(readings)) => {
                    for (metric, reading) in readings {
                        if let Some(v) = as_number(reading) {
                            self.sensor_data.insert(metric.clone(), v);
                        }
                    }
                }
                ("state", Value::Object(bag)) => {
                    for (k, v) in bag {
                        self.state.insert(k.clone(), v.clone());
                    }
                }
                _ => self.set_attribute(key, value.clone()),
            }
        }
        self.online = true;
        self.updated_at = Utc::now();
    }

    /// Record a sensor reading, mirroring well-known metrics into the
    /// named fields.
    pub fn record_metric(&mut self, metric: &str, value: f64) {
        self.sensor_data.insert(metric.to_string(), value);
        match metric {
            "temperature" => self.temperature = Some(value),
            "humidity" => self.humidity = Some(value),
            "battery_level" | "battery" => self.battery_level = Some(value),
            "signal_strength" | "rssi" => self.signal_strength = Some(value),
            "power" => self.power = Some(value > 0.0),
            "brightness" => self.brightness = Some(value.round() as i64),
            _ => {}
        }
        self.updated_at = Utc::now();
    }
}

/// A command addressed to one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    /// Correlation identifier
    pub command_id: String,
    /// Command name, e.g. `turn_on`
    pub command: String,
    /// Command parameters
    #[serde(default)]
    pub parameters: Params,
    /// Device the command is addressed to
    pub target_device: DeviceId,
    #[allow(missing_docs)]
    #[serde(default)]
    pub priority: Priority,
    /// How long to wait for a correlated response
    #[serde(with = "duration_secs", default = "default_command_timeout")]
    pub timeout: Duration,
    /// Whether the device must confirm execution
    #[serde(default)]
    pub requires_confirmation: bool,
    /// When the command was issued
    #[serde(default = "Utc::now")]
    pub issued_at: DateTime<Utc>,
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(30)
}

impl DeviceCommand {
    /// Issue a new command with a fresh correlation id
    pub fn new<D: Into<String>, C: Into<String>>(target_device: D, command: C) -> Self {
        Self {
            command_id: new_id(),
            command: command.into(),
            parameters: Params::new(),
            target_device: target_device.into(),
            priority: Priority::Normal,
            timeout: default_command_timeout(),
            requires_confirmation: false,
            issued_at: Utc::now(),
        }
    }

    /// Set the parameters
    pub fn with_parameters(mut self, parameters: Params) -> Self {
        self.parameters = parameters;
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the response timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Read a parameter
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    /// Read a numeric parameter
    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.parameters.get(key).and_then(as_number)
    }

    /// Read an integer parameter, accepting `0x` strings
    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(|v| match v {
            Value::String(s) => parse_int(s),
            other => other.as_u64().or_else(|| other.as_f64().map(|f| f as u64)),
        })
    }

    /// The JSON envelope carried over bus and stream protocols
    pub fn envelope(&self) -> Value {
        json!({
            "command_id": self.command_id,
            "command": self.command,
            "parameters": self.parameters,
            "timestamp": self.issued_at.to_rfc3339(),
        })
    }
}

/// Outcome reported in a response envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    /// Command executed
    Ok,
    /// Device rejected or failed the command
    Error,
}

/// Response envelope correlated to a command by `command_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    #[allow(missing_docs)]
    pub command_id: String,
    #[allow(missing_docs)]
    pub status: ResponseStatus,
    #[allow(missing_docs)]
    #[serde(default)]
    pub result: Value,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResponse {
    /// A successful response
    pub fn ok<S: Into<String>>(command_id: S, result: Value) -> Self {
        Self {
            command_id: command_id.into(),
            status: ResponseStatus::Ok,
            result,
            error: None,
        }
    }

    /// A failed response
    pub fn error<S: Into<String>, E: Into<String>>(command_id: S, error: E) -> Self {
        Self {
            command_id: command_id.into(),
            status: ResponseStatus::Error,
            result: Value::Null,
            error: Some(error.into()),
        }
    }

    /// Whether the device reported success
    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

/// A named set of devices used for fan-out control
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceGroup {
    #[allow(missing_docs)]
    pub id: String,
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    #[serde(default)]
    pub description: Option<String>,
    /// Member device ids
    pub devices: Vec<DeviceId>,
    /// Optional classification (room, zone, category)
    #[serde(default)]
    pub group_type: Option<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub metadata: Params,
}

impl DeviceGroup {
    /// Create a group with a fresh id
    pub fn new<S: Into<String>>(name: S, devices: Vec<DeviceId>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            description: None,
            devices,
            group_type: None,
            metadata: Params::new(),
        }
    }
}

/// A named snapshot of desired states across devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    #[allow(missing_docs)]
    pub id: String,
    #[allow(missing_docs)]
    pub name: String,
    /// Desired state per device
    pub devices: std::collections::BTreeMap<DeviceId, Params>,
    #[allow(missing_docs)]
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Scene {
    /// Create a scene with a fresh id
    pub fn new<S: Into<String>>(
        name: S,
        devices: std::collections::BTreeMap<DeviceId, Params>,
    ) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            devices,
            created_at: Utc::now(),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("timeout must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;

    #[test]
    fn test_enum_wire_names() {
        assert_eq!(Protocol::CanBus.as_str(), "can_bus");
        assert_eq!("obd2".parse::<Protocol>().unwrap(), Protocol::Obd2);
        assert!("carrier_pigeon".parse::<Protocol>().is_err());
        assert_eq!(
            serde_json::to_value(Capability::LockUnlock).unwrap(),
            json!("lock_unlock")
        );
        assert_eq!(Protocol::ALL.len(), 10);
    }

    #[test]
    fn test_capabilities_keep_order_without_duplicates() {
        let mut device = Device::new("lamp", DeviceType::Light, Protocol::Zigbee)
            .with_capability(Capability::OnOff)
            .with_capability(Capability::Dimming)
            .with_capability(Capability::OnOff);
        assert_eq!(device.capabilities, vec![Capability::OnOff, Capability::Dimming]);

        device.capabilities.push(Capability::Dimming);
        device.normalize_capabilities();
        assert_eq!(device.capabilities, vec![Capability::OnOff, Capability::Dimming]);
    }

    #[test]
    fn test_device_filter() {
        let mut device = Device::new("lamp", DeviceType::Light, Protocol::Zigbee)
            .with_capability(Capability::Dimming)
            .with_room("kitchen");
        device.tags.push("ceiling".into());

        let filter = DeviceFilter {
            room: Some("kitchen".into()),
            capability: Some(Capability::Dimming),
            ..Default::default()
        };
        assert!(filter.matches(&device));

        let filter = DeviceFilter {
            tag: Some("floor".into()),
            ..Default::default()
        };
        assert!(!filter.matches(&device));
    }

    #[test]
    fn test_apply_update() {
        let mut device = Device::new("lamp", DeviceType::Light, Protocol::Zigbee);
        device.apply(DeviceUpdate {
            name: Some("desk lamp".into()),
            attributes: Some(params! { "endpoint" => 11 }),
            ..Default::default()
        });
        assert_eq!(device.name, "desk lamp");
        assert_eq!(device.attribute_u64("endpoint"), Some(11));
        assert!(device.last_updated.is_some());
    }

    #[test]
    fn test_state_attributes() {
        let mut state = DeviceState::new();
        state.set_attribute("power", json!("on"));
        state.set_attribute("brightness", json!(42.4));
        state.set_attribute("target_temperature", json!(21.5));
        state.record_metric("co2", 412.0);

        assert_eq!(state.power, Some(true));
        assert_eq!(state.brightness, Some(42));
        assert_eq!(state.attribute("target_temperature"), Some(json!(21.5)));
        assert_eq!(state.attribute("co2"), Some(json!(412.0)));
        assert_eq!(state.attribute("missing"), None);
    }

    #[test]
    fn test_merge_report() {
        let mut state = DeviceState::new();
        state.merge_report(&params! {
            "temperature" => 22.5,
            "locked" => true,
            "sensor_data" => json!({ "lux": 300 }),
            "mode" => "eco",
        });
        assert!(state.online);
        assert_eq!(state.temperature, Some(22.5));
        assert_eq!(state.locked, Some(true));
        assert_eq!(state.sensor_data.get("lux"), Some(&300.0));
        assert_eq!(state.state.get("mode"), Some(&json!("eco")));
    }

    #[test]
    fn test_command_envelope() {
        let cmd = DeviceCommand::new("dev-1", "set_brightness")
            .with_parameters(params! { "level" => 70 });
        let envelope = cmd.envelope();
        assert_eq!(envelope["command_id"], json!(cmd.command_id));
        assert_eq!(envelope["command"], json!("set_brightness"));
        assert_eq!(envelope["parameters"]["level"], json!(70));
        assert!(envelope["timestamp"].is_string());
    }

    #[test]
    fn test_command_response_parse() {
        let response: CommandResponse = serde_json::from_value(json!({
            "command_id": "abc",
            "status": "error",
            "error": "busy"
        }))
        .unwrap();
        assert!(!response.is_ok());
        assert_eq!(response.error.as_deref(), Some("busy"));
        assert_eq!(response.result, Value::Null);
    }

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int("0x7DF"), Some(0x7df));
        assert_eq!(parse_int("502"), Some(502));
        assert_eq!(parse_int("zz"), None);
    }

    #[test]
    fn test_credentials_are_masked() {
        let creds = Credentials {
            password: Some("hunter2".into()),
            ..Default::default()
        };
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}
