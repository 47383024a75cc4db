/*!
 * CAN bus adapter.
 *
 * Frames travel through a bus bridge as fixed 13-byte records: the
 * arbitration id (bit 31 marks an extended id), the data length and eight
 * data bytes. CAN has no request/response pairing, so commands are sent
 * without confirmation. Subscriptions filter on arbitration ids written
 * as `id` or `id/mask`.
 *
 * Named signals can be declared in the `signals` device attribute:
 *
 * ```json
 * {"coolant": {"id": "0x3E0", "start": 2, "length": 1, "scale": 1.0, "offset": -40}}
 * ```
 */
use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use iotflow_core::device::{parse_int, Device, DeviceCommand, Protocol};
use iotflow_core::types::{Params, Value};
use serde::Deserialize;
use serde_json::json;

use crate::adapter::{ConnectOptions, InboundKind, InboundMessage};
use crate::error::{DeviceError, Result};
use crate::framed::{Decoded, Dialect, Outgoing};
use crate::topic;
use crate::transport::{Framing, Wire};

use super::{decode_hex, encode_hex};

/// Size of a bridged frame
pub const FRAME_LEN: usize = 13;
/// Flag bit for 29-bit identifiers
pub const EXTENDED_FLAG: u32 = 1 << 31;
const STANDARD_MASK: u32 = 0x7FF;
const EXTENDED_MASK: u32 = 0x1FFF_FFFF;

/// One CAN frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// Arbitration id without the extended flag
    pub id: u32,
    #[allow(missing_docs)]
    pub extended: bool,
    /// Up to eight data bytes
    pub data: Vec<u8>,
}

impl CanFrame {
    /// A standard-id frame
    pub fn new(id: u32, data: &[u8]) -> std::result::Result<Self, String> {
        Self::with_extended(id, false, data)
    }

    /// A frame with an explicit id format
    pub fn with_extended(id: u32, extended: bool, data: &[u8]) -> std::result::Result<Self, String> {
        let limit = if extended { EXTENDED_MASK } else { STANDARD_MASK };
        if id > limit {
            return Err(format!("id {:#X} does not fit the id format", id));
        }
        if data.len() > 8 {
            return Err(format!("{} data bytes, at most 8 allowed", data.len()));
        }
        Ok(Self {
            id,
            extended,
            data: data.to_vec(),
        })
    }

    /// Serialize to the 13-byte bridge record
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_LEN);
        let raw = if self.extended {
            self.id | EXTENDED_FLAG
        } else {
            self.id
        };
        buf.put_u32(raw);
        buf.put_u8(self.data.len() as u8);
        buf.put_slice(&self.data);
        buf.put_bytes(0, 8 - self.data.len());
        buf.freeze()
    }

    /// Parse a bridge record
    pub fn decode(frame: &[u8]) -> std::result::Result<Self, String> {
        if frame.len() != FRAME_LEN {
            return Err(format!("CAN record of {} bytes, expected {}", frame.len(), FRAME_LEN));
        }
        let raw = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let dlc = frame[4] as usize;
        if dlc > 8 {
            return Err(format!("data length {} exceeds 8", dlc));
        }
        Ok(Self {
            id: raw & EXTENDED_MASK,
            extended: raw & EXTENDED_FLAG != 0,
            data: frame[5..5 + dlc].to_vec(),
        })
    }

    /// The id in hex, used as topic and filter key
    pub fn topic(&self) -> String {
        format!("0x{:03X}", self.id)
    }
}

/// An `id` or `id/mask` acceptance filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdFilter {
    #[allow(missing_docs)]
    pub id: u32,
    #[allow(missing_docs)]
    pub mask: u32,
}

impl IdFilter {
    /// Parse `0x123`, `291` or `0x120/0x7F0`
    pub fn parse(text: &str) -> Option<Self> {
        let (id, mask) = match text.split_once('/') {
            Some((id, mask)) => (id, Some(mask)),
            None => (text, None),
        };
        let id = u32::try_from(parse_int(id)?).ok()?;
        let mask = match mask {
            Some(mask) => u32::try_from(parse_int(mask)?).ok()?,
            None => EXTENDED_MASK,
        };
        Some(Self { id, mask })
    }

    /// Whether a frame id passes the filter
    pub fn accepts(&self, id: u32) -> bool {
        id & self.mask == self.id & self.mask
    }
}

/// A named value carried inside frames with one id
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Signal {
    #[serde(deserialize_with = "deserialize_id")]
    #[allow(missing_docs)]
    pub id: u32,
    /// First data byte
    pub start: usize,
    /// Width in bytes, 1 to 4
    #[serde(default = "default_length")]
    pub length: usize,
    #[serde(default = "default_scale")]
    #[allow(missing_docs)]
    pub scale: f64,
    #[serde(default)]
    #[allow(missing_docs)]
    pub offset: f64,
    /// Byte order; big-endian unless set
    #[serde(default)]
    pub little_endian: bool,
}

fn default_length() -> usize {
    1
}

fn default_scale() -> f64 {
    1.0
}

fn deserialize_id<'de, D: serde::Deserializer<'de>>(d: D) -> std::result::Result<u32, D::Error> {
    let value = Value::deserialize(d)?;
    let id = match &value {
        Value::String(s) => parse_int(s),
        other => other.as_u64(),
    };
    id.and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| serde::de::Error::custom(format!("invalid CAN id {}", value)))
}

impl Signal {
    /// Extract the scaled value from a frame
    pub fn extract(&self, frame: &CanFrame) -> Option<f64> {
        if frame.id != self.id || self.length == 0 || self.length > 4 {
            return None;
        }
        let bytes = frame.data.get(self.start..self.start + self.length)?;
        let raw = if self.little_endian {
            bytes.iter().rev().fold(0u32, |acc, b| (acc << 8) | *b as u32)
        } else {
            bytes.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32)
        };
        Some(raw as f64 * self.scale + self.offset)
    }
}

/// Raw bus dialect
#[derive(Debug, Default)]
pub struct CanDialect;

/// Declared signals of one device
#[derive(Debug)]
pub struct CanSession {
    device_id: String,
    signals: BTreeMap<String, Signal>,
}

fn parse_signals(device: &Device) -> Result<BTreeMap<String, Signal>> {
    match device.attributes.get("signals") {
        None => Ok(BTreeMap::new()),
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
            DeviceError::connection(&device.id, format!("invalid signal table: {}", e))
        }),
    }
}

impl Dialect for CanDialect {
    type Session = CanSession;

    fn protocol(&self) -> Protocol {
        Protocol::CanBus
    }

    fn wire(&self, _session: &CanSession) -> Wire {
        Wire::Stream(Framing::CanFrame)
    }

    fn default_port(&self) -> u16 {
        29536
    }

    fn open(&self, device: &Device, _options: &ConnectOptions) -> Result<CanSession> {
        Ok(CanSession {
            device_id: device.id.clone(),
            signals: parse_signals(device)?,
        })
    }

    fn encode_command(&self, _session: &CanSession, command: &DeviceCommand) -> Result<Outgoing> {
        let invalid = |reason: &str| DeviceError::invalid_command(&command.command, reason);
        if command.command != "send_frame" {
            return Err(invalid("only 'send_frame' is supported on a raw bus"));
        }
        let id = command
            .param_u64("id")
            .and_then(|id| u32::try_from(id).ok())
            .ok_or_else(|| invalid("'id' is required"))?;
        let data = match command.param("data").and_then(Value::as_str) {
            Some(hex) => decode_hex(hex).ok_or_else(|| invalid("'data' must be hex"))?,
            None => Vec::new(),
        };
        let extended = command
            .param("extended")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let frame = CanFrame::with_extended(id, extended, &data).map_err(|e| invalid(&e))?;
        Ok(Outgoing::fire(frame.encode()))
    }

    fn validate_filter(&self, filter: &str) -> Result<()> {
        IdFilter::parse(filter).map(|_| ()).ok_or_else(|| {
            DeviceError::transport(
                Protocol::CanBus,
                format!("'{}' is not an id or id/mask filter", filter),
            )
        })
    }

    fn matches(&self, filter: &str, message: &InboundMessage) -> bool {
        let id = message
            .payload
            .get("can_id")
            .and_then(Value::as_str)
            .and_then(parse_int)
            .and_then(|id| u32::try_from(id).ok());
        match (IdFilter::parse(filter), id) {
            (Some(filter), Some(id)) => filter.accepts(id),
            _ => false,
        }
    }

    fn decode(&self, session: &CanSession, frame: &[u8]) -> Result<Vec<Decoded>> {
        let frame = CanFrame::decode(frame).map_err(|e| DeviceError::transport(Protocol::CanBus, e))?;
        let mut readings = Params::new();
        for (name, signal) in &session.signals {
            if let Some(value) = signal.extract(&frame) {
                readings.insert(name.clone(), json!(value));
            }
        }
        if readings.is_empty() {
            return Ok(vec![Decoded::message(
                InboundKind::Other,
                frame.topic(),
                json!({
                    "can_id": frame.topic(),
                    "extended": frame.extended,
                    "data": encode_hex(&frame.data),
                }),
            )]);
        }
        readings.insert("can_id".into(), json!(frame.topic()));
        Ok(vec![Decoded::message(
            InboundKind::Telemetry,
            topic::telemetry(&session.device_id),
            Value::Object(readings),
        )])
    }
}
