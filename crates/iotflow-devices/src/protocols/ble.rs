/*!
 * Bluetooth LE adapter.
 *
 * Talks GATT through a central bridge: every frame carries an operation,
 * a request id and a characteristic UUID. Generic commands are written as
 * JSON envelopes to the device's command characteristic; state is read
 * from its state characteristic. Standard characteristics (battery,
 * temperature, humidity) are decoded into telemetry when notified.
 */
use std::sync::atomic::{AtomicU16, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use iotflow_core::device::{CommandResponse, Device, DeviceCommand, Protocol, ResponseStatus};
use iotflow_core::types::Value;
use serde_json::json;
use uuid::Uuid;

use crate::adapter::{ConnectOptions, InboundKind, InboundMessage};
use crate::error::{DeviceError, Result};
use crate::framed::{setting_str, Decoded, Dialect, Outgoing};
use crate::transport::{Framing, Wire};

use super::{decode_hex, encode_hex};

/// GATT operation codes on the bridge link
pub mod op {
    #![allow(missing_docs)]
    pub const READ: u8 = 0x01;
    pub const READ_RESPONSE: u8 = 0x02;
    pub const WRITE: u8 = 0x03;
    pub const WRITE_RESPONSE: u8 = 0x04;
    pub const NOTIFY: u8 = 0x05;
    pub const ENABLE_NOTIFY: u8 = 0x06;
    pub const DISABLE_NOTIFY: u8 = 0x07;
    pub const ERROR: u8 = 0x08;
}

/// Device Name
pub const DEVICE_NAME: u16 = 0x2A00;
/// Battery Level, one byte percent
pub const BATTERY_LEVEL: u16 = 0x2A19;
/// Temperature, sint16 in 0.01 °C
pub const TEMPERATURE: u16 = 0x2A6E;
/// Humidity, uint16 in 0.01 %
pub const HUMIDITY: u16 = 0x2A6F;

const DEFAULT_COMMAND_CHARACTERISTIC: u16 = 0xFF01;
const DEFAULT_STATE_CHARACTERISTIC: u16 = 0xFF02;

/// Expand a 16-bit assigned number with the Bluetooth base UUID
pub fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb | ((short as u128) << 96))
}

/// Parse a full UUID or a 4-digit short form
pub fn parse_uuid(text: &str) -> Option<Uuid> {
    let text = text.trim().trim_start_matches("0x");
    if text.len() == 4 {
        return u16::from_str_radix(text, 16).ok().map(short_uuid);
    }
    Uuid::parse_str(text).ok()
}

/// One bridge frame
#[derive(Debug, Clone, PartialEq)]
pub struct GattFrame {
    #[allow(missing_docs)]
    pub op: u8,
    #[allow(missing_docs)]
    pub request_id: u16,
    #[allow(missing_docs)]
    pub characteristic: Uuid,
    #[allow(missing_docs)]
    pub value: Bytes,
}

impl GattFrame {
    /// Serialize with the length prefix
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + 19 + self.value.len());
        buf.put_u32((19 + self.value.len()) as u32);
        buf.put_u8(self.op);
        buf.put_u16(self.request_id);
        buf.put_slice(self.characteristic.as_bytes());
        buf.put_slice(&self.value);
        buf.freeze()
    }

    /// Parse a length-prefixed frame
    pub fn decode(frame: &[u8]) -> std::result::Result<Self, String> {
        let body = frame.get(4..).ok_or("missing length prefix")?;
        if body.len() < 19 {
            return Err(format!("GATT frame of {} bytes is too short", body.len()));
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&body[3..19]);
        Ok(Self {
            op: body[0],
            request_id: u16::from_be_bytes([body[1], body[2]]),
            characteristic: Uuid::from_bytes(uuid),
            value: Bytes::copy_from_slice(&body[19..]),
        })
    }
}

/// Decode a standard characteristic into a named reading
pub fn decode_reading(characteristic: &Uuid, value: &[u8]) -> Option<(&'static str, f64)> {
    if *characteristic == short_uuid(BATTERY_LEVEL) {
        return value.first().map(|b| ("battery_level", *b as f64));
    }
    if *characteristic == short_uuid(TEMPERATURE) && value.len() >= 2 {
        return Some((
            "temperature",
            i16::from_le_bytes([value[0], value[1]]) as f64 / 100.0,
        ));
    }
    if *characteristic == short_uuid(HUMIDITY) && value.len() >= 2 {
        return Some((
            "humidity",
            u16::from_le_bytes([value[0], value[1]]) as f64 / 100.0,
        ));
    }
    None
}

fn value_json(value: &[u8]) -> Value {
    serde_json::from_slice(value).unwrap_or_else(|_| match std::str::from_utf8(value) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => Value::String(encode_hex(value)),
    })
}

/// Short-range radio dialect
#[derive(Debug, Default)]
pub struct BleDialect;

/// Per-session GATT state
#[derive(Debug)]
pub struct BleSession {
    command_characteristic: Uuid,
    state_characteristic: Uuid,
    next_request: AtomicU16,
}

impl BleSession {
    fn frame(&self, op: u8, characteristic: Uuid, value: Bytes) -> (String, Bytes) {
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let frame = GattFrame {
            op,
            request_id,
            characteristic,
            value,
        };
        (request_id.to_string(), frame.encode())
    }
}

fn characteristic_param(command: &DeviceCommand) -> Result<Uuid> {
    command
        .param("characteristic")
        .and_then(Value::as_str)
        .and_then(parse_uuid)
        .ok_or_else(|| {
            DeviceError::invalid_command(&command.command, "'characteristic' must be a UUID")
        })
}

impl Dialect for BleDialect {
    type Session = BleSession;

    fn protocol(&self) -> Protocol {
        Protocol::Bluetooth
    }

    fn wire(&self, _session: &BleSession) -> Wire {
        Wire::Stream(Framing::LengthPrefixed)
    }

    fn default_port(&self) -> u16 {
        8765
    }

    fn open(&self, device: &Device, options: &ConnectOptions) -> Result<BleSession> {
        let characteristic = |key: &str, default: u16| -> Result<Uuid> {
            match setting_str(device, options, key) {
                Some(text) => parse_uuid(&text).ok_or_else(|| {
                    DeviceError::connection(&device.id, format!("invalid {} '{}'", key, text))
                }),
                None => Ok(short_uuid(default)),
            }
        };
        Ok(BleSession {
            command_characteristic: characteristic(
                "command_characteristic",
                DEFAULT_COMMAND_CHARACTERISTIC,
            )?,
            state_characteristic: characteristic(
                "state_characteristic",
                DEFAULT_STATE_CHARACTERISTIC,
            )?,
            next_request: AtomicU16::new(1),
        })
    }

    fn encode_command(&self, session: &BleSession, command: &DeviceCommand) -> Result<Outgoing> {
        let (key, frame) = match command.command.as_str() {
            "read_characteristic" => {
                session.frame(op::READ, characteristic_param(command)?, Bytes::new())
            }
            "write_characteristic" => {
                let value = match command.param("value") {
                    Some(Value::String(text)) => decode_hex(text)
                        .map(Bytes::from)
                        .unwrap_or_else(|| Bytes::from(text.clone())),
                    Some(other) => Bytes::from(other.to_string()),
                    None => {
                        return Err(DeviceError::invalid_command(
                            &command.command,
                            "'value' is required",
                        ))
                    }
                };
                session.frame(op::WRITE, characteristic_param(command)?, value)
            }
            _ => session.frame(
                op::WRITE,
                session.command_characteristic,
                Bytes::from(command.envelope().to_string()),
            ),
        };
        Ok(Outgoing::request(key, frame))
    }

    fn encode_state_query(&self, session: &BleSession) -> Option<Result<Outgoing>> {
        let (key, frame) = session.frame(op::READ, session.state_characteristic, Bytes::new());
        Some(Ok(Outgoing::request(key, frame)))
    }

    fn encode_ping(&self, session: &BleSession) -> Option<Outgoing> {
        let (key, frame) = session.frame(op::READ, short_uuid(DEVICE_NAME), Bytes::new());
        Some(Outgoing::request(key, frame))
    }

    fn validate_filter(&self, filter: &str) -> Result<()> {
        parse_uuid(filter).map(|_| ()).ok_or_else(|| {
            DeviceError::transport(
                Protocol::Bluetooth,
                format!("'{}' is not a characteristic UUID", filter),
            )
        })
    }

    fn encode_subscribe(&self, session: &BleSession, filter: &str) -> Result<Vec<Bytes>> {
        let characteristic = parse_uuid(filter).ok_or_else(|| {
            DeviceError::transport(Protocol::Bluetooth, "invalid characteristic")
        })?;
        Ok(vec![session.frame(op::ENABLE_NOTIFY, characteristic, Bytes::new()).1])
    }

    fn encode_unsubscribe(&self, session: &BleSession, filter: &str) -> Vec<Bytes> {
        parse_uuid(filter)
            .map(|c| vec![session.frame(op::DISABLE_NOTIFY, c, Bytes::new()).1])
            .unwrap_or_default()
    }

    fn matches(&self, filter: &str, message: &InboundMessage) -> bool {
        match (parse_uuid(filter), parse_uuid(&message.topic)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn decode(&self, session: &BleSession, frame: &[u8]) -> Result<Vec<Decoded>> {
        let frame =
            GattFrame::decode(frame).map_err(|e| DeviceError::transport(Protocol::Bluetooth, e))?;
        let key = frame.request_id.to_string();
        let decoded = match frame.op {
            op::READ_RESPONSE => Decoded::ok(key, value_json(&frame.value)),
            op::WRITE_RESPONSE => {
                let value = value_json(&frame.value);
                match serde_json::from_value::<CommandResponse>(value.clone()) {
                    Ok(response) if response.status == ResponseStatus::Error => Decoded::failed(
                        key,
                        response.error.unwrap_or_else(|| "write rejected".to_string()),
                    ),
                    Ok(response) => Decoded::ok(key, response.result),
                    Err(_) => Decoded::ok(key, value),
                }
            }
            op::ERROR => Decoded::failed(
                key,
                format!(
                    "ATT error 0x{:02X} on {}",
                    frame.value.first().copied().unwrap_or(0),
                    frame.characteristic
                ),
            ),
            op::NOTIFY => {
                let topic = frame.characteristic.to_string();
                if let Some((name, reading)) = decode_reading(&frame.characteristic, &frame.value) {
                    Decoded::message(InboundKind::Telemetry, topic, json!({ name: reading }))
                } else if frame.characteristic == session.state_characteristic {
                    Decoded::message(InboundKind::State, topic, value_json(&frame.value))
                } else {
                    Decoded::message(InboundKind::Other, topic, value_json(&frame.value))
                }
            }
            other => {
                return Err(DeviceError::transport(
                    Protocol::Bluetooth,
                    format!("unexpected GATT op 0x{:02X}", other),
                ))
            }
        };
        Ok(vec![decoded])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ProtocolAdapter;
    use crate::framed::FramedAdapter;
    use crate::transport::{MemoryConnector, Peer};
    use iotflow_core::device::DeviceType;
    use std::sync::Arc;

    #[test]
    fn test_uuid_forms() {
        assert_eq!(
            short_uuid(BATTERY_LEVEL).to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(parse_uuid("2A19"), Some(short_uuid(BATTERY_LEVEL)));
        assert_eq!(
            parse_uuid("00002a19-0000-1000-8000-00805f9b34fb"),
            Some(short_uuid(BATTERY_LEVEL))
        );
        assert_eq!(parse_uuid("battery"), None);
    }

    #[test]
    fn test_standard_readings() {
        assert_eq!(
            decode_reading(&short_uuid(TEMPERATURE), &(-512i16).to_le_bytes()),
            Some(("temperature", -5.12))
        );
        assert_eq!(
            decode_reading(&short_uuid(BATTERY_LEVEL), &[87]),
            Some(("battery_level", 87.0))
        );
        assert_eq!(decode_reading(&short_uuid(0x1234), &[1]), None);
    }

    async fn connected() -> (FramedAdapter<BleDialect>, Peer) {
        let connector = Arc::new(MemoryConnector::new());
        let adapter = FramedAdapter::new(BleDialect, connector.clone());
        let device = Device::new("Bulb", DeviceType::Light, Protocol::Bluetooth).with_id("bulb");
        adapter.connect(&device, ConnectOptions::new()).await.unwrap();
        let peer = connector.take_peer("bulb").unwrap();
        (adapter, peer)
    }

    #[tokio::test]
    async fn test_generic_command_writes_envelope() {
        let (adapter, mut peer) = connected().await;
        tokio::spawn(async move {
            let request = GattFrame::decode(&peer.recv().await.unwrap()).unwrap();
            assert_eq!(request.op, op::WRITE);
            assert_eq!(request.characteristic, short_uuid(0xFF01));
            let envelope = value_json(&request.value);
            let reply = GattFrame {
                op: op::WRITE_RESPONSE,
                request_id: request.request_id,
                characteristic: request.characteristic,
                value: Bytes::from(
                    json!({"command_id": envelope["command_id"], "status": "ok", "result": {"brightness": 40}})
                        .to_string(),
                ),
            };
            peer.send(reply.encode()).await;
            peer
        });

        let command = DeviceCommand::new("bulb", "set_brightness")
            .with_parameters(iotflow_core::params! {"level" => 40});
        let response = adapter.send_command("bulb", command).await.unwrap();
        assert_eq!(response.result, json!({"brightness": 40}));
    }

    #[tokio::test]
    async fn test_notifications_by_characteristic() {
        let (adapter, mut peer) = connected().await;
        let mut battery = adapter.subscribe("bulb", "2a19").await.unwrap();
        let enable = GattFrame::decode(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(enable.op, op::ENABLE_NOTIFY);

        let notify = GattFrame {
            op: op::NOTIFY,
            request_id: 0,
            characteristic: short_uuid(BATTERY_LEVEL),
            value: Bytes::from_static(&[64]),
        };
        peer.send(notify.encode()).await;

        let message = battery.recv().await.unwrap();
        assert_eq!(message.kind, InboundKind::Telemetry);
        assert_eq!(message.payload, json!({"battery_level": 64.0}));

        tokio::spawn(async move {
            let query = GattFrame::decode(&peer.recv().await.unwrap()).unwrap();
            assert_eq!(query.op, op::READ);
            assert_eq!(query.characteristic, short_uuid(0xFF02));
            let reply = GattFrame {
                op: op::READ_RESPONSE,
                request_id: query.request_id,
                characteristic: query.characteristic,
                value: Bytes::from(json!({"power": true, "brightness": 70}).to_string()),
            };
            peer.send(reply.encode()).await;
            peer
        });
        let state = adapter.read_state("bulb").await.unwrap();
        assert_eq!(state.battery_level, Some(64.0));
        assert_eq!(state.power, Some(true));
        assert_eq!(state.brightness, Some(70));
    }

    #[tokio::test]
    async fn test_att_error_is_command_failure() {
        let (adapter, mut peer) = connected().await;
        tokio::spawn(async move {
            let request = GattFrame::decode(&peer.recv().await.unwrap()).unwrap();
            let reply = GattFrame {
                op: op::ERROR,
                request_id: request.request_id,
                characteristic: request.characteristic,
                value: Bytes::from_static(&[0x03]),
            };
            peer.send(reply.encode()).await;
            peer
        });
        let command = DeviceCommand::new("bulb", "write_characteristic").with_parameters(
            iotflow_core::params! {"characteristic" => "2a00", "value" => "0102"},
        );
        let response = adapter.send_command("bulb", command).await.unwrap();
        assert!(!response.is_ok());
        assert!(response.error.unwrap().starts_with("ATT error 0x03"));
    }

    #[tokio::test]
    async fn test_subscribe_rejects_non_uuid_filter() {
        let (adapter, _peer) = connected().await;
        assert!(adapter.subscribe("bulb", "devices/bulb/#").await.is_err());
    }
}
