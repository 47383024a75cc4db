/*!
 * Zigbee adapter.
 *
 * Devices are reached through a coordinator bridge that forwards ZCL
 * frames addressed by network address, endpoint and cluster. Commands
 * are correlated by the ZCL transaction sequence number.
 *
 * Device attributes:
 *
 * - `nwk_address`: 16-bit network address (falls back to `address`)
 * - `endpoint`: application endpoint (default 1)
 */
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use bytes::{BufMut, Bytes, BytesMut};
use iotflow_core::device::{parse_int, Device, DeviceCommand, Protocol};
use iotflow_core::types::{as_number, as_switch, Params, Value};
use serde_json::json;

use crate::adapter::{ConnectOptions, InboundKind};
use crate::error::{DeviceError, Result};
use crate::framed::{setting_u64, Decoded, Dialect, Outgoing};
use crate::topic;
use crate::transport::{Framing, Wire};

use super::{decode_hex, encode_hex};

/// Cluster identifiers
pub mod cluster {
    #![allow(missing_docs)]
    pub const BASIC: u16 = 0x0000;
    pub const POWER_CONFIG: u16 = 0x0001;
    pub const ON_OFF: u16 = 0x0006;
    pub const LEVEL_CONTROL: u16 = 0x0008;
    pub const ILLUMINANCE: u16 = 0x0400;
    pub const TEMPERATURE: u16 = 0x0402;
    pub const HUMIDITY: u16 = 0x0405;
    /// ZDO permit-join request and its response
    pub const PERMIT_JOIN_REQUEST: u16 = 0x0036;
    pub const PERMIT_JOIN_RESPONSE: u16 = 0x8036;
}

/// Profile-wide command identifiers
pub mod global {
    #![allow(missing_docs)]
    pub const READ_ATTRIBUTES: u8 = 0x00;
    pub const READ_ATTRIBUTES_RESPONSE: u8 = 0x01;
    pub const WRITE_ATTRIBUTES: u8 = 0x02;
    pub const WRITE_ATTRIBUTES_RESPONSE: u8 = 0x04;
    pub const REPORT_ATTRIBUTES: u8 = 0x0A;
    pub const DEFAULT_RESPONSE: u8 = 0x0B;
}

/// Attribute data types
pub mod data_type {
    #![allow(missing_docs)]
    pub const BOOLEAN: u8 = 0x10;
    pub const UINT8: u8 = 0x20;
    pub const UINT16: u8 = 0x21;
    pub const INT16: u8 = 0x29;
    pub const ENUM8: u8 = 0x30;
    pub const CHAR_STRING: u8 = 0x42;
}

/// Frame control: cluster-specific command
pub const FC_CLUSTER_SPECIFIC: u8 = 0x01;
/// Frame control: server to client direction
pub const FC_SERVER_TO_CLIENT: u8 = 0x08;

const ON_OFF_OFF: u8 = 0x00;
const ON_OFF_ON: u8 = 0x01;
const ON_OFF_TOGGLE: u8 = 0x02;
const MOVE_TO_LEVEL_WITH_ON_OFF: u8 = 0x04;
const BROADCAST_ROUTERS: u16 = 0xFFFC;

/// Name of a ZCL status code
pub fn status_name(status: u8) -> &'static str {
    match status {
        0x00 => "success",
        0x01 => "failure",
        0x7E => "not authorized",
        0x80 => "malformed command",
        0x81 => "unsupported cluster command",
        0x85 => "invalid field",
        0x86 => "unsupported attribute",
        0x87 => "invalid value",
        0x88 => "read only",
        0x8D => "invalid data type",
        _ => "unknown status",
    }
}

/// One ZCL frame as carried by the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZclFrame {
    /// Network address of the node
    pub nwk: u16,
    /// Endpoint; 0 addresses the device object
    pub endpoint: u8,
    #[allow(missing_docs)]
    pub cluster: u16,
    #[allow(missing_docs)]
    pub frame_control: u8,
    /// Transaction sequence number
    pub seq: u8,
    #[allow(missing_docs)]
    pub command: u8,
    #[allow(missing_docs)]
    pub payload: Bytes,
}

impl ZclFrame {
    const HEADER: usize = 8;

    /// Serialize with the bridge length prefix
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + Self::HEADER + self.payload.len());
        buf.put_u32((Self::HEADER + self.payload.len()) as u32);
        buf.put_u16_le(self.nwk);
        buf.put_u8(self.endpoint);
        buf.put_u16_le(self.cluster);
        buf.put_u8(self.frame_control);
        buf.put_u8(self.seq);
        buf.put_u8(self.command);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a length-prefixed bridge frame
    pub fn decode(frame: &[u8]) -> std::result::Result<Self, String> {
        let body = frame.get(4..).ok_or("missing length prefix")?;
        if body.len() < Self::HEADER {
            return Err(format!("ZCL frame of {} bytes is too short", body.len()));
        }
        Ok(Self {
            nwk: u16::from_le_bytes([body[0], body[1]]),
            endpoint: body[2],
            cluster: u16::from_le_bytes([body[3], body[4]]),
            frame_control: body[5],
            seq: body[6],
            command: body[7],
            payload: Bytes::copy_from_slice(&body[Self::HEADER..]),
        })
    }

    fn is_cluster_specific(&self) -> bool {
        self.frame_control & 0x03 == FC_CLUSTER_SPECIFIC
    }
}

/// Encode an attribute value of the given type
pub fn encode_value(kind: u8, value: &Value) -> std::result::Result<Vec<u8>, String> {
    let number = || as_number(value).ok_or_else(|| format!("{} is not a number", value));
    Ok(match kind {
        data_type::BOOLEAN => {
            vec![as_switch(value).ok_or_else(|| format!("{} is not a switch", value))? as u8]
        }
        data_type::UINT8 | data_type::ENUM8 => vec![number()? as u8],
        data_type::UINT16 => (number()? as u16).to_le_bytes().to_vec(),
        data_type::INT16 => (number()? as i16).to_le_bytes().to_vec(),
        data_type::CHAR_STRING => {
            let text = value.as_str().ok_or("expected a string")?;
            let len = u8::try_from(text.len()).map_err(|_| "string too long")?;
            let mut out = vec![len];
            out.extend_from_slice(text.as_bytes());
            out
        }
        other => return Err(format!("unsupported data type 0x{:02X}", other)),
    })
}

/// Decode one attribute value, returning it and the bytes consumed
pub fn decode_value(kind: u8, data: &[u8]) -> Option<(Value, usize)> {
    match kind {
        data_type::BOOLEAN => data.first().map(|b| (json!(*b != 0), 1)),
        data_type::UINT8 | data_type::ENUM8 => data.first().map(|b| (json!(*b), 1)),
        data_type::UINT16 => {
            let raw = data.get(..2)?;
            Some((json!(u16::from_le_bytes([raw[0], raw[1]])), 2))
        }
        data_type::INT16 => {
            let raw = data.get(..2)?;
            Some((json!(i16::from_le_bytes([raw[0], raw[1]])), 2))
        }
        data_type::CHAR_STRING => {
            let len = *data.first()? as usize;
            let text = data.get(1..1 + len)?;
            Some((json!(String::from_utf8_lossy(text)), 1 + len))
        }
        _ => None,
    }
}

/// Map a raw attribute to a named, scaled reading
pub fn named_attribute(cluster: u16, attribute: u16, raw: &Value) -> (String, Value) {
    let scaled = |name: &str, divisor: f64| {
        let value = as_number(raw).map(|v| json!(v / divisor)).unwrap_or(Value::Null);
        (name.to_string(), value)
    };
    match (cluster, attribute) {
        (cluster::ON_OFF, 0x0000) => ("power".to_string(), json!(as_switch(raw))),
        (cluster::LEVEL_CONTROL, 0x0000) => {
            let percent = as_number(raw).map(|v| (v * 100.0 / 254.0).round() as i64);
            ("brightness".to_string(), json!(percent))
        }
        (cluster::TEMPERATURE, 0x0000) => scaled("temperature", 100.0),
        (cluster::HUMIDITY, 0x0000) => scaled("humidity", 100.0),
        (cluster::POWER_CONFIG, 0x0021) => scaled("battery_level", 2.0),
        (cluster::ILLUMINANCE, 0x0000) => scaled("illuminance", 1.0),
        _ => (format!("{:04x}/{:04x}", cluster, attribute), raw.clone()),
    }
}

fn is_measurement(name: &str) -> bool {
    matches!(
        name,
        "temperature" | "humidity" | "battery_level" | "illuminance"
    )
}

/// Coordinator-bridged mesh dialect
#[derive(Debug, Default)]
pub struct ZigbeeDialect;

/// Addressing and transaction state for one node
#[derive(Debug)]
pub struct ZigbeeSession {
    device_id: String,
    nwk: u16,
    endpoint: u8,
    next_seq: AtomicU8,
    /// Result reported for a cluster command once the device acknowledges it
    expected: Mutex<HashMap<u8, Value>>,
}

impl ZigbeeSession {
    /// Network address in use
    pub fn nwk(&self) -> u16 {
        self.nwk
    }

    fn frame(&self, cluster: u16, frame_control: u8, command: u8, payload: Vec<u8>) -> ZclFrame {
        ZclFrame {
            nwk: self.nwk,
            endpoint: self.endpoint,
            cluster,
            frame_control,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            command,
            payload: Bytes::from(payload),
        }
    }

    fn cluster_command(&self, cluster: u16, command: u8, payload: Vec<u8>, expect: Value) -> Outgoing {
        let frame = self.frame(cluster, FC_CLUSTER_SPECIFIC, command, payload);
        self.expected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(frame.seq, expect);
        Outgoing::request(frame.seq.to_string(), frame.encode())
    }

    fn read_attribute(&self, cluster: u16, attribute: u16) -> Outgoing {
        let frame = self.frame(
            cluster,
            0,
            global::READ_ATTRIBUTES,
            attribute.to_le_bytes().to_vec(),
        );
        Outgoing::request(frame.seq.to_string(), frame.encode())
    }

    fn take_expected(&self, seq: u8) -> Value {
        self.expected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&seq)
            .unwrap_or_else(|| json!({}))
    }
}

fn invalid(command: &DeviceCommand, reason: &str) -> DeviceError {
    DeviceError::invalid_command(&command.command, reason)
}

fn param_u16(command: &DeviceCommand, key: &str) -> Result<u16> {
    command
        .param_u64(key)
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| invalid(command, &format!("'{}' must be an integer 0..=0xFFFF", key)))
}

impl ZigbeeDialect {
    fn decode_read_response(&self, frame: &ZclFrame) -> Decoded {
        let mut values = Params::new();
        let mut failures = Vec::new();
        let mut rest = &frame.payload[..];
        while rest.len() >= 3 {
            let attribute = u16::from_le_bytes([rest[0], rest[1]]);
            let status = rest[2];
            rest = &rest[3..];
            if status != 0 {
                failures.push(format!(
                    "attribute 0x{:04X}: {}",
                    attribute,
                    status_name(status)
                ));
                continue;
            }
            let Some((&kind, data)) = rest.split_first() else {
                break;
            };
            let Some((raw, used)) = decode_value(kind, data) else {
                break;
            };
            let (name, value) = named_attribute(frame.cluster, attribute, &raw);
            values.insert(name, value);
            rest = &data[used..];
        }
        let key = frame.seq.to_string();
        if values.is_empty() && !failures.is_empty() {
            Decoded::failed(key, failures.join(", "))
        } else {
            Decoded::ok(key, Value::Object(values))
        }
    }

    fn decode_report(&self, session: &ZigbeeSession, frame: &ZclFrame) -> Vec<Decoded> {
        let mut readings = Params::new();
        let mut state = Params::new();
        let mut rest = &frame.payload[..];
        while rest.len() >= 3 {
            let attribute = u16::from_le_bytes([rest[0], rest[1]]);
            let Some((raw, used)) = decode_value(rest[2], &rest[3..]) else {
                break;
            };
            let (name, value) = named_attribute(frame.cluster, attribute, &raw);
            if is_measurement(&name) {
                readings.insert(name, value);
            } else {
                state.insert(name, value);
            }
            rest = &rest[3 + used..];
        }
        let mut out = Vec::new();
        if !readings.is_empty() {
            out.push(Decoded::message(
                InboundKind::Telemetry,
                topic::telemetry(&session.device_id),
                Value::Object(readings),
            ));
        }
        if !state.is_empty() {
            out.push(Decoded::message(
                InboundKind::State,
                topic::state(&session.device_id),
                Value::Object(state),
            ));
        }
        out
    }
}

impl Dialect for ZigbeeDialect {
    type Session = ZigbeeSession;

    fn protocol(&self) -> Protocol {
        Protocol::Zigbee
    }

    fn wire(&self, _session: &ZigbeeSession) -> Wire {
        Wire::Stream(Framing::LengthPrefixed)
    }

    fn default_port(&self) -> u16 {
        6638
    }

    fn open(&self, device: &Device, options: &ConnectOptions) -> Result<ZigbeeSession> {
        let nwk = setting_u64(device, options, "nwk_address")
            .or_else(|| device.address.as_deref().and_then(parse_int))
            .ok_or_else(|| DeviceError::connection(&device.id, "no Zigbee network address"))?;
        let nwk = u16::try_from(nwk).map_err(|_| {
            DeviceError::connection(&device.id, format!("network address {:#x} out of range", nwk))
        })?;
        let endpoint = setting_u64(device, options, "endpoint").unwrap_or(1);
        let endpoint = u8::try_from(endpoint)
            .ok()
            .filter(|e| *e > 0)
            .ok_or_else(|| DeviceError::connection(&device.id, "endpoint must be 1..=255"))?;
        Ok(ZigbeeSession {
            device_id: device.id.clone(),
            nwk,
            endpoint,
            next_seq: AtomicU8::new(1),
            expected: Mutex::new(HashMap::new()),
        })
    }

    fn encode_command(&self, session: &ZigbeeSession, command: &DeviceCommand) -> Result<Outgoing> {
        let outgoing = match command.command.as_str() {
            "turn_on" => session.cluster_command(
                cluster::ON_OFF,
                ON_OFF_ON,
                Vec::new(),
                json!({"power": true}),
            ),
            "turn_off" => session.cluster_command(
                cluster::ON_OFF,
                ON_OFF_OFF,
                Vec::new(),
                json!({"power": false}),
            ),
            "toggle" => session.cluster_command(
                cluster::ON_OFF,
                ON_OFF_TOGGLE,
                Vec::new(),
                json!({"toggled": true}),
            ),
            "set_brightness" => {
                let brightness = command
                    .param_f64("brightness")
                    .filter(|b| (0.0..=100.0).contains(b))
                    .ok_or_else(|| invalid(command, "'brightness' must be 0..=100"))?;
                let level = (brightness * 254.0 / 100.0).round() as u8;
                let transition = command.param_u64("transition").unwrap_or(0) as u16;
                let mut payload = vec![level];
                payload.extend_from_slice(&transition.to_le_bytes());
                session.cluster_command(
                    cluster::LEVEL_CONTROL,
                    MOVE_TO_LEVEL_WITH_ON_OFF,
                    payload,
                    json!({"brightness": brightness.round() as i64}),
                )
            }
            "zcl_command" => {
                let cluster = param_u16(command, "cluster")?;
                let id = command
                    .param_u64("command")
                    .and_then(|c| u8::try_from(c).ok())
                    .ok_or_else(|| invalid(command, "'command' must be 0..=255"))?;
                let payload = match command.param("payload").and_then(Value::as_str) {
                    Some(hex) => decode_hex(hex)
                        .ok_or_else(|| invalid(command, "'payload' must be hex"))?,
                    None => Vec::new(),
                };
                session.cluster_command(cluster, id, payload, json!({}))
            }
            "read_attribute" => session.read_attribute(
                param_u16(command, "cluster")?,
                param_u16(command, "attribute")?,
            ),
            "write_attribute" => {
                let cluster = param_u16(command, "cluster")?;
                let attribute = param_u16(command, "attribute")?;
                let kind = command
                    .param_u64("data_type")
                    .and_then(|t| u8::try_from(t).ok())
                    .ok_or_else(|| invalid(command, "'data_type' is required"))?;
                let value = command
                    .param("value")
                    .ok_or_else(|| invalid(command, "'value' is required"))?;
                let encoded = encode_value(kind, value).map_err(|e| invalid(command, &e))?;
                let mut payload = attribute.to_le_bytes().to_vec();
                payload.push(kind);
                payload.extend(encoded);
                let frame = session.frame(cluster, 0, global::WRITE_ATTRIBUTES, payload);
                Outgoing::request(frame.seq.to_string(), frame.encode())
            }
            "permit_join" => {
                let duration = command.param_u64("duration").unwrap_or(60).min(254) as u8;
                let mut frame =
                    session.frame(cluster::PERMIT_JOIN_REQUEST, 0, 0, vec![duration, 1]);
                frame.nwk = BROADCAST_ROUTERS;
                frame.endpoint = 0;
                Outgoing::request(frame.seq.to_string(), frame.encode())
            }
            other => {
                return Err(DeviceError::invalid_command(
                    other,
                    "not supported over Zigbee",
                ))
            }
        };
        Ok(outgoing)
    }

    fn encode_state_query(&self, session: &ZigbeeSession) -> Option<Result<Outgoing>> {
        Some(Ok(session.read_attribute(cluster::ON_OFF, 0x0000)))
    }

    fn encode_ping(&self, session: &ZigbeeSession) -> Option<Outgoing> {
        Some(session.read_attribute(cluster::BASIC, 0x0000))
    }

    fn decode(&self, session: &ZigbeeSession, frame: &[u8]) -> Result<Vec<Decoded>> {
        let frame = ZclFrame::decode(frame).map_err(|e| DeviceError::transport(Protocol::Zigbee, e))?;
        let key = frame.seq.to_string();

        if frame.endpoint == 0 {
            if frame.cluster != cluster::PERMIT_JOIN_RESPONSE {
                return Ok(Vec::new());
            }
            let status = frame.payload.first().copied().unwrap_or(0xFF);
            return Ok(vec![if status == 0 {
                Decoded::ok(key, json!({"permit_join": true}))
            } else {
                Decoded::failed(key, format!("permit join refused: status 0x{:02X}", status))
            }]);
        }
        if frame.is_cluster_specific() {
            // Device-originated cluster commands (e.g. a remote's toggle)
            return Ok(vec![Decoded::message(
                InboundKind::Event,
                topic::events(&session.device_id),
                json!({
                    "cluster": frame.cluster,
                    "command": frame.command,
                    "payload": encode_hex(&frame.payload),
                }),
            )]);
        }

        let decoded = match frame.command {
            global::DEFAULT_RESPONSE => {
                let status = frame.payload.get(1).copied().unwrap_or(0xFF);
                let expected = session.take_expected(frame.seq);
                if status == 0 {
                    Decoded::ok(key, expected)
                } else {
                    Decoded::failed(
                        key,
                        format!("ZCL status 0x{:02X} ({})", status, status_name(status)),
                    )
                }
            }
            global::READ_ATTRIBUTES_RESPONSE => self.decode_read_response(&frame),
            global::WRITE_ATTRIBUTES_RESPONSE => match frame.payload.first() {
                Some(0) => Decoded::ok(key, json!({"written": true})),
                Some(status) => Decoded::failed(
                    key,
                    format!("write rejected: {}", status_name(*status)),
                ),
                None => Decoded::failed(key, "empty write response"),
            },
            global::REPORT_ATTRIBUTES => return Ok(self.decode_report(session, &frame)),
            _ => return Ok(Vec::new()),
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
    use iotflow_core::params;
    use std::sync::Arc;

    fn reply(request: &ZclFrame, command: u8, payload: Vec<u8>) -> Bytes {
        ZclFrame {
            nwk: request.nwk,
            endpoint: request.endpoint,
            cluster: request.cluster,
            frame_control: FC_SERVER_TO_CLIENT,
            seq: request.seq,
            command,
            payload: Bytes::from(payload),
        }
        .encode()
    }

    async fn connected() -> (FramedAdapter<ZigbeeDialect>, Peer) {
        let connector = Arc::new(MemoryConnector::new());
        let adapter = FramedAdapter::new(ZigbeeDialect, connector.clone());
        let device = Device::new("Lamp", DeviceType::Light, Protocol::Zigbee)
            .with_id("lamp")
            .with_attribute("nwk_address", json!("0x1a2b"))
            .with_attribute("endpoint", json!(11));
        adapter.connect(&device, ConnectOptions::new()).await.unwrap();
        let peer = connector.take_peer("lamp").unwrap();
        (adapter, peer)
    }

    #[test]
    fn test_frame_layout() {
        let frame = ZclFrame {
            nwk: 0x1A2B,
            endpoint: 11,
            cluster: cluster::ON_OFF,
            frame_control: FC_CLUSTER_SPECIFIC,
            seq: 7,
            command: ON_OFF_ON,
            payload: Bytes::new(),
        };
        let bytes = frame.encode();
        assert_eq!(&bytes[4..], &[0x2B, 0x1A, 11, 0x06, 0x00, 0x01, 7, 0x01]);
        assert_eq!(ZclFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_named_attributes() {
        assert_eq!(
            named_attribute(cluster::TEMPERATURE, 0, &json!(2150)),
            ("temperature".to_string(), json!(21.5))
        );
        assert_eq!(
            named_attribute(cluster::LEVEL_CONTROL, 0, &json!(254)),
            ("brightness".to_string(), json!(100))
        );
        assert_eq!(
            named_attribute(0xFC00, 0x0010, &json!(3)),
            ("fc00/0010".to_string(), json!(3))
        );
    }

    #[tokio::test]
    async fn test_turn_on_uses_on_off_cluster() {
        let (adapter, mut peer) = connected().await;
        tokio::spawn(async move {
            let request = ZclFrame::decode(&peer.recv().await.unwrap()).unwrap();
            assert_eq!(request.nwk, 0x1A2B);
            assert_eq!(request.endpoint, 11);
            assert_eq!(request.cluster, cluster::ON_OFF);
            assert_eq!(request.command, ON_OFF_ON);
            peer.send(reply(&request, global::DEFAULT_RESPONSE, vec![ON_OFF_ON, 0x00]))
                .await;
            peer
        });
        let response = adapter
            .send_command("lamp", DeviceCommand::new("lamp", "turn_on"))
            .await
            .unwrap();
        assert!(response.is_ok());
        assert_eq!(response.result, json!({"power": true}));
    }

    #[tokio::test]
    async fn test_brightness_maps_to_move_to_level() {
        let (adapter, mut peer) = connected().await;
        tokio::spawn(async move {
            let request = ZclFrame::decode(&peer.recv().await.unwrap()).unwrap();
            assert_eq!(request.cluster, cluster::LEVEL_CONTROL);
            assert_eq!(request.command, MOVE_TO_LEVEL_WITH_ON_OFF);
            assert_eq!(&request.payload[..], &[127, 0, 0]);
            peer.send(reply(&request, global::DEFAULT_RESPONSE, vec![0x04, 0x87]))
                .await;
            peer
        });
        let command =
            DeviceCommand::new("lamp", "set_brightness").with_parameters(params! {"brightness" => 50});
        let response = adapter.send_command("lamp", command).await.unwrap();
        assert!(!response.is_ok());
        assert_eq!(
            response.error.as_deref(),
            Some("ZCL status 0x87 (invalid value)")
        );
    }

    #[tokio::test]
    async fn test_state_read_and_reports() {
        let (adapter, mut peer) = connected().await;
        let mut telemetry = adapter.subscribe("lamp", "devices/lamp/telemetry").await.unwrap();

        let report = ZclFrame {
            nwk: 0x1A2B,
            endpoint: 11,
            cluster: cluster::TEMPERATURE,
            frame_control: FC_SERVER_TO_CLIENT,
            seq: 200,
            command: global::REPORT_ATTRIBUTES,
            payload: Bytes::from(vec![0x00, 0x00, data_type::INT16, 0x66, 0x08]),
        };
        peer.send(report.encode()).await;
        let message = telemetry.recv().await.unwrap();
        assert_eq!(message.payload, json!({"temperature": 21.5}));

        tokio::spawn(async move {
            let request = ZclFrame::decode(&peer.recv().await.unwrap()).unwrap();
            assert_eq!(request.command, global::READ_ATTRIBUTES);
            peer.send(reply(
                &request,
                global::READ_ATTRIBUTES_RESPONSE,
                vec![0x00, 0x00, 0x00, data_type::BOOLEAN, 0x01],
            ))
            .await;
            peer
        });
        let state = adapter.read_state("lamp").await.unwrap();
        assert_eq!(state.power, Some(true));
        assert_eq!(state.temperature, Some(21.5));
    }

    #[tokio::test]
    async fn test_missing_network_address() {
        let connector = Arc::new(MemoryConnector::new());
        let adapter = FramedAdapter::new(ZigbeeDialect, connector);
        let device = Device::new("Lamp", DeviceType::Light, Protocol::Zigbee).with_id("lamp");
        assert!(adapter.connect(&device, ConnectOptions::new()).await.is_err());
        assert_eq!(adapter.session_count(), 0);
    }
}
