/*!
 * LoRa adapter.
 *
 * Nodes talk to a packet-forwarding gateway. Every frame starts with the
 * node address and a big-endian payload length. Uplink payloads carry a
 * port byte plus the radio metadata the gateway measured; downlinks carry
 * only the port. The link is one-way in practice: commands are delivered
 * without confirmation and the device state is whatever the last uplinks
 * reported.
 */
use bytes::{BufMut, Bytes, BytesMut};
use iotflow_core::device::{Device, DeviceCommand, Protocol};
use iotflow_core::types::Value;
use serde_json::json;

use crate::adapter::{ConnectOptions, InboundKind};
use crate::error::{DeviceError, Result};
use crate::framed::{setting_u64, Decoded, Dialect, Outgoing};
use crate::topic;
use crate::transport::{Framing, Wire};

use super::{decode_hex, encode_hex};

/// Largest application payload a downlink may carry
pub const MAX_PAYLOAD: usize = 222;

/// Application ports
pub mod port {
    #![allow(missing_docs)]
    pub const TELEMETRY: u8 = 1;
    pub const EVENT: u8 = 2;
    pub const STATE: u8 = 3;
    pub const COMMAND: u8 = 10;
}

/// An uplink as relayed by the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct Uplink {
    #[allow(missing_docs)]
    pub address: u8,
    #[allow(missing_docs)]
    pub port: u8,
    /// Received signal strength in dBm
    pub rssi: i8,
    /// Signal-to-noise ratio in dB
    pub snr: i8,
    #[allow(missing_docs)]
    pub payload: Bytes,
}

impl Uplink {
    /// Parse a gateway frame
    pub fn decode(frame: &[u8]) -> std::result::Result<Self, String> {
        if frame.len() < 3 {
            return Err("LoRa frame shorter than its header".to_string());
        }
        let len = u16::from_be_bytes([frame[1], frame[2]]) as usize;
        let data = frame
            .get(3..3 + len)
            .ok_or_else(|| format!("LoRa frame truncated, expected {} bytes", len))?;
        if data.len() < 3 {
            return Err("uplink without port and radio metadata".to_string());
        }
        Ok(Self {
            address: frame[0],
            port: data[0],
            rssi: data[1] as i8,
            snr: data[2] as i8,
            payload: Bytes::copy_from_slice(&data[3..]),
        })
    }

    /// Serialize as the gateway would relay it
    pub fn encode(&self) -> Bytes {
        let len = 3 + self.payload.len();
        let mut buf = BytesMut::with_capacity(3 + len);
        buf.put_u8(self.address);
        buf.put_u16(len as u16);
        buf.put_u8(self.port);
        buf.put_i8(self.rssi);
        buf.put_i8(self.snr);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Build a downlink frame for `address` on `port`
pub fn downlink(address: u8, port: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u8(address);
    buf.put_u16((1 + payload.len()) as u16);
    buf.put_u8(port);
    buf.put_slice(payload);
    buf.freeze()
}

/// Long-range radio dialect
#[derive(Debug, Default)]
pub struct LoraDialect;

/// Node addressing
#[derive(Debug)]
pub struct LoraSession {
    device_id: String,
    address: u8,
}

impl Dialect for LoraDialect {
    type Session = LoraSession;

    fn protocol(&self) -> Protocol {
        Protocol::Lora
    }

    fn wire(&self, _session: &LoraSession) -> Wire {
        Wire::Stream(Framing::LoraHeader)
    }

    fn default_port(&self) -> u16 {
        1700
    }

    fn open(&self, device: &Device, options: &ConnectOptions) -> Result<LoraSession> {
        let address = setting_u64(device, options, "node_address")
            .ok_or_else(|| DeviceError::connection(&device.id, "no LoRa node address"))?;
        let address = u8::try_from(address).map_err(|_| {
            DeviceError::connection(&device.id, format!("node address {} out of range", address))
        })?;
        Ok(LoraSession {
            device_id: device.id.clone(),
            address,
        })
    }

    fn encode_command(&self, session: &LoraSession, command: &DeviceCommand) -> Result<Outgoing> {
        let (port, payload) = match command.command.as_str() {
            "send_raw" => {
                let payload = command
                    .param("payload")
                    .and_then(Value::as_str)
                    .and_then(decode_hex)
                    .ok_or_else(|| {
                        DeviceError::invalid_command(&command.command, "'payload' must be hex")
                    })?;
                let port = command
                    .param_u64("port")
                    .and_then(|p| u8::try_from(p).ok())
                    .unwrap_or(port::COMMAND);
                (port, payload)
            }
            _ => (port::COMMAND, command.envelope().to_string().into_bytes()),
        };
        if payload.len() > MAX_PAYLOAD {
            return Err(DeviceError::invalid_command(
                &command.command,
                format!(
                    "payload of {} bytes exceeds the {} byte downlink limit",
                    payload.len(),
                    MAX_PAYLOAD
                ),
            ));
        }
        Ok(Outgoing::fire(downlink(session.address, port, &payload)))
    }

    fn decode(&self, session: &LoraSession, frame: &[u8]) -> Result<Vec<Decoded>> {
        let uplink = Uplink::decode(frame).map_err(|e| DeviceError::transport(Protocol::Lora, e))?;
        if uplink.address != session.address {
            return Ok(Vec::new());
        }
        let body: Option<Value> = serde_json::from_slice(&uplink.payload).ok();
        let decoded = match (uplink.port, body) {
            (port::TELEMETRY, Some(Value::Object(mut readings))) => {
                readings.insert("rssi".into(), json!(uplink.rssi));
                readings.insert("snr".into(), json!(uplink.snr));
                Decoded::message(
                    InboundKind::Telemetry,
                    topic::telemetry(&session.device_id),
                    Value::Object(readings),
                )
            }
            (port::EVENT, Some(event)) => Decoded::message(
                InboundKind::Event,
                topic::events(&session.device_id),
                event,
            ),
            (port::STATE, Some(state)) => Decoded::message(
                InboundKind::State,
                topic::state(&session.device_id),
                state,
            ),
            (port, _) => Decoded::message(
                InboundKind::Other,
                format!("{}/uplink/{}", topic::telemetry(&session.device_id), port),
                json!({
                    "port": port,
                    "rssi": uplink.rssi,
                    "snr": uplink.snr,
                    "data": encode_hex(&uplink.payload),
                }),
            ),
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

    async fn connected() -> (FramedAdapter<LoraDialect>, Peer) {
        let connector = Arc::new(MemoryConnector::new());
        let adapter = FramedAdapter::new(LoraDialect, connector.clone());
        let device = Device::new("Soil Sensor", DeviceType::Sensor, Protocol::Lora)
            .with_id("soil")
            .with_attribute("node_address", json!(0x21));
        adapter.connect(&device, ConnectOptions::new()).await.unwrap();
        let peer = connector.take_peer("soil").unwrap();
        (adapter, peer)
    }

    fn uplink(address: u8, port: u8, payload: Value) -> Bytes {
        Uplink {
            address,
            port,
            rssi: -97,
            snr: 7,
            payload: Bytes::from(payload.to_string()),
        }
        .encode()
    }

    #[tokio::test]
    async fn test_commands_are_fire_and_forget() {
        let (adapter, mut peer) = connected().await;
        let command = DeviceCommand::new("soil", "set_interval")
            .with_parameters(params! {"seconds" => 600});
        let response = adapter.send_command("soil", command).await.unwrap();
        assert_eq!(response.result, json!({"delivered": true}));

        let frame = peer.recv().await.unwrap();
        assert_eq!(frame[0], 0x21);
        assert_eq!(frame[3], port::COMMAND);
        let envelope: Value = serde_json::from_slice(&frame[4..]).unwrap();
        assert_eq!(envelope["command"], "set_interval");
    }

    #[tokio::test]
    async fn test_oversized_downlink_rejected() {
        let (adapter, _peer) = connected().await;
        let command = DeviceCommand::new("soil", "send_raw")
            .with_parameters(params! {"payload" => "ab".repeat(MAX_PAYLOAD + 1)});
        let err = adapter.send_command("soil", command).await.unwrap_err();
        assert!(matches!(err, DeviceError::InvalidCommand { .. }));
    }

    #[tokio::test]
    async fn test_state_comes_from_uplinks() {
        let (adapter, peer) = connected().await;
        let mut all = adapter.subscribe("soil", "devices/soil/#").await.unwrap();

        peer.send(uplink(0x44, port::TELEMETRY, json!({"moisture": 10})))
            .await;
        peer.send(uplink(0x21, port::TELEMETRY, json!({"moisture": 31.5})))
            .await;

        let message = all.recv().await.unwrap();
        assert_eq!(message.kind, InboundKind::Telemetry);
        assert_eq!(message.payload["moisture"], json!(31.5));
        assert_eq!(message.payload["rssi"], json!(-97));

        let state = adapter.read_state("soil").await.unwrap();
        assert_eq!(state.sensor_data.get("moisture"), Some(&31.5));
        assert_eq!(state.signal_strength, Some(-97.0));
        assert!(adapter.ping("soil").await.unwrap());
    }
}
