/*!
 * WebSocket adapter.
 *
 * Every message is a JSON text message with a `type`, optional `data` and
 * a timestamp. Commands are correlated by `command_id`; liveness is a
 * ping/pong pair.
 *
 * Device attributes:
 *
 * - `path`: request path of the upgrade (default `/ws`)
 * - `secure`: connect with `wss://`
 * - `state_queries`: the device answers `get_state`
 */
use bytes::Bytes;
use chrono::Utc;
use iotflow_core::device::{Device, DeviceCommand, Protocol};
use iotflow_core::types::Value;
use serde_json::json;

use crate::adapter::{ConnectOptions, InboundKind};
use crate::error::{DeviceError, Result};
use crate::framed::{setting_str, Decoded, Dialect, Outgoing};
use crate::topic;
use crate::transport::Wire;

/// Message types
pub mod kind {
    #![allow(missing_docs)]
    pub const AUTH: &str = "auth";
    pub const AUTH_RESPONSE: &str = "auth_response";
    pub const COMMAND: &str = "command";
    pub const COMMAND_RESPONSE: &str = "command_response";
    pub const TELEMETRY: &str = "telemetry";
    pub const EVENT: &str = "event";
    pub const STATE: &str = "state";
    pub const GET_STATE: &str = "get_state";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const ERROR: &str = "error";
}

const PONG_KEY: &str = "pong";
const STATE_KEY: &str = "state";

/// Serialize a JSON message as one text frame
pub fn frame(message: &Value) -> Bytes {
    Bytes::from(message.to_string())
}

fn message(kind: &str, data: Value) -> Value {
    json!({
        "type": kind,
        "data": data,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

/// JSON message dialect
#[derive(Debug, Default)]
pub struct WebSocketDialect;

/// Identity and credentials presented on connect
#[derive(Debug)]
pub struct WebSocketSession {
    device_id: String,
    path: String,
    secure: bool,
    auth: Option<Value>,
    /// Whether the device answers `get_state` queries
    state_queries: bool,
}

impl Dialect for WebSocketDialect {
    type Session = WebSocketSession;

    fn protocol(&self) -> Protocol {
        Protocol::WebSocket
    }

    fn wire(&self, session: &WebSocketSession) -> Wire {
        Wire::WebSocket {
            path: session.path.clone(),
            secure: session.secure,
        }
    }

    fn default_port(&self) -> u16 {
        8080
    }

    fn open(&self, device: &Device, options: &ConnectOptions) -> Result<WebSocketSession> {
        let credentials = &device.credentials;
        let auth = if credentials.token.is_some() || credentials.username.is_some() {
            Some(json!({
                "device_id": device.id,
                "token": credentials.token,
                "username": credentials.username,
                "password": credentials.password,
            }))
        } else {
            None
        };
        let flag = |key: &str| {
            options
                .get_bool(key)
                .or_else(|| device.attributes.get(key).and_then(Value::as_bool))
                .unwrap_or(false)
        };
        let path = setting_str(device, options, "path").unwrap_or_else(|| "/ws".to_string());
        Ok(WebSocketSession {
            device_id: device.id.clone(),
            path: if path.starts_with('/') { path } else { format!("/{}", path) },
            secure: flag("secure"),
            auth,
            state_queries: flag("state_queries"),
        })
    }

    fn handshake(&self, session: &WebSocketSession) -> Result<Vec<Bytes>> {
        Ok(session
            .auth
            .iter()
            .map(|auth| frame(&message(kind::AUTH, auth.clone())))
            .collect())
    }

    fn encode_command(&self, _session: &WebSocketSession, command: &DeviceCommand) -> Result<Outgoing> {
        let mut envelope = message(
            kind::COMMAND,
            json!({"command": command.command, "parameters": command.parameters}),
        );
        envelope["command_id"] = json!(command.command_id);
        Ok(Outgoing::request(&command.command_id, frame(&envelope)))
    }

    fn encode_state_query(&self, session: &WebSocketSession) -> Option<Result<Outgoing>> {
        session.state_queries.then(|| {
            Ok(Outgoing::request(
                STATE_KEY,
                frame(&message(kind::GET_STATE, Value::Null)),
            ))
        })
    }

    fn encode_ping(&self, _session: &WebSocketSession) -> Option<Outgoing> {
        Some(Outgoing::request(
            PONG_KEY,
            frame(&message(kind::PING, Value::Null)),
        ))
    }

    fn decode(&self, session: &WebSocketSession, frame: &[u8]) -> Result<Vec<Decoded>> {
        let envelope: Value = serde_json::from_slice(frame)
            .map_err(|e| DeviceError::transport(Protocol::WebSocket, format!("invalid JSON: {}", e)))?;
        let data = envelope.get("data").cloned().unwrap_or(Value::Null);
        let id = &session.device_id;

        let decoded = match envelope.get("type").and_then(Value::as_str) {
            Some(kind::COMMAND_RESPONSE) => {
                let Some(command_id) = envelope.get("command_id").and_then(Value::as_str) else {
                    return Err(DeviceError::transport(
                        Protocol::WebSocket,
                        "command_response without command_id",
                    ));
                };
                match data.get("status").and_then(Value::as_str) {
                    Some("error") => Decoded::failed(
                        command_id,
                        data.get("error")
                            .and_then(Value::as_str)
                            .unwrap_or("command failed"),
                    ),
                    _ => Decoded::ok(
                        command_id,
                        data.get("result").cloned().unwrap_or(data),
                    ),
                }
            }
            Some(kind::PONG) => Decoded::ok(PONG_KEY, Value::Null),
            Some(kind::STATE) => {
                // Pushed state also answers an outstanding query
                return Ok(vec![
                    Decoded::ok(STATE_KEY, data.clone()),
                    Decoded::message(InboundKind::State, topic::state(id), data),
                ]);
            }
            Some(kind::TELEMETRY) => {
                Decoded::message(InboundKind::Telemetry, topic::telemetry(id), data)
            }
            Some(kind::EVENT) => Decoded::message(InboundKind::Event, topic::events(id), data),
            Some(kind::AUTH_RESPONSE) => {
                if data.get("authenticated").and_then(Value::as_bool) == Some(true) {
                    return Ok(Vec::new());
                }
                Decoded::message(
                    InboundKind::Status,
                    topic::status(id),
                    json!({"status": "offline", "reason": "auth_failed"}),
                )
            }
            Some(kind::PING) => Decoded::Reply(self::frame(&message(kind::PONG, Value::Null))),
            Some(other) => Decoded::message(
                InboundKind::Other,
                format!("devices/{}/{}", id, other),
                envelope.clone(),
            ),
            None => {
                return Err(DeviceError::transport(
                    Protocol::WebSocket,
                    "message without a type",
                ))
            }
        };
        Ok(vec![decoded])
    }
}
