/*!
 * CoAP adapter.
 *
 * RFC 7252 messages, one per length-prefixed frame. Commands are `POST
 * /commands` with the JSON envelope, state is `GET /state` and health
 * checks query `GET /.well-known/core`. Requests are confirmable and
 * correlated by token. Subscriptions register an observation on the
 * filter's path.
 */
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Mutex;

use bytes::{BufMut, Bytes, BytesMut};
use iotflow_core::device::{Device, DeviceCommand, Protocol};
use iotflow_core::types::Value;
use tracing::debug;

use crate::adapter::{ConnectOptions, InboundKind};
use crate::error::{DeviceError, Result};
use crate::framed::{Decoded, Dialect, Outgoing};
use crate::transport::{Framing, Wire};

use super::encode_hex;

/// Message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    #[allow(missing_docs)]
    Confirmable = 0,
    #[allow(missing_docs)]
    NonConfirmable = 1,
    #[allow(missing_docs)]
    Acknowledgement = 2,
    #[allow(missing_docs)]
    Reset = 3,
}

impl MessageType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }
}

/// Method and response codes used here, as `class << 5 | detail`
pub mod code {
    #![allow(missing_docs)]
    pub const EMPTY: u8 = 0x00;
    pub const GET: u8 = 0x01;
    pub const POST: u8 = 0x02;
    pub const PUT: u8 = 0x03;
    pub const CHANGED: u8 = 0x44;
    pub const CONTENT: u8 = 0x45;

    /// Render as `c.dd`
    pub fn display(code: u8) -> String {
        format!("{}.{:02}", code >> 5, code & 0x1F)
    }
}

/// Option numbers used here
pub mod option {
    #![allow(missing_docs)]
    pub const OBSERVE: u16 = 6;
    pub const URI_PATH: u16 = 11;
    pub const CONTENT_FORMAT: u16 = 12;

    /// `application/json`
    pub const JSON: u8 = 50;
}

/// One CoAP message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    #[allow(missing_docs)]
    pub kind: MessageType,
    #[allow(missing_docs)]
    pub code: u8,
    #[allow(missing_docs)]
    pub message_id: u16,
    #[allow(missing_docs)]
    pub token: Vec<u8>,
    /// Options sorted by number
    pub options: Vec<(u16, Vec<u8>)>,
    #[allow(missing_docs)]
    pub payload: Bytes,
}

impl Message {
    /// A confirmable request to `path`
    pub fn request(code: u8, message_id: u16, token: Vec<u8>, path: &str) -> Self {
        let mut message = Self {
            kind: MessageType::Confirmable,
            code,
            message_id,
            token,
            options: Vec::new(),
            payload: Bytes::new(),
        };
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            message.options.push((option::URI_PATH, segment.as_bytes().to_vec()));
        }
        message
    }

    /// Attach a JSON payload
    pub fn with_json(mut self, value: &Value) -> Self {
        self.set_option(option::CONTENT_FORMAT, vec![option::JSON]);
        self.payload = Bytes::from(value.to_string());
        self
    }

    /// Add an option, keeping the list sorted
    pub fn set_option(&mut self, number: u16, value: Vec<u8>) {
        let at = self
            .options
            .iter()
            .position(|(n, _)| *n > number)
            .unwrap_or(self.options.len());
        self.options.insert(at, (number, value));
    }

    /// The request path joined from its Uri-Path options
    pub fn path(&self) -> String {
        self.options
            .iter()
            .filter(|(n, _)| *n == option::URI_PATH)
            .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Whether the code is a request method
    pub fn is_request(&self) -> bool {
        self.code != code::EMPTY && self.code >> 5 == 0
    }

    /// Whether the code is a 2.xx success
    pub fn is_success(&self) -> bool {
        self.code >> 5 == 2
    }

    /// Payload parsed as JSON, or as a string when it is not JSON
    pub fn json(&self) -> Value {
        if self.payload.is_empty() {
            return Value::Null;
        }
        serde_json::from_slice(&self.payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&self.payload).into_owned()))
    }

    /// Serialize without framing
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + self.payload.len());
        buf.put_u8(0x40 | ((self.kind as u8) << 4) | (self.token.len() as u8 & 0x0F));
        buf.put_u8(self.code);
        buf.put_u16(self.message_id);
        buf.put_slice(&self.token);

        let mut last = 0u16;
        for (number, value) in &self.options {
            let delta = number - last;
            last = *number;
            let (delta_nibble, delta_ext) = nibble(delta);
            let (len_nibble, len_ext) = nibble(value.len() as u16);
            buf.put_u8((delta_nibble << 4) | len_nibble);
            buf.put_slice(&delta_ext);
            buf.put_slice(&len_ext);
            buf.put_slice(value);
        }
        if !self.payload.is_empty() {
            buf.put_u8(0xFF);
            buf.put_slice(&self.payload);
        }
        buf.freeze()
    }

    /// Parse a message without framing
    pub fn decode(raw: &[u8]) -> std::result::Result<Message, String> {
        if raw.len() < 4 {
            return Err("message shorter than header".to_string());
        }
        if raw[0] >> 6 != 1 {
            return Err(format!("unsupported version {}", raw[0] >> 6));
        }
        let kind = MessageType::from_bits(raw[0] >> 4);
        let tkl = (raw[0] & 0x0F) as usize;
        if tkl > 8 {
            return Err("token longer than 8 bytes".to_string());
        }
        let code = raw[1];
        let message_id = u16::from_be_bytes([raw[2], raw[3]]);
        let token = raw
            .get(4..4 + tkl)
            .ok_or("truncated token")?
            .to_vec();

        let mut pos = 4 + tkl;
        let mut options = Vec::new();
        let mut number = 0u16;
        let mut payload = Bytes::new();
        while pos < raw.len() {
            let byte = raw[pos];
            pos += 1;
            if byte == 0xFF {
                payload = Bytes::copy_from_slice(&raw[pos..]);
                break;
            }
            let delta = extended(byte >> 4, raw, &mut pos)?;
            let len = extended(byte & 0x0F, raw, &mut pos)? as usize;
            number = number
                .checked_add(delta)
                .ok_or("option number overflow")?;
            let value = raw.get(pos..pos + len).ok_or("truncated option")?;
            options.push((number, value.to_vec()));
            pos += len;
        }

        Ok(Message {
            kind,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }
}

fn nibble(value: u16) -> (u8, Vec<u8>) {
    match value {
        0..=12 => (value as u8, Vec::new()),
        13..=268 => (13, vec![(value - 13) as u8]),
        _ => (14, (value - 269).to_be_bytes().to_vec()),
    }
}

fn extended(nibble: u8, raw: &[u8], pos: &mut usize) -> std::result::Result<u16, String> {
    match nibble {
        0..=12 => Ok(nibble as u16),
        13 => {
            let b = *raw.get(*pos).ok_or("truncated option")?;
            *pos += 1;
            Ok(b as u16 + 13)
        }
        14 => {
            let b = raw.get(*pos..*pos + 2).ok_or("truncated option")?;
            *pos += 2;
            Ok(u16::from_be_bytes([b[0], b[1]]).saturating_add(269))
        }
        _ => Err("reserved option nibble".to_string()),
    }
}

fn frame(message: &Message) -> Bytes {
    let body = message.encode();
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    buf.freeze()
}

fn kind_for_path(path: &str) -> InboundKind {
    match path.rsplit('/').next().unwrap_or_default() {
        "telemetry" => InboundKind::Telemetry,
        "state" => InboundKind::State,
        "events" => InboundKind::Event,
        "status" => InboundKind::Status,
        _ => InboundKind::Other,
    }
}

/// Constrained request/response dialect
#[derive(Debug, Default)]
pub struct CoapDialect;

/// Per-session CoAP state
#[derive(Debug)]
pub struct CoapSession {
    next_message_id: AtomicU16,
    next_token: AtomicU32,
    /// Observation token (hex) → observed path
    observations: Mutex<HashMap<String, String>>,
}

impl CoapSession {
    fn next_ids(&self) -> (u16, Vec<u8>) {
        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let token = self.next_token.fetch_add(1, Ordering::SeqCst).to_be_bytes().to_vec();
        (message_id, token)
    }

    fn observed_path(&self, token: &str) -> Option<String> {
        self.observations
            .lock()
            .ok()
            .and_then(|o| o.get(token).cloned())
    }

    fn request(&self, code: u8, path: &str) -> (String, Message) {
        let (message_id, token) = self.next_ids();
        (encode_hex(&token), Message::request(code, message_id, token, path))
    }
}

impl Dialect for CoapDialect {
    type Session = CoapSession;

    fn protocol(&self) -> Protocol {
        Protocol::Coap
    }

    fn wire(&self, _session: &CoapSession) -> Wire {
        Wire::Stream(Framing::LengthPrefixed)
    }

    fn default_port(&self) -> u16 {
        5683
    }

    fn open(&self, _device: &Device, _options: &ConnectOptions) -> Result<CoapSession> {
        Ok(CoapSession {
            next_message_id: AtomicU16::new(1),
            next_token: AtomicU32::new(1),
            observations: Mutex::new(HashMap::new()),
        })
    }

    fn encode_command(&self, session: &CoapSession, command: &DeviceCommand) -> Result<Outgoing> {
        let (key, message) = session.request(code::POST, "commands");
        let message = message.with_json(&command.envelope());
        Ok(Outgoing::request(key, frame(&message)))
    }

    fn encode_state_query(&self, session: &CoapSession) -> Option<Result<Outgoing>> {
        let (key, message) = session.request(code::GET, "state");
        Some(Ok(Outgoing::request(key, frame(&message))))
    }

    fn encode_ping(&self, session: &CoapSession) -> Option<Outgoing> {
        let (key, message) = session.request(code::GET, ".well-known/core");
        Some(Outgoing::request(key, frame(&message)))
    }

    fn validate_filter(&self, filter: &str) -> Result<()> {
        if filter.trim_matches('/').is_empty() || filter.contains('#') || filter.contains('+') {
            return Err(DeviceError::transport(
                Protocol::Coap,
                format!("'{}' is not a resource path", filter),
            ));
        }
        Ok(())
    }

    fn encode_subscribe(&self, session: &CoapSession, filter: &str) -> Result<Vec<Bytes>> {
        let path = filter.trim_matches('/').to_string();
        let (key, mut message) = session.request(code::GET, &path);
        message.set_option(option::OBSERVE, Vec::new());
        if let Ok(mut observations) = session.observations.lock() {
            observations.insert(key, path);
        }
        Ok(vec![frame(&message)])
    }

    fn encode_unsubscribe(&self, session: &CoapSession, filter: &str) -> Vec<Bytes> {
        let path = filter.trim_matches('/');
        let token = session.observations.lock().ok().and_then(|mut observations| {
            let token = observations
                .iter()
                .find(|(_, p)| p.as_str() == path)
                .map(|(t, _)| t.clone())?;
            observations.remove(&token);
            Some(token)
        });
        let Some(token) = token else {
            return Vec::new();
        };
        let (message_id, _) = session.next_ids();
        let raw_token = (0..token.len())
            .step_by(2)
            .filter_map(|i| u8::from_str_radix(&token[i..i + 2], 16).ok())
            .collect();
        let mut message = Message::request(code::GET, message_id, raw_token, path);
        // Observe = 1 deregisters
        message.set_option(option::OBSERVE, vec![1]);
        vec![frame(&message)]
    }

    fn matches(&self, filter: &str, message: &crate::adapter::InboundMessage) -> bool {
        filter.trim_matches('/') == message.topic.trim_matches('/')
    }

    fn decode(&self, session: &CoapSession, frame_bytes: &[u8]) -> Result<Vec<Decoded>> {
        let body = frame_bytes.get(4..).unwrap_or_default();
        let message = Message::decode(body).map_err(|e| DeviceError::transport(Protocol::Coap, e))?;
        let token = encode_hex(&message.token);
        let mut decoded = Vec::new();

        if message.is_request() {
            // Device-initiated report, e.g. POST /telemetry
            let path = message.path();
            if message.kind == MessageType::Confirmable {
                let ack = Message {
                    kind: MessageType::Acknowledgement,
                    code: code::CHANGED,
                    message_id: message.message_id,
                    token: message.token.clone(),
                    options: Vec::new(),
                    payload: Bytes::new(),
                };
                decoded.push(Decoded::Reply(frame(&ack)));
            }
            decoded.push(Decoded::message(kind_for_path(&path), path, message.json()));
            return Ok(decoded);
        }

        if message.code == code::EMPTY {
            // Empty ACK: the real response follows separately
            debug!(message_id = message.message_id, "empty acknowledgement");
            return Ok(decoded);
        }

        if message.kind == MessageType::Confirmable {
            let ack = Message {
                kind: MessageType::Acknowledgement,
                code: code::EMPTY,
                message_id: message.message_id,
                token: Vec::new(),
                options: Vec::new(),
                payload: Bytes::new(),
            };
            decoded.push(Decoded::Reply(frame(&ack)));
        }

        if let Some(path) = session.observed_path(&token) {
            decoded.push(Decoded::message(kind_for_path(&path), path, message.json()));
        } else if message.is_success() {
            decoded.push(Decoded::ok(token, message.json()));
        } else {
            let detail = match message.json() {
                Value::Null => String::new(),
                Value::String(s) => format!(": {}", s),
                other => format!(": {}", other),
            };
            decoded.push(Decoded::failed(
                token,
                format!("{}{}", code::display(message.code), detail),
            ));
        }
        Ok(decoded)
    }
}
