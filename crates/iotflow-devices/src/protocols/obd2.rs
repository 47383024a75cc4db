/*!
 * OBD-II adapter.
 *
 * Diagnostic requests go out as ISO-TP single frames on the functional
 * broadcast id and engine control units answer on 0x7E8 to 0x7EF.
 * Requests are correlated by service mode and PID, so only one query per
 * PID can be outstanding on a vehicle at a time.
 */
use iotflow_core::device::{Device, DeviceCommand, DeviceState, Protocol};
use iotflow_core::types::{as_number, Value};
use serde_json::json;

use crate::adapter::{ConnectOptions, InboundKind};
use crate::error::{DeviceError, Result};
use crate::framed::{Decoded, Dialect, Outgoing};
use crate::topic;
use crate::transport::{Framing, Wire};

use super::can::CanFrame;

/// Functional request id every ECU listens on
pub const REQUEST_ID: u32 = 0x7DF;
/// Response id range
pub const RESPONSE_IDS: std::ops::RangeInclusive<u32> = 0x7E8..=0x7EF;

const PADDING: u8 = 0x55;
const NEGATIVE_RESPONSE: u8 = 0x7F;

/// Service modes
pub mod mode {
    #![allow(missing_docs)]
    pub const CURRENT_DATA: u8 = 0x01;
    pub const STORED_DTCS: u8 = 0x03;
    pub const CLEAR_DTCS: u8 = 0x04;
}

/// Mode 01 PIDs with a decoder
pub mod pid {
    #![allow(missing_docs)]
    pub const SUPPORTED: u8 = 0x00;
    pub const ENGINE_LOAD: u8 = 0x04;
    pub const COOLANT_TEMP: u8 = 0x05;
    pub const ENGINE_RPM: u8 = 0x0C;
    pub const VEHICLE_SPEED: u8 = 0x0D;
    pub const THROTTLE: u8 = 0x11;
    pub const FUEL_LEVEL: u8 = 0x2F;
}

/// Metric name of a decodable PID
pub fn pid_name(code: u8) -> Option<&'static str> {
    Some(match code {
        pid::ENGINE_LOAD => "engine_load",
        pid::COOLANT_TEMP => "coolant_temp",
        pid::ENGINE_RPM => "rpm",
        pid::VEHICLE_SPEED => "speed",
        pid::THROTTLE => "throttle",
        pid::FUEL_LEVEL => "fuel_level",
        _ => return None,
    })
}

fn pid_by_name(name: &str) -> Option<u8> {
    [
        pid::ENGINE_LOAD,
        pid::COOLANT_TEMP,
        pid::ENGINE_RPM,
        pid::VEHICLE_SPEED,
        pid::THROTTLE,
        pid::FUEL_LEVEL,
    ]
    .into_iter()
    .find(|code| pid_name(*code) == Some(name))
}

/// Apply the standard formula for a mode 01 PID
pub fn decode_pid(code: u8, data: &[u8]) -> Option<f64> {
    let a = *data.first()? as f64;
    let b = || data.get(1).map(|b| *b as f64);
    Some(match code {
        pid::ENGINE_LOAD | pid::THROTTLE | pid::FUEL_LEVEL => a * 100.0 / 255.0,
        pid::COOLANT_TEMP => a - 40.0,
        pid::ENGINE_RPM => (256.0 * a + b()?) / 4.0,
        pid::VEHICLE_SPEED => a,
        _ => return None,
    })
}

/// Render a two-byte trouble code, e.g. `P0133`
pub fn decode_dtc(a: u8, b: u8) -> String {
    let system = ['P', 'C', 'B', 'U'][(a >> 6) as usize];
    format!("{}{}{:X}{:02X}", system, (a >> 4) & 0x03, a & 0x0F, b)
}

fn key(service: u8, code: Option<u8>) -> String {
    match code {
        Some(code) => format!("{:02X}:{:02X}", service, code),
        None => format!("{:02X}", service),
    }
}

fn request(service: u8, code: Option<u8>) -> Result<Outgoing> {
    let mut data = match code {
        Some(code) => vec![0x02, service, code],
        None => vec![0x01, service],
    };
    data.resize(8, PADDING);
    let frame = CanFrame::new(REQUEST_ID, &data)
        .map_err(|e| DeviceError::transport(Protocol::Obd2, e))?;
    Ok(Outgoing::request(key(service, code), frame.encode()))
}

fn negative_response_name(code: u8) -> &'static str {
    match code {
        0x11 => "service not supported",
        0x12 => "sub-function not supported",
        0x13 => "incorrect message length",
        0x22 => "conditions not correct",
        0x31 => "request out of range",
        0x78 => "response pending",
        _ => "rejected",
    }
}

/// On-board diagnostics dialect
#[derive(Debug, Default)]
pub struct Obd2Dialect;

/// The vehicle being diagnosed
#[derive(Debug)]
pub struct Obd2Session {
    device_id: String,
}

impl Dialect for Obd2Dialect {
    type Session = Obd2Session;

    fn protocol(&self) -> Protocol {
        Protocol::Obd2
    }

    fn wire(&self, _session: &Obd2Session) -> Wire {
        Wire::Stream(Framing::CanFrame)
    }

    fn default_port(&self) -> u16 {
        35000
    }

    fn open(&self, device: &Device, _options: &ConnectOptions) -> Result<Obd2Session> {
        Ok(Obd2Session {
            device_id: device.id.clone(),
        })
    }

    fn encode_command(&self, _session: &Obd2Session, command: &DeviceCommand) -> Result<Outgoing> {
        match command.command.as_str() {
            "read_pid" => {
                let code = match command.param("pid") {
                    Some(Value::String(name)) if pid_by_name(name).is_some() => pid_by_name(name),
                    _ => command.param_u64("pid").and_then(|p| u8::try_from(p).ok()),
                };
                let code = code.ok_or_else(|| {
                    DeviceError::invalid_command(&command.command, "'pid' must be a PID number or name")
                })?;
                request(mode::CURRENT_DATA, Some(code))
            }
            "read_dtcs" => request(mode::STORED_DTCS, None),
            "clear_dtcs" => request(mode::CLEAR_DTCS, None),
            other => Err(DeviceError::invalid_command(
                other,
                "expected read_pid, read_dtcs or clear_dtcs",
            )),
        }
    }

    fn encode_state_query(&self, _session: &Obd2Session) -> Option<Result<Outgoing>> {
        Some(request(mode::CURRENT_DATA, Some(pid::ENGINE_RPM)))
    }

    fn encode_ping(&self, _session: &Obd2Session) -> Option<Outgoing> {
        request(mode::CURRENT_DATA, Some(pid::SUPPORTED)).ok()
    }

    fn apply_state(&self, result: &Value, state: &mut DeviceState) {
        if let Some(fields) = result.as_object() {
            for (name, value) in fields {
                if let Some(reading) = as_number(value) {
                    state.record_metric(name, reading);
                }
            }
        }
        state.online = true;
    }

    fn decode(&self, session: &Obd2Session, frame: &[u8]) -> Result<Vec<Decoded>> {
        let frame = CanFrame::decode(frame).map_err(|e| DeviceError::transport(Protocol::Obd2, e))?;
        if !RESPONSE_IDS.contains(&frame.id) {
            return Ok(Vec::new());
        }
        let len = *frame.data.first().unwrap_or(&0) as usize;
        let Some(payload) = frame.data.get(1..1 + len) else {
            return Err(DeviceError::transport(
                Protocol::Obd2,
                format!("single frame length {} exceeds data", len),
            ));
        };
        let Some((&service, rest)) = payload.split_first() else {
            return Ok(Vec::new());
        };

        if service == NEGATIVE_RESPONSE {
            let requested = rest.first().copied().unwrap_or(0);
            let reason = rest.get(1).copied().unwrap_or(0);
            // No PID is echoed, so rejected PID queries run into their timeout
            let message = format!(
                "mode {:02X} {} (0x{:02X})",
                requested,
                negative_response_name(reason),
                reason
            );
            return Ok(vec![Decoded::failed(key(requested, None), message)]);
        }

        let service = service.wrapping_sub(0x40);
        let decoded = match service {
            mode::CURRENT_DATA => {
                let Some((&code, data)) = rest.split_first() else {
                    return Ok(Vec::new());
                };
                let key = key(service, Some(code));
                match (pid_name(code), decode_pid(code, data)) {
                    (Some(name), Some(value)) => {
                        let reading = json!({ name: value });
                        return Ok(vec![
                            Decoded::ok(key, reading.clone()),
                            Decoded::message(
                                InboundKind::Telemetry,
                                topic::telemetry(&session.device_id),
                                reading,
                            ),
                        ]);
                    }
                    _ => Decoded::ok(
                        key,
                        json!({ "pid": code, "data": super::encode_hex(data) }),
                    ),
                }
            }
            mode::STORED_DTCS => {
                let codes = rest.get(1..).unwrap_or_default();
                let dtcs: Vec<String> = codes
                    .chunks_exact(2)
                    .filter(|pair| pair[0] != 0 || pair[1] != 0)
                    .map(|pair| decode_dtc(pair[0], pair[1]))
                    .collect();
                Decoded::ok(key(service, None), json!({ "dtcs": dtcs }))
            }
            mode::CLEAR_DTCS => Decoded::ok(key(service, None), json!({ "cleared": true })),
            _ => return Ok(Vec::new()),
        };
        Ok(vec![decoded])
    }
}
