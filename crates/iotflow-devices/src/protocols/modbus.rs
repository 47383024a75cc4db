/*!
 * Modbus TCP adapter.
 *
 * Register-level commands map straight onto function codes. Device-level
 * commands are translated through the device attributes:
 *
 * - `unit_id`: slave address (default 1)
 * - `power_coil`: coil written by `turn_on` / `turn_off` (default 0)
 * - `registers`: object mapping a state name to a holding register, used
 *   by `set_<name>` commands and by state reads
 *
 * Requests are correlated by MBAP transaction id. Exception responses are
 * reported as failed command responses.
 */
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;

use bytes::{BufMut, Bytes, BytesMut};
use iotflow_core::device::{Device, DeviceCommand, DeviceState, Protocol};
use iotflow_core::types::{as_switch, Value};
use serde_json::json;

use crate::adapter::ConnectOptions;
use crate::error::{DeviceError, Result};
use crate::framed::{setting_u64, Decoded, Dialect, Outgoing};
use crate::transport::{Framing, Wire};

/// Function codes
pub mod function {
    #![allow(missing_docs)]
    pub const READ_COILS: u8 = 0x01;
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
}

/// Human-readable exception code
pub fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        0x08 => "memory parity error",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target device failed to respond",
        _ => "unknown exception",
    }
}

/// A protocol data unit addressed to one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Function 1–4: read `count` items starting at `address`
    Read {
        #[allow(missing_docs)]
        function: u8,
        #[allow(missing_docs)]
        address: u16,
        #[allow(missing_docs)]
        count: u16,
    },
    #[allow(missing_docs)]
    WriteCoil { address: u16, value: bool },
    #[allow(missing_docs)]
    WriteRegister { address: u16, value: u16 },
    #[allow(missing_docs)]
    WriteCoils { address: u16, values: Vec<bool> },
    #[allow(missing_docs)]
    WriteRegisters { address: u16, values: Vec<u16> },
}

impl Request {
    fn pdu(&self, buf: &mut BytesMut) {
        match self {
            Request::Read {
                function,
                address,
                count,
            } => {
                buf.put_u8(*function);
                buf.put_u16(*address);
                buf.put_u16(*count);
            }
            Request::WriteCoil { address, value } => {
                buf.put_u8(function::WRITE_SINGLE_COIL);
                buf.put_u16(*address);
                buf.put_u16(if *value { 0xFF00 } else { 0x0000 });
            }
            Request::WriteRegister { address, value } => {
                buf.put_u8(function::WRITE_SINGLE_REGISTER);
                buf.put_u16(*address);
                buf.put_u16(*value);
            }
            Request::WriteCoils { address, values } => {
                buf.put_u8(function::WRITE_MULTIPLE_COILS);
                buf.put_u16(*address);
                buf.put_u16(values.len() as u16);
                let packed = pack_bits(values);
                buf.put_u8(packed.len() as u8);
                buf.put_slice(&packed);
            }
            Request::WriteRegisters { address, values } => {
                buf.put_u8(function::WRITE_MULTIPLE_REGISTERS);
                buf.put_u16(*address);
                buf.put_u16(values.len() as u16);
                buf.put_u8((values.len() * 2) as u8);
                for value in values {
                    buf.put_u16(*value);
                }
            }
        }
    }

    /// Frame with an MBAP header
    pub fn encode(&self, transaction_id: u16, unit_id: u8) -> Bytes {
        let mut pdu = BytesMut::new();
        self.pdu(&mut pdu);
        let mut buf = BytesMut::with_capacity(7 + pdu.len());
        buf.put_u16(transaction_id);
        buf.put_u16(0);
        buf.put_u16((pdu.len() + 1) as u16);
        buf.put_u8(unit_id);
        buf.put_slice(&pdu);
        buf.freeze()
    }
}

fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; (bits.len() + 7) / 8];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    packed
}

fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes.get(i / 8).map(|b| b & (1 << (i % 8)) != 0).unwrap_or(false))
        .collect()
}

/// Decoded response PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    #[allow(missing_docs)]
    Bits(Vec<bool>),
    #[allow(missing_docs)]
    Registers(Vec<u16>),
    /// Echo of a write: address and value or count
    Written {
        #[allow(missing_docs)]
        function: u8,
        #[allow(missing_docs)]
        address: u16,
        #[allow(missing_docs)]
        value: u16,
    },
    #[allow(missing_docs)]
    Exception { function: u8, code: u8 },
}

/// Split an MBAP frame into transaction id, unit id and response
pub fn decode_response(frame: &[u8]) -> std::result::Result<(u16, u8, Response), String> {
    if frame.len() < 9 {
        return Err(format!("frame of {} bytes is too short", frame.len()));
    }
    let transaction_id = u16::from_be_bytes([frame[0], frame[1]]);
    if frame[2] != 0 || frame[3] != 0 {
        return Err("protocol identifier is not Modbus".to_string());
    }
    let unit_id = frame[6];
    let fc = frame[7];
    let data = &frame[8..];

    let response = if fc & 0x80 != 0 {
        Response::Exception {
            function: fc & 0x7F,
            code: data[0],
        }
    } else {
        match fc {
            function::READ_COILS | function::READ_DISCRETE_INPUTS => {
                let count = data[0] as usize;
                let bytes = data.get(1..1 + count).ok_or("truncated bit data")?;
                Response::Bits(unpack_bits(bytes, count * 8))
            }
            function::READ_HOLDING_REGISTERS | function::READ_INPUT_REGISTERS => {
                let count = data[0] as usize;
                let bytes = data.get(1..1 + count).ok_or("truncated register data")?;
                Response::Registers(
                    bytes
                        .chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect(),
                )
            }
            function::WRITE_SINGLE_COIL
            | function::WRITE_SINGLE_REGISTER
            | function::WRITE_MULTIPLE_COILS
            | function::WRITE_MULTIPLE_REGISTERS => {
                let echo = data.get(..4).ok_or("truncated write echo")?;
                Response::Written {
                    function: fc,
                    address: u16::from_be_bytes([echo[0], echo[1]]),
                    value: u16::from_be_bytes([echo[2], echo[3]]),
                }
            }
            other => return Err(format!("unsupported function code 0x{:02X}", other)),
        }
    };
    Ok((transaction_id, unit_id, response))
}

/// Register reads waiting for their response
#[derive(Debug, Clone)]
struct ReadPlan {
    address: u16,
    count: u16,
    /// Named registers inside the read window
    names: Vec<(String, u16)>,
}

/// Industrial register dialect
#[derive(Debug, Default)]
pub struct ModbusDialect;

/// Per-session Modbus state
#[derive(Debug)]
pub struct ModbusSession {
    unit_id: u8,
    power_coil: u16,
    registers: BTreeMap<String, u16>,
    next_transaction: AtomicU16,
    reads: Mutex<HashMap<u16, ReadPlan>>,
}

impl ModbusSession {
    fn transaction(&self) -> u16 {
        self.next_transaction.fetch_add(1, Ordering::SeqCst)
    }

    fn send(&self, request: Request, plan: Option<ReadPlan>) -> Outgoing {
        let tid = self.transaction();
        if let Some(plan) = plan {
            if let Ok(mut reads) = self.reads.lock() {
                reads.insert(tid, plan);
            }
        }
        Outgoing::request(tid.to_string(), request.encode(tid, self.unit_id))
    }

    fn take_plan(&self, tid: u16) -> Option<ReadPlan> {
        self.reads.lock().ok().and_then(|mut reads| reads.remove(&tid))
    }
}

fn invalid(command: &DeviceCommand, reason: &str) -> DeviceError {
    DeviceError::invalid_command(&command.command, reason)
}

fn param_u16(command: &DeviceCommand, key: &str) -> Result<u16> {
    command
        .param_u64(key)
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| invalid(command, &format!("'{}' must be an integer 0..=65535", key)))
}

fn read_function(command: &str) -> Option<u8> {
    match command {
        "read_coils" => Some(function::READ_COILS),
        "read_discrete_inputs" => Some(function::READ_DISCRETE_INPUTS),
        "read_holding_registers" => Some(function::READ_HOLDING_REGISTERS),
        "read_input_registers" => Some(function::READ_INPUT_REGISTERS),
        _ => None,
    }
}

impl Dialect for ModbusDialect {
    type Session = ModbusSession;

    fn protocol(&self) -> Protocol {
        Protocol::Modbus
    }

    fn wire(&self, _session: &ModbusSession) -> Wire {
        Wire::Stream(Framing::Mbap)
    }

    fn default_port(&self) -> u16 {
        502
    }

    fn open(&self, device: &Device, options: &ConnectOptions) -> Result<ModbusSession> {
        let unit_id = setting_u64(device, options, "unit_id").unwrap_or(1);
        let unit_id = u8::try_from(unit_id).map_err(|_| {
            DeviceError::connection(&device.id, format!("unit id {} out of range", unit_id))
        })?;
        let registers = device
            .attributes
            .get("registers")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(name, address)| {
                        let address = address.as_u64().and_then(|a| u16::try_from(a).ok())?;
                        Some((name.clone(), address))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(ModbusSession {
            unit_id,
            power_coil: setting_u64(device, options, "power_coil").unwrap_or(0) as u16,
            registers,
            next_transaction: AtomicU16::new(1),
            reads: Mutex::new(HashMap::new()),
        })
    }

    fn encode_command(&self, session: &ModbusSession, command: &DeviceCommand) -> Result<Outgoing> {
        let name = command.command.as_str();
        if let Some(function) = read_function(name) {
            let address = param_u16(command, "address")?;
            let count = command
                .param_u64("count")
                .map(|c| c as u16)
                .unwrap_or(1);
            if count == 0 || count > 125 {
                return Err(invalid(command, "'count' must be between 1 and 125"));
            }
            let plan = ReadPlan {
                address,
                count,
                names: Vec::new(),
            };
            return Ok(session.send(
                Request::Read {
                    function,
                    address,
                    count,
                },
                Some(plan),
            ));
        }

        let request = match name {
            "write_coil" => Request::WriteCoil {
                address: param_u16(command, "address")?,
                value: command
                    .param("value")
                    .and_then(as_switch)
                    .ok_or_else(|| invalid(command, "'value' must be a boolean"))?,
            },
            "write_register" => Request::WriteRegister {
                address: param_u16(command, "address")?,
                value: param_u16(command, "value")?,
            },
            "write_coils" => Request::WriteCoils {
                address: param_u16(command, "address")?,
                values: command
                    .param("values")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(as_switch).collect())
                    .ok_or_else(|| invalid(command, "'values' must be a list of booleans"))?,
            },
            "write_registers" => Request::WriteRegisters {
                address: param_u16(command, "address")?,
                values: command
                    .param("values")
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_u64().and_then(|v| u16::try_from(v).ok()))
                            .collect()
                    })
                    .ok_or_else(|| invalid(command, "'values' must be a list of registers"))?,
            },
            "turn_on" | "turn_off" => Request::WriteCoil {
                address: session.power_coil,
                value: name == "turn_on",
            },
            other => {
                let field = other
                    .strip_prefix("set_")
                    .ok_or_else(|| invalid(command, "unsupported Modbus command"))?;
                let address = *session
                    .registers
                    .get(field)
                    .ok_or_else(|| invalid(command, &format!("no register mapped for '{}'", field)))?;
                let value = command
                    .parameters
                    .values()
                    .find_map(|v| v.as_f64())
                    .ok_or_else(|| invalid(command, "a numeric parameter is required"))?;
                Request::WriteRegister {
                    address,
                    value: value.round().clamp(0.0, u16::MAX as f64) as u16,
                }
            }
        };
        Ok(session.send(request, None))
    }

    fn encode_state_query(&self, session: &ModbusSession) -> Option<Result<Outgoing>> {
        let first = *session.registers.values().min()?;
        let last = *session.registers.values().max()?;
        let count = last - first + 1;
        if count > 125 {
            return Some(Err(DeviceError::transport(
                Protocol::Modbus,
                "mapped registers span more than 125 registers",
            )));
        }
        let plan = ReadPlan {
            address: first,
            count,
            names: session
                .registers
                .iter()
                .map(|(name, address)| (name.clone(), *address))
                .collect(),
        };
        Some(Ok(session.send(
            Request::Read {
                function: function::READ_HOLDING_REGISTERS,
                address: first,
                count,
            },
            Some(plan),
        )))
    }

    fn encode_ping(&self, session: &ModbusSession) -> Option<Outgoing> {
        let request = Request::Read {
            function: function::READ_HOLDING_REGISTERS,
            address: 0,
            count: 1,
        };
        Some(session.send(request, None))
    }

    fn decode(&self, session: &ModbusSession, frame: &[u8]) -> Result<Vec<Decoded>> {
        let (tid, _unit, response) =
            decode_response(frame).map_err(|e| DeviceError::transport(Protocol::Modbus, e))?;
        let key = tid.to_string();
        let plan = session.take_plan(tid);

        let decoded = match response {
            Response::Exception { function, code } => Decoded::failed(
                key,
                format!(
                    "exception 0x{:02X} ({}) on function 0x{:02X}",
                    code,
                    exception_name(code),
                    function
                ),
            ),
            Response::Bits(bits) => {
                let count = plan.map(|p| p.count as usize).unwrap_or(bits.len());
                Decoded::ok(key, json!({"values": &bits[..count.min(bits.len())]}))
            }
            Response::Registers(values) => {
                let mut result = json!({"values": values});
                if let Some(plan) = plan.filter(|p| !p.names.is_empty()) {
                    let named: serde_json::Map<String, Value> = plan
                        .names
                        .iter()
                        .filter_map(|(name, address)| {
                            let offset = address.checked_sub(plan.address)? as usize;
                            values.get(offset).map(|v| (name.clone(), json!(v)))
                        })
                        .collect();
                    result["named"] = Value::Object(named);
                }
                Decoded::ok(key, result)
            }
            Response::Written {
                function,
                address,
                value,
            } => Decoded::ok(
                key,
                json!({"function": function, "address": address, "value": value}),
            ),
        };
        Ok(vec![decoded])
    }

    fn apply_state(&self, result: &Value, state: &mut DeviceState) {
        if let Some(named) = result.get("named").and_then(Value::as_object) {
            state.merge_report(named);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ProtocolAdapter;
    use crate::framed::FramedAdapter;
    use crate::transport::MemoryConnector;
    use iotflow_core::device::DeviceType;
    use iotflow_core::params;
    use std::sync::Arc;

    #[test]
    fn test_read_request_encoding() {
        let raw = Request::Read {
            function: function::READ_HOLDING_REGISTERS,
            address: 0x006B,
            count: 3,
        }
        .encode(0x0001, 0x11);
        assert_eq!(
            &raw[..],
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]
        );
    }

    #[test]
    fn test_write_coils_packs_bits() {
        let raw = Request::WriteCoils {
            address: 0x13,
            values: vec![true, false, true, true, false, false, true, true, true, false],
        }
        .encode(2, 1);
        // count 10, 2 data bytes: 0xCD 0x01
        assert_eq!(&raw[7..], &[0x0F, 0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01]);
    }

    #[test]
    fn test_decode_registers_and_exception() {
        let frame = [0x00, 0x05, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x04, 0x02, 0x2B, 0x00, 0x64];
        let (tid, unit, response) = decode_response(&frame).unwrap();
        assert_eq!((tid, unit), (5, 1));
        assert_eq!(response, Response::Registers(vec![555, 100]));

        let frame = [0x00, 0x06, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02];
        let (_, _, response) = decode_response(&frame).unwrap();
        assert_eq!(
            response,
            Response::Exception {
                function: 3,
                code: 2
            }
        );
    }

    fn reply(request: &[u8], pdu: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(&request[..2]);
        buf.put_u16(0);
        buf.put_u16((pdu.len() + 1) as u16);
        buf.put_u8(request[6]);
        buf.put_slice(pdu);
        buf.freeze()
    }

    async fn connected() -> (FramedAdapter<ModbusDialect>, crate::transport::Peer) {
        let connector = Arc::new(MemoryConnector::new());
        let adapter = FramedAdapter::new(ModbusDialect, connector.clone());
        let device = Device::new("Boiler", DeviceType::Plc, Protocol::Modbus)
            .with_id("plc-1")
            .with_attribute("unit_id", json!(7))
            .with_attribute("power_coil", json!(4))
            .with_attribute("registers", json!({"temperature": 10, "brightness": 12}));
        adapter.connect(&device, ConnectOptions::new()).await.unwrap();
        let peer = connector.take_peer("plc-1").unwrap();
        (adapter, peer)
    }

    #[tokio::test]
    async fn test_turn_on_writes_power_coil() {
        let (adapter, mut peer) = connected().await;
        tokio::spawn(async move {
            let request = peer.recv().await.unwrap();
            assert_eq!(request[6], 7);
            assert_eq!(&request[7..], &[0x05, 0x00, 0x04, 0xFF, 0x00]);
            peer.send(reply(&request, &request[7..])).await;
            peer
        });
        let response = adapter
            .send_command("plc-1", DeviceCommand::new("plc-1", "turn_on"))
            .await
            .unwrap();
        assert!(response.is_ok());
        assert_eq!(response.result["address"], 4);
    }

    #[tokio::test]
    async fn test_exception_becomes_failed_response() {
        let (adapter, mut peer) = connected().await;
        tokio::spawn(async move {
            let request = peer.recv().await.unwrap();
            peer.send(reply(&request, &[0x86, 0x02])).await;
            peer
        });
        let command = DeviceCommand::new("plc-1", "write_register")
            .with_parameters(params! {"address" => 999, "value" => 1});
        let response = adapter.send_command("plc-1", command).await.unwrap();
        assert!(!response.is_ok());
        assert!(response.error.unwrap().contains("illegal data address"));
    }

    #[tokio::test]
    async fn test_read_state_maps_named_registers() {
        let (adapter, mut peer) = connected().await;
        tokio::spawn(async move {
            let request = peer.recv().await.unwrap();
            // registers 10..=12
            assert_eq!(&request[7..], &[0x03, 0x00, 0x0A, 0x00, 0x03]);
            peer.send(reply(&request, &[0x03, 0x06, 0x00, 0x15, 0x00, 0x00, 0x00, 0x50]))
                .await;
            peer
        });
        let state = adapter.read_state("plc-1").await.unwrap();
        assert_eq!(state.temperature, Some(21.0));
        assert_eq!(state.brightness, Some(80));
    }

    #[tokio::test]
    async fn test_unmapped_setter_is_rejected() {
        let (adapter, _peer) = connected().await;
        let command = DeviceCommand::new("plc-1", "set_humidity")
            .with_parameters(params! {"level" => 40});
        let err = adapter.send_command("plc-1", command).await.unwrap_err();
        assert!(matches!(err, DeviceError::InvalidCommand { .. }));
    }
}
