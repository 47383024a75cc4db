/*!
 * Built-in protocol adapters.
 *
 * One module per protocol. MQTT and HTTP have adapters of their own on
 * top of `rumqttc` and `reqwest`; every other protocol provides a
 * [`Dialect`] that a [`FramedAdapter`] drives. [`builtin_adapters`] wires
 * all of them.
 */
use std::sync::Arc;

use crate::adapter::SharedAdapter;
use crate::discovery::DiscoverySource;
use crate::framed::{Dialect, FramedAdapter};
use crate::transport::SharedConnector;

pub mod ble;
pub mod can;
pub mod coap;
pub mod http;
pub mod lora;
pub mod modbus;
pub mod mqtt;
pub mod obd2;
pub mod websocket;
pub mod zigbee;

pub use ble::BleDialect;
pub use can::CanDialect;
pub use coap::CoapDialect;
pub use http::HttpAdapter;
pub use lora::LoraDialect;
pub use modbus::ModbusDialect;
pub use mqtt::{MqttAdapter, MqttConfig};
pub use obd2::Obd2Dialect;
pub use websocket::WebSocketDialect;
pub use zigbee::ZigbeeDialect;

fn framed<D: Dialect>(
    dialect: D,
    connector: &SharedConnector,
    source: &Option<Arc<dyn DiscoverySource>>,
) -> SharedAdapter {
    let adapter = FramedAdapter::new(dialect, connector.clone());
    match source {
        Some(source) => Arc::new(adapter.with_discovery(source.clone())),
        None => Arc::new(adapter),
    }
}

/// One adapter per protocol, all opening links through `connector` and
/// answering discovery through `source` when one is given
pub fn builtin_adapters(
    connector: SharedConnector,
    source: Option<Arc<dyn DiscoverySource>>,
) -> Vec<SharedAdapter> {
    let mqtt = MqttAdapter::default();
    let http = HttpAdapter::default();
    let (mqtt, http) = match &source {
        Some(source) => (
            mqtt.with_discovery(source.clone()),
            http.with_discovery(source.clone()),
        ),
        None => (mqtt, http),
    };
    vec![
        Arc::new(mqtt),
        framed(CoapDialect, &connector, &source),
        framed(ModbusDialect, &connector, &source),
        framed(BleDialect, &connector, &source),
        framed(ZigbeeDialect, &connector, &source),
        framed(LoraDialect, &connector, &source),
        framed(WebSocketDialect, &connector, &source),
        Arc::new(http),
        framed(CanDialect, &connector, &source),
        framed(Obd2Dialect, &connector, &source),
    ]
}

pub(crate) fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub(crate) fn decode_hex(text: &str) -> Option<Vec<u8>> {
    let text = text.trim_start_matches("0x");
    if text.len() % 2 != 0 || !text.is_ascii() {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_helpers() {
        assert_eq!(encode_hex(&[0x0a, 0xff]), "0aff");
        assert_eq!(decode_hex("0x0AfF"), Some(vec![0x0a, 0xff]));
        assert_eq!(decode_hex("abc"), None);
        assert_eq!(decode_hex("zz"), None);
    }
}
