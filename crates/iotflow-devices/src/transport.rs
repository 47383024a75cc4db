/*!
 * Links between adapters and devices.
 *
 * A [`Link`] is a pair of frame channels. Adapters never touch sockets or
 * radios directly: they ask a [`Connector`] for a link and exchange whole
 * frames over it. The TCP connector either splits the byte stream with
 * the protocol's [`Framing`] or, for [`Wire::WebSocket`], carries one
 * frame per WebSocket message. The in-memory connector hands the device
 * end of the link to the caller as a [`Peer`], which is how gateways are
 * simulated and how the adapters are exercised in tests.
 */
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use iotflow_core::device::Protocol;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use crate::error::{DeviceError, Result};

/// Frames buffered per direction before senders wait
const LINK_CAPACITY: usize = 256;

/// Largest frame accepted from a byte stream
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Where and how to open a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Device the link belongs to
    pub device_id: String,
    /// Protocol spoken on the link
    pub protocol: Protocol,
    /// Host name, IP, or bus address
    pub host: String,
    /// Port for stream transports
    pub port: u16,
    /// How frames travel on the link
    pub wire: Wire,
}

/// How frames travel on a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wire {
    /// Raw byte stream cut into frames
    Stream(Framing),
    /// One frame per WebSocket message
    WebSocket {
        /// Request path of the upgrade, starting with `/`
        path: String,
        /// Use `wss://`
        secure: bool,
    },
}

impl Wire {
    /// `ws://` or `wss://` URL for a WebSocket wire; `None` for streams
    pub fn url(&self, host: &str, port: u16) -> Option<String> {
        match self {
            Wire::Stream(_) => None,
            Wire::WebSocket { path, secure } => Some(format!(
                "{}://{}:{}{}",
                if *secure { "wss" } else { "ws" },
                host,
                port,
                path
            )),
        }
    }
}

/// An open, bidirectional frame channel
#[derive(Debug)]
pub struct Link {
    /// Frames towards the device
    pub outbound: mpsc::Sender<Bytes>,
    /// Frames from the device; `None` once the device side closed
    pub inbound: mpsc::Receiver<Bytes>,
}

/// Opens links to devices
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Open a link to the endpoint
    async fn open(&self, endpoint: &Endpoint) -> Result<Link>;
}

/// Shared connector handle
pub type SharedConnector = Arc<dyn Connector>;

/// Rules for cutting a byte stream into frames.
///
/// Every variant returns whole frames including their header so the
/// protocol decoder sees exactly what was on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// 4-byte big-endian length followed by the payload
    LengthPrefixed,
    /// Modbus TCP application header; length at bytes 4..6
    Mbap,
    /// LoRa header: address (1 byte) then big-endian length (2 bytes)
    LoraHeader,
    /// Fixed 13-byte CAN frame: id (4), dlc (1), data (8)
    CanFrame,
}

impl Framing {
    /// Take the next complete frame off the front of `buf`
    pub fn split(&self, buf: &mut BytesMut) -> std::result::Result<Option<Bytes>, String> {
        let total = match self {
            Framing::LengthPrefixed => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
                4 + len
            }
            Framing::Mbap => {
                if buf.len() < 7 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
                if len == 0 {
                    return Err("MBAP length of zero".to_string());
                }
                6 + len
            }
            Framing::LoraHeader => {
                if buf.len() < 3 {
                    return Ok(None);
                }
                3 + u16::from_be_bytes([buf[1], buf[2]]) as usize
            }
            Framing::CanFrame => 13,
        };

        if total > MAX_FRAME_LEN {
            return Err(format!("frame of {} bytes exceeds limit", total));
        }
        if buf.len() < total {
            return Ok(None);
        }
        Ok(Some(buf.split_to(total).freeze()))
    }
}

/// Connects over TCP, one socket per device
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Create a connector with the given connect timeout
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl TcpConnector {
    async fn open_stream(&self, endpoint: &Endpoint, framing: Framing) -> Result<Link> {
        let addr = format!("{}:{}", endpoint.host, endpoint.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| DeviceError::timeout(&endpoint.device_id, "connect", self.connect_timeout))?
            .map_err(|e| DeviceError::connection(&endpoint.device_id, format!("{}: {}", addr, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(device_id = %endpoint.device_id, %addr, error = %e, "TCP_NODELAY not set");
        }
        debug!(device_id = %endpoint.device_id, %addr, "tcp link open");

        let (mut reader, mut writer) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(LINK_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<Bytes>(LINK_CAPACITY);

        let device_id = endpoint.device_id.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = writer.write_all(&frame).await {
                    warn!(device_id = %device_id, error = %e, "tcp write failed");
                    break;
                }
            }
            if let Err(e) = writer.shutdown().await {
                debug!(device_id = %device_id, error = %e, "tcp shutdown failed");
            }
        });

        let device_id = endpoint.device_id.clone();
        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(4096);
            loop {
                match reader.read_buf(&mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(device_id = %device_id, error = %e, "tcp read failed");
                        break;
                    }
                }
                loop {
                    match framing.split(&mut buf) {
                        Ok(Some(frame)) => {
                            if in_tx.send(frame).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(device_id = %device_id, error = %e, "dropping unframeable input");
                            buf.advance(buf.len());
                            break;
                        }
                    }
                }
            }
            trace!(device_id = %device_id, "tcp reader finished");
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }

    async fn open_websocket(&self, endpoint: &Endpoint, url: String) -> Result<Link> {
        let (socket, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
                .await
                .map_err(|_| DeviceError::timeout(&endpoint.device_id, "connect", self.connect_timeout))?
                .map_err(|e| DeviceError::connection(&endpoint.device_id, format!("{}: {}", url, e)))?;
        debug!(device_id = %endpoint.device_id, %url, "websocket link open");

        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(LINK_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<Bytes>(LINK_CAPACITY);

        let device_id = endpoint.device_id.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let message = match String::from_utf8(frame.to_vec()) {
                    Ok(text) => Message::text(text),
                    Err(_) => Message::binary(frame),
                };
                if let Err(e) = sink.send(message).await {
                    warn!(device_id = %device_id, error = %e, "websocket write failed");
                    break;
                }
            }
            if let Err(e) = sink.close().await {
                debug!(device_id = %device_id, error = %e, "websocket close failed");
            }
        });

        let device_id = endpoint.device_id.clone();
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let frame = match message {
                    Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_bytes()),
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(close)) => {
                        debug!(device_id = %device_id, ?close, "websocket closed by device");
                        break;
                    }
                    // Pings are answered by tungstenite
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(device_id = %device_id, error = %e, "websocket read failed");
                        break;
                    }
                };
                if in_tx.send(frame).await.is_err() {
                    return;
                }
            }
            trace!(device_id = %device_id, "websocket reader finished");
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self, endpoint: &Endpoint) -> Result<Link> {
        match &endpoint.wire {
            Wire::Stream(framing) => self.open_stream(endpoint, *framing).await,
            wire @ Wire::WebSocket { .. } => {
                let url = wire
                    .url(&endpoint.host, endpoint.port)
                    .unwrap_or_default();
                self.open_websocket(endpoint, url).await
            }
        }
    }
}

/// Device end of an in-memory link
#[derive(Debug)]
pub struct Peer {
    /// Frames written by the adapter
    pub from_adapter: mpsc::Receiver<Bytes>,
    /// Frames delivered to the adapter
    pub to_adapter: mpsc::Sender<Bytes>,
}

impl Peer {
    /// Wait for the next frame from the adapter
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.from_adapter.recv().await
    }

    /// Deliver a frame to the adapter
    pub async fn send<B: Into<Bytes>>(&self, frame: B) -> bool {
        self.to_adapter.send(frame.into()).await.is_ok()
    }
}

/// In-process connector. Every `open` creates a fresh channel pair and
/// parks the device end until it is claimed with [`take_peer`].
///
/// [`take_peer`]: MemoryConnector::take_peer
#[derive(Debug, Default)]
pub struct MemoryConnector {
    peers: DashMap<String, Peer>,
    refused: DashMap<String, String>,
    opened: AtomicUsize,
}

impl MemoryConnector {
    /// Create a connector
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the device end of the most recent link to `device_id`
    pub fn take_peer(&self, device_id: &str) -> Option<Peer> {
        self.peers.remove(device_id).map(|(_, peer)| peer)
    }

    /// Make future opens to `device_id` fail with `reason`
    pub fn refuse<S: Into<String>>(&self, device_id: &str, reason: S) {
        self.refused.insert(device_id.to_string(), reason.into());
    }

    /// Allow opens to `device_id` again
    pub fn accept(&self, device_id: &str) {
        self.refused.remove(device_id);
    }

    /// Total number of links opened
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, endpoint: &Endpoint) -> Result<Link> {
        if let Some(reason) = self.refused.get(&endpoint.device_id) {
            return Err(DeviceError::connection(&endpoint.device_id, reason.value().clone()));
        }
        let (out_tx, out_rx) = mpsc::channel(LINK_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(LINK_CAPACITY);
        self.peers.insert(
            endpoint.device_id.clone(),
            Peer {
                from_adapter: out_rx,
                to_adapter: in_tx,
            },
        );
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn endpoint(id: &str) -> Endpoint {
        Endpoint {
            device_id: id.to_string(),
            protocol: Protocol::WebSocket,
            host: "127.0.0.1".into(),
            port: 0,
            wire: Wire::Stream(Framing::LengthPrefixed),
        }
    }

    #[test]
    fn test_length_prefixed_split() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_slice(b"abc");
        buf.put_u32(2);
        buf.put_slice(b"x");

        let first = Framing::LengthPrefixed.split(&mut buf).unwrap().unwrap();
        assert_eq!(&first[..], b"\x00\x00\x00\x03abc");
        assert_eq!(Framing::LengthPrefixed.split(&mut buf).unwrap(), None);
        buf.put_slice(b"y");
        let second = Framing::LengthPrefixed.split(&mut buf).unwrap().unwrap();
        assert_eq!(&second[4..], b"xy");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_mbap_split() {
        // transaction 1, protocol 0, length 6, unit 1, fc 3, addr 0, count 2
        let mut buf = BytesMut::from(&[0, 1, 0, 0, 0, 6, 1, 3, 0, 0, 0, 2, 0xAA][..]);
        let frame = Framing::Mbap.split(&mut buf).unwrap().unwrap();
        assert_eq!(frame.len(), 12);
        assert_eq!(&buf[..], &[0xAA]);
    }

    #[test]
    fn test_lora_and_can_split() {
        let mut buf = BytesMut::from(&[0x05, 0x00, 0x02, b'h', b'i', 0x09][..]);
        let frame = Framing::LoraHeader.split(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], &[0x05, 0x00, 0x02, b'h', b'i']);

        let mut buf = BytesMut::from(&[0u8; 12][..]);
        assert_eq!(Framing::CanFrame.split(&mut buf).unwrap(), None);
        buf.put_u8(0);
        assert_eq!(Framing::CanFrame.split(&mut buf).unwrap().unwrap().len(), 13);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        assert!(Framing::LengthPrefixed.split(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_memory_connector_round_trip() {
        let connector = MemoryConnector::new();
        let mut link = connector.open(&endpoint("dev-1")).await.unwrap();
        let mut peer = connector.take_peer("dev-1").unwrap();

        link.outbound.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(peer.recv().await.unwrap(), Bytes::from_static(b"ping"));

        assert!(peer.send(Bytes::from_static(b"pong")).await);
        assert_eq!(link.inbound.recv().await.unwrap(), Bytes::from_static(b"pong"));

        drop(peer);
        assert!(link.inbound.recv().await.is_none());
        assert_eq!(connector.open_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_connector_refuse() {
        let connector = MemoryConnector::new();
        connector.refuse("dev-2", "credentials rejected");
        let err = connector.open(&endpoint("dev-2")).await.unwrap_err();
        assert!(matches!(err, DeviceError::Connection { .. }));
        connector.accept("dev-2");
        assert!(connector.open(&endpoint("dev-2")).await.is_ok());
    }

    #[test_log::test(tokio::test)]
    async fn test_tcp_link_reassembles_frames_and_closes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 7];
            stream.read_exact(&mut request).await.unwrap();
            // one frame written in two pieces
            stream.write_all(&[0, 0, 0, 2, b'o']).await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            stream.write_all(b"k").await.unwrap();
            // the link's writer shuts down once its sender is dropped
            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).await.unwrap();
            (request, rest)
        });

        let endpoint = Endpoint {
            port,
            ..endpoint("meter")
        };
        let mut link = TcpConnector::default().open(&endpoint).await.unwrap();
        link.outbound
            .send(Bytes::from_static(b"\x00\x00\x00\x03abc"))
            .await
            .unwrap();
        assert_eq!(
            link.inbound.recv().await.unwrap(),
            Bytes::from_static(b"\x00\x00\x00\x02ok")
        );

        drop(link.outbound);
        let (request, rest) = server.await.unwrap();
        assert_eq!(&request, b"\x00\x00\x00\x03abc");
        assert!(rest.is_empty());
        assert!(link.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_tcp_endpoint() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let endpoint = Endpoint {
            port,
            ..endpoint("meter")
        };
        let err = TcpConnector::default().open(&endpoint).await.unwrap_err();
        assert!(matches!(err, DeviceError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_websocket_link_sends_text_messages() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
            let first = socket.next().await.unwrap().unwrap();
            socket
                .send(Message::text(r#"{"type":"pong"}"#))
                .await
                .unwrap();
            first
        });

        let endpoint = Endpoint {
            port,
            wire: Wire::WebSocket {
                path: "/ws".into(),
                secure: false,
            },
            ..endpoint("panel")
        };
        let mut link = TcpConnector::default().open(&endpoint).await.unwrap();
        link.outbound
            .send(Bytes::from_static(br#"{"type":"ping"}"#))
            .await
            .unwrap();

        let received = server.await.unwrap();
        assert!(received.is_text());
        assert_eq!(received.into_text().unwrap().as_str(), r#"{"type":"ping"}"#);
        assert_eq!(
            link.inbound.recv().await.unwrap(),
            Bytes::from_static(br#"{"type":"pong"}"#)
        );
    }

    #[test]
    fn test_websocket_url() {
        let wire = Wire::WebSocket {
            path: "/ws".into(),
            secure: true,
        };
        assert_eq!(wire.url("10.0.0.4", 8443).as_deref(), Some("wss://10.0.0.4:8443/ws"));
        assert_eq!(Wire::Stream(Framing::Mbap).url("h", 502), None);
    }
}
