/*!
 * Adapters for protocols exchanged as frames over a [`Link`].
 *
 * A [`FramedAdapter`] owns one session per connected device: the outbound
 * half of the link, a receive task and the device's [`SessionHub`]. What
 * goes on the wire is decided by a [`Dialect`], one per protocol.
 *
 * [`Link`]: crate::transport::Link
 */
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use iotflow_core::device::{CommandResponse, Device, DeviceCommand, DeviceState, Protocol};
use iotflow_core::types::Value;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::adapter::{ConnectOptions, InboundKind, InboundMessage, ProtocolAdapter, Subscription};
use crate::discovery::{DiscoveredDevice, DiscoverySource};
use crate::error::{DeviceError, Result};
use crate::session::{lock, ConnectGates, SessionHub};
use crate::topic;
use crate::transport::{Endpoint, SharedConnector, Wire};

/// Deadline for opening a link when the caller gives none
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for state queries and pings
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub use crate::session::Reply;

/// Frames to send and, for requests, the key the response will carry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outgoing {
    #[allow(missing_docs)]
    pub frames: Vec<Bytes>,
    /// Correlation key; `None` means fire-and-forget
    pub key: Option<String>,
}

impl Outgoing {
    /// One frame answered by a response carrying `key`
    pub fn request<K: Into<String>>(key: K, frame: Bytes) -> Self {
        Self {
            frames: vec![frame],
            key: Some(key.into()),
        }
    }

    /// One frame nobody answers
    pub fn fire(frame: Bytes) -> Self {
        Self {
            frames: vec![frame],
            key: None,
        }
    }
}

/// What a received frame turned out to be
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Answer to an outstanding request
    Response {
        #[allow(missing_docs)]
        key: String,
        #[allow(missing_docs)]
        reply: Reply,
    },
    /// Unsolicited traffic
    Message {
        #[allow(missing_docs)]
        kind: InboundKind,
        #[allow(missing_docs)]
        topic: String,
        #[allow(missing_docs)]
        payload: Value,
    },
    /// Frame to write back on the link (acks, pongs)
    Reply(Bytes),
}

impl Decoded {
    /// A successful response
    pub fn ok<K: Into<String>>(key: K, value: Value) -> Self {
        Decoded::Response {
            key: key.into(),
            reply: Ok(value),
        }
    }

    /// A failed response
    pub fn failed<K: Into<String>, E: Into<String>>(key: K, error: E) -> Self {
        Decoded::Response {
            key: key.into(),
            reply: Err(error.into()),
        }
    }

    /// An unsolicited message
    pub fn message<T: Into<String>>(kind: InboundKind, topic: T, payload: Value) -> Self {
        Decoded::Message {
            kind,
            topic: topic.into(),
            payload,
        }
    }
}

/// The wire side of a protocol
pub trait Dialect: Send + Sync + fmt::Debug + 'static {
    /// Per-session context (addresses, sequence counters)
    type Session: Send + Sync + fmt::Debug + 'static;

    #[allow(missing_docs)]
    fn protocol(&self) -> Protocol;

    /// How frames travel on the link opened for `session`
    fn wire(&self, session: &Self::Session) -> Wire;

    /// Port used when the device record has none
    fn default_port(&self) -> u16;

    /// Build the session context. Fails when the device record lacks
    /// something the protocol needs.
    fn open(&self, device: &Device, options: &ConnectOptions) -> Result<Self::Session>;

    /// Frames sent right after the link opens
    fn handshake(&self, _session: &Self::Session) -> Result<Vec<Bytes>> {
        Ok(Vec::new())
    }

    /// Frames sent before a graceful close
    fn teardown(&self, _session: &Self::Session) -> Vec<Bytes> {
        Vec::new()
    }

    #[allow(missing_docs)]
    fn encode_command(&self, session: &Self::Session, command: &DeviceCommand) -> Result<Outgoing>;

    /// Request for a fresh state report; `None` serves the last observed state
    fn encode_state_query(&self, _session: &Self::Session) -> Option<Result<Outgoing>> {
        None
    }

    /// Liveness request; `None` treats an open link as alive
    fn encode_ping(&self, _session: &Self::Session) -> Option<Outgoing> {
        None
    }

    /// Reject filters the protocol cannot express
    fn validate_filter(&self, filter: &str) -> Result<()> {
        if topic::is_valid_filter(filter) {
            Ok(())
        } else {
            Err(DeviceError::transport(
                self.protocol(),
                format!("invalid subscription filter '{}'", filter),
            ))
        }
    }

    /// Frames announcing a new filter to the device or broker
    fn encode_subscribe(&self, _session: &Self::Session, _filter: &str) -> Result<Vec<Bytes>> {
        Ok(Vec::new())
    }

    /// Frames withdrawing a filter nobody uses any more
    fn encode_unsubscribe(&self, _session: &Self::Session, _filter: &str) -> Vec<Bytes> {
        Vec::new()
    }

    /// Whether `message` is delivered to a subscription with `filter`
    fn matches(&self, filter: &str, message: &InboundMessage) -> bool {
        topic::matches(filter, &message.topic)
    }

    /// Turn one frame into zero or more decoded items
    fn decode(&self, session: &Self::Session, frame: &[u8]) -> Result<Vec<Decoded>>;

    /// Fold a state-query result into the observed state
    fn apply_state(&self, result: &Value, state: &mut DeviceState) {
        if let Some(report) = result.as_object() {
            state.merge_report(report);
        }
    }
}

/// Read a numeric setting from the connect options, then from the device
/// attributes
pub fn setting_u64(device: &Device, options: &ConnectOptions, key: &str) -> Option<u64> {
    options.get_u64(key).or_else(|| device.attribute_u64(key))
}

/// Read a string setting from the connect options, then from the device
/// attributes
pub fn setting_str(device: &Device, options: &ConnectOptions, key: &str) -> Option<String> {
    options
        .get_string(key)
        .or_else(|| device.attribute_str(key).map(str::to_string))
}

#[derive(Debug)]
struct Session<S> {
    hub: SessionHub,
    context: S,
    outbound: mpsc::Sender<Bytes>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl<S> Session<S> {
    fn device_id(&self) -> &str {
        self.hub.device_id()
    }

    async fn send_all(&self, frames: Vec<Bytes>) -> Result<()> {
        for frame in frames {
            trace!(device_id = %self.device_id(), len = frame.len(), "frame out");
            self.outbound
                .send(frame)
                .await
                .map_err(|_| DeviceError::not_connected(self.device_id()))?;
        }
        Ok(())
    }

    fn dispatch<D: Dialect<Session = S>>(&self, dialect: &D, item: Decoded) {
        match item {
            Decoded::Response { key, reply } => self.hub.complete(&key, reply),
            Decoded::Message {
                kind,
                topic,
                payload,
            } => self
                .hub
                .deliver_with(kind, topic, payload, |filter, message| dialect.matches(filter, message)),
            Decoded::Reply(frame) => {
                if self.outbound.try_send(frame).is_err() {
                    debug!(device_id = %self.device_id(), "link busy, reply dropped");
                }
            }
        }
    }
}

type SessionMap<S> = Arc<DashMap<String, Arc<Session<S>>>>;

/// A [`ProtocolAdapter`] driven by a [`Dialect`]
pub struct FramedAdapter<D: Dialect> {
    dialect: Arc<D>,
    connector: SharedConnector,
    sessions: SessionMap<D::Session>,
    gates: ConnectGates,
    next_subscription: AtomicU64,
    source: Option<Arc<dyn DiscoverySource>>,
    request_timeout: Duration,
}

impl<D: Dialect> fmt::Debug for FramedAdapter<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedAdapter")
            .field("dialect", &self.dialect)
            .field("sessions", &self.sessions.len())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl<D: Dialect> FramedAdapter<D> {
    /// Create an adapter opening links through `connector`
    pub fn new(dialect: D, connector: SharedConnector) -> Self {
        Self {
            dialect: Arc::new(dialect),
            connector,
            sessions: Arc::new(DashMap::new()),
            gates: ConnectGates::new(),
            next_subscription: AtomicU64::new(1),
            source: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Use `source` to answer [`ProtocolAdapter::discover`]
    pub fn with_discovery(mut self, source: Arc<dyn DiscoverySource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Deadline for state queries and pings
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// The dialect in use
    pub fn dialect(&self) -> &D {
        &self.dialect
    }

    /// Number of open sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Connects currently running or queued
    pub fn connects_in_flight(&self) -> usize {
        self.gates.len()
    }

    /// Requests of a device still waiting for a response
    pub fn pending_requests(&self, device_id: &str) -> usize {
        self.sessions
            .get(device_id)
            .map(|s| s.hub.pending().len())
            .unwrap_or(0)
    }

    /// Whether a request with `key` is outstanding on the device's session
    pub fn is_pending(&self, device_id: &str, key: &str) -> bool {
        self.sessions
            .get(device_id)
            .map(|s| s.hub.pending().contains(key))
            .unwrap_or(false)
    }

    fn session(&self, device_id: &str) -> Result<Arc<Session<D::Session>>> {
        self.sessions
            .get(device_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| DeviceError::not_connected(device_id))
    }

    async fn request(
        &self,
        session: &Session<D::Session>,
        key: &str,
        frames: Vec<Bytes>,
        timeout: Duration,
        operation: &str,
    ) -> Result<Reply> {
        session
            .hub
            .request(key, timeout, operation, session.send_all(frames))
            .await
    }

    async fn open_session(&self, device: &Device, options: ConnectOptions) -> Result<bool> {
        if self.sessions.contains_key(&device.id) {
            debug!(device_id = %device.id, "already connected");
            return Ok(true);
        }

        let context = self.dialect.open(device, &options)?;
        let endpoint = Endpoint {
            device_id: device.id.clone(),
            protocol: self.dialect.protocol(),
            host: device
                .address
                .clone()
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            port: device.port.unwrap_or_else(|| self.dialect.default_port()),
            wire: self.dialect.wire(&context),
        };
        let deadline = options.timeout_or(DEFAULT_CONNECT_TIMEOUT);
        let link = tokio::time::timeout(deadline, self.connector.open(&endpoint))
            .await
            .map_err(|_| DeviceError::timeout(&device.id, "connect", deadline))??;

        let session = Arc::new(Session {
            hub: SessionHub::new(&device.id, self.dialect.protocol(), options.inbound),
            context,
            outbound: link.outbound,
            reader: Mutex::new(None),
        });
        let handshake = self.dialect.handshake(&session.context)?;
        session
            .send_all(handshake)
            .await
            .map_err(|_| DeviceError::connection(&device.id, "link closed during handshake"))?;

        self.sessions.insert(device.id.clone(), session.clone());
        let reader = tokio::spawn(receive_loop(
            self.dialect.clone(),
            self.sessions.clone(),
            session.clone(),
            link.inbound,
        ));
        *lock(&session.reader) = Some(reader);

        info!(
            device_id = %device.id,
            protocol = %self.dialect.protocol(),
            host = %endpoint.host,
            port = endpoint.port,
            "session open"
        );
        Ok(true)
    }
}

async fn receive_loop<D: Dialect>(
    dialect: Arc<D>,
    sessions: SessionMap<D::Session>,
    session: Arc<Session<D::Session>>,
    mut frames: mpsc::Receiver<Bytes>,
) {
    while let Some(frame) = frames.recv().await {
        trace!(device_id = %session.device_id(), len = frame.len(), "frame in");
        match dialect.decode(&session.context, &frame) {
            Ok(items) => {
                for item in items {
                    session.dispatch(dialect.as_ref(), item);
                }
            }
            Err(e) => warn!(device_id = %session.device_id(), error = %e, "dropping undecodable frame"),
        }
    }

    let removed = sessions
        .remove_if(session.device_id(), |_, current| Arc::ptr_eq(current, &session))
        .is_some();
    if removed {
        session
            .hub
            .link_lost(|filter, message| dialect.matches(filter, message));
    } else {
        session.hub.pending().clear();
    }
}

#[async_trait]
impl<D: Dialect> ProtocolAdapter for FramedAdapter<D> {
    fn protocol(&self) -> Protocol {
        self.dialect.protocol()
    }

    async fn connect(&self, device: &Device, options: ConnectOptions) -> Result<bool> {
        self.gates
            .run(&device.id, self.open_session(device, options))
            .await
    }

    async fn disconnect(&self, device_id: &str) -> Result<bool> {
        let Some((_, session)) = self.sessions.remove(device_id) else {
            return Ok(false);
        };
        let farewell = self.dialect.teardown(&session.context);
        if let Err(e) = session.send_all(farewell).await {
            debug!(device_id, error = %e, "teardown not delivered");
        }
        session.hub.close();
        self.gates.forget(device_id);
        if let Some(reader) = lock(&session.reader).take() {
            reader.abort();
        }
        info!(device_id, protocol = %self.dialect.protocol(), "session closed");
        Ok(true)
    }

    async fn is_connected(&self, device_id: &str) -> bool {
        self.sessions
            .get(device_id)
            .map(|s| !s.outbound.is_closed())
            .unwrap_or(false)
    }

    async fn send_command(
        &self,
        device_id: &str,
        command: DeviceCommand,
    ) -> Result<CommandResponse> {
        let session = self.session(device_id)?;
        let outgoing = self.dialect.encode_command(&session.context, &command)?;
        debug!(
            device_id,
            command = %command.command,
            command_id = %command.command_id,
            "sending command"
        );
        match outgoing.key {
            Some(key) => {
                let reply = self
                    .request(&session, &key, outgoing.frames, command.timeout, &command.command)
                    .await?;
                Ok(match reply {
                    Ok(result) => CommandResponse::ok(&command.command_id, result),
                    Err(error) => CommandResponse::error(&command.command_id, error),
                })
            }
            None => {
                session.send_all(outgoing.frames).await?;
                Ok(CommandResponse::ok(
                    &command.command_id,
                    json!({"delivered": true}),
                ))
            }
        }
    }

    async fn read_state(&self, device_id: &str) -> Result<DeviceState> {
        let session = self.session(device_id)?;
        if let Some(query) = self.dialect.encode_state_query(&session.context) {
            let query = query?;
            match query.key {
                Some(key) => {
                    let reply = self
                        .request(&session, &key, query.frames, self.request_timeout, "read_state")
                        .await?;
                    let result = reply
                        .map_err(|e| DeviceError::transport(self.dialect.protocol(), e))?;
                    session
                        .hub
                        .update_state(|state| self.dialect.apply_state(&result, state));
                }
                None => session.send_all(query.frames).await?,
            }
        }
        Ok(session.hub.snapshot())
    }

    async fn subscribe(&self, device_id: &str, filter: &str) -> Result<Subscription> {
        self.dialect.validate_filter(filter)?;
        let session = self.session(device_id)?;
        let frames = self.dialect.encode_subscribe(&session.context, filter)?;
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let subscription = session.hub.subscribe(id, filter);
        if let Err(e) = session.send_all(frames).await {
            session.hub.unsubscribe(id);
            return Err(e);
        }
        debug!(device_id, filter, subscription = id, "subscribed");
        Ok(subscription)
    }

    async fn unsubscribe(&self, device_id: &str, subscription_id: u64) -> Result<bool> {
        let session = self.session(device_id)?;
        match session.hub.unsubscribe(subscription_id) {
            None => Ok(false),
            Some((filter, still_used)) => {
                if !still_used {
                    let frames = self.dialect.encode_unsubscribe(&session.context, &filter);
                    session.send_all(frames).await?;
                }
                debug!(device_id, filter = %filter, subscription = subscription_id, "unsubscribed");
                Ok(true)
            }
        }
    }

    async fn ping(&self, device_id: &str) -> Result<bool> {
        let session = self.session(device_id)?;
        match self.dialect.encode_ping(&session.context) {
            None => Ok(!session.outbound.is_closed()),
            Some(Outgoing { frames, key: None }) => {
                session.send_all(frames).await?;
                Ok(true)
            }
            Some(Outgoing {
                frames,
                key: Some(key),
            }) => match self
                .request(&session, &key, frames, self.request_timeout, "ping")
                .await
            {
                // Any answer, even an error status, proves the device is up
                Ok(_) => Ok(true),
                Err(e) if e.is_timeout() => Ok(false),
                Err(e) => Err(e),
            },
        }
    }

    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
        match &self.source {
            Some(source) => source.scan(self.dialect.protocol(), timeout).await,
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryConnector;
    use iotflow_core::device::DeviceType;

    /// Text protocol: `<key> <json>` requests, `=<key> <json>` or
    /// `!<key> <error>` responses, `@<topic> <json>` messages.
    #[derive(Debug)]
    struct TextDialect;

    #[derive(Debug, Default)]
    struct TextSession {
        seq: AtomicU64,
    }

    impl Dialect for TextDialect {
        type Session = TextSession;

        fn protocol(&self) -> Protocol {
            Protocol::WebSocket
        }

        fn wire(&self, _session: &TextSession) -> Wire {
            Wire::Stream(crate::transport::Framing::LengthPrefixed)
        }

        fn default_port(&self) -> u16 {
            9000
        }

        fn open(&self, _device: &Device, _options: &ConnectOptions) -> Result<TextSession> {
            Ok(TextSession::default())
        }

        fn handshake(&self, _session: &TextSession) -> Result<Vec<Bytes>> {
            Ok(vec![Bytes::from_static(b"hello")])
        }

        fn encode_command(&self, _session: &TextSession, command: &DeviceCommand) -> Result<Outgoing> {
            let frame = format!("{} {}", command.command_id, command.envelope());
            if command.command == "blink" {
                return Ok(Outgoing::fire(Bytes::from(frame)));
            }
            Ok(Outgoing::request(&command.command_id, Bytes::from(frame)))
        }

        fn encode_ping(&self, session: &TextSession) -> Option<Outgoing> {
            let key = format!("ping-{}", session.seq.fetch_add(1, Ordering::SeqCst));
            Some(Outgoing::request(key.clone(), Bytes::from(key)))
        }

        fn decode(&self, _session: &TextSession, frame: &[u8]) -> Result<Vec<Decoded>> {
            let text = String::from_utf8_lossy(frame);
            let (head, body) = text.split_once(' ').unwrap_or((text.as_ref(), "null"));
            let value: Value = serde_json::from_str(body).unwrap_or(Value::Null);
            Ok(vec![match head.chars().next() {
                Some('=') => Decoded::ok(&head[1..], value),
                Some('!') => Decoded::failed(&head[1..], body),
                Some('@') => Decoded::message(InboundKind::State, &head[1..], value),
                _ => return Ok(Vec::new()),
            }])
        }
    }

    async fn connected() -> (Arc<FramedAdapter<TextDialect>>, crate::transport::Peer) {
        let connector = Arc::new(MemoryConnector::new());
        let adapter = Arc::new(
            FramedAdapter::new(TextDialect, connector.clone())
                .with_request_timeout(Duration::from_millis(100)),
        );
        let device = Device::new("lamp", DeviceType::Light, Protocol::WebSocket).with_id("lamp");
        assert!(adapter.connect(&device, ConnectOptions::new()).await.unwrap());
        let mut peer = connector.take_peer("lamp").unwrap();
        assert_eq!(peer.recv().await.unwrap(), Bytes::from_static(b"hello"));
        (adapter, peer)
    }

    #[tokio::test]
    async fn test_request_response() {
        let (adapter, mut peer) = connected().await;
        let command = DeviceCommand::new("lamp", "turn_on");
        let id = command.command_id.clone();

        let device = tokio::spawn(async move {
            let frame = peer.recv().await.unwrap();
            assert!(String::from_utf8_lossy(&frame).starts_with(&id));
            peer.send(format!("={} {{\"power\":true}}", id)).await;
            peer
        });

        let response = adapter.send_command("lamp", command).await.unwrap();
        assert!(response.is_ok());
        assert_eq!(response.result, json!({"power": true}));
        let _peer = device.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_reply() {
        let (adapter, mut peer) = connected().await;
        let command = DeviceCommand::new("lamp", "turn_on");
        let id = command.command_id.clone();
        tokio::spawn(async move {
            let _ = peer.recv().await;
            peer.send(format!("!{} overheated", id)).await;
            peer
        });
        let response = adapter.send_command("lamp", command).await.unwrap();
        assert!(!response.is_ok());
        assert_eq!(response.error.as_deref(), Some("overheated"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_timeout_clears_correlation() {
        let (adapter, _peer) = connected().await;
        let command = DeviceCommand::new("lamp", "turn_on").with_timeout(Duration::from_millis(200));
        let id = command.command_id.clone();

        let err = adapter.send_command("lamp", command).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(!adapter.is_pending("lamp", &id));
        assert_eq!(adapter.pending_requests("lamp"), 0);
    }

    #[tokio::test]
    async fn test_fire_and_forget() {
        let (adapter, mut peer) = connected().await;
        let response = adapter
            .send_command("lamp", DeviceCommand::new("lamp", "blink"))
            .await
            .unwrap();
        assert_eq!(response.result, json!({"delivered": true}));
        assert!(peer.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_not_connected() {
        let adapter = FramedAdapter::new(TextDialect, Arc::new(MemoryConnector::new()));
        let err = adapter
            .send_command("ghost", DeviceCommand::new("ghost", "turn_on"))
            .await
            .unwrap_err();
        assert!(err.is_not_connected());
        assert!(adapter.read_state("ghost").await.unwrap_err().is_not_connected());
    }

    #[tokio::test]
    async fn test_subscriptions_are_independent() {
        let (adapter, peer) = connected().await;
        let mut all = adapter.subscribe("lamp", "devices/#").await.unwrap();
        let mut state = adapter.subscribe("lamp", "devices/lamp/state").await.unwrap();

        peer.send("@devices/lamp/state {\"power\":true}").await;
        assert_eq!(all.recv().await.unwrap().payload, json!({"power": true}));
        assert_eq!(state.recv().await.unwrap().topic, "devices/lamp/state");

        assert!(adapter.unsubscribe("lamp", state.id).await.unwrap());
        assert!(!adapter.unsubscribe("lamp", state.id).await.unwrap());

        peer.send("@devices/lamp/state {\"power\":false}").await;
        assert_eq!(all.recv().await.unwrap().payload, json!({"power": false}));
        assert!(state.recv().await.is_none());

        // Observed state follows the reports
        let snapshot = adapter.read_state("lamp").await.unwrap();
        assert_eq!(snapshot.power, Some(false));
    }

    #[tokio::test]
    async fn test_link_loss_removes_session() {
        let connector = Arc::new(MemoryConnector::new());
        let adapter = FramedAdapter::new(TextDialect, connector.clone());
        let (tx, mut rx) = mpsc::channel(8);
        let device = Device::new("lamp", DeviceType::Light, Protocol::WebSocket).with_id("lamp");
        adapter
            .connect(&device, ConnectOptions::new().with_inbound(tx))
            .await
            .unwrap();
        drop(connector.take_peer("lamp"));

        let message = rx.recv().await.unwrap();
        assert!(message.is_offline());
        assert!(!adapter.is_connected("lamp").await);
        assert_eq!(adapter.session_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let connector = Arc::new(MemoryConnector::new());
        let adapter = FramedAdapter::new(TextDialect, connector.clone());
        let device = Device::new("lamp", DeviceType::Light, Protocol::WebSocket).with_id("lamp");
        assert!(adapter.connect(&device, ConnectOptions::new()).await.unwrap());
        assert!(adapter.connect(&device, ConnectOptions::new()).await.unwrap());
        assert_eq!(connector.open_count(), 1);
        assert_eq!(adapter.connects_in_flight(), 0);

        assert!(adapter.disconnect("lamp").await.unwrap());
        assert!(!adapter.disconnect("lamp").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_nothing() {
        let connector = Arc::new(MemoryConnector::new());
        connector.refuse("lamp", "no route");
        let adapter = FramedAdapter::new(TextDialect, connector.clone());
        let device = Device::new("lamp", DeviceType::Light, Protocol::WebSocket).with_id("lamp");
        assert!(adapter.connect(&device, ConnectOptions::new()).await.is_err());
        assert!(!adapter.is_connected("lamp").await);
        assert_eq!(adapter.session_count(), 0);
        assert_eq!(adapter.connects_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_connects_open_one_link() {
        let connector = Arc::new(MemoryConnector::new());
        let adapter = Arc::new(FramedAdapter::new(TextDialect, connector.clone()));
        let device = Device::new("lamp", DeviceType::Light, Protocol::WebSocket).with_id("lamp");

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let adapter = adapter.clone();
                let device = device.clone();
                tokio::spawn(async move { adapter.connect(&device, ConnectOptions::new()).await })
            })
            .collect();
        for attempt in attempts {
            assert!(attempt.await.unwrap().unwrap());
        }
        assert_eq!(connector.open_count(), 1);
        assert_eq!(adapter.connects_in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping() {
        let (adapter, mut peer) = connected().await;
        let responder = tokio::spawn(async move {
            while let Some(frame) = peer.recv().await {
                let key = String::from_utf8_lossy(&frame).to_string();
                // The first ping goes unanswered
                if key != "ping-0" {
                    peer.send(format!("={} null", key)).await;
                }
            }
        });

        assert!(!adapter.ping("lamp").await.unwrap());
        assert!(adapter.ping("lamp").await.unwrap());
        responder.abort();
    }
}
