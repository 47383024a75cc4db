/*!
 * MQTT adapter.
 *
 * Each device session is a rumqttc client connected to the broker named
 * by the device address. Commands are published as JSON envelopes on
 * `devices/{id}/commands` and correlated with the envelope published back
 * on `devices/{id}/commands/response`.
 *
 * Device attributes:
 *
 * - `client_id`: client identifier (default: prefix and device id)
 * - `qos`: 0, 1 or 2 for commands and status messages
 */
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use iotflow_core::device::{
    CommandResponse, Device, DeviceCommand, DeviceState, Protocol, ResponseStatus,
};
use iotflow_core::types::Value;
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, Incoming, LastWill, MqttOptions, QoS};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::adapter::{ConnectOptions, InboundKind, ProtocolAdapter, Subscription};
use crate::discovery::{DiscoveredDevice, DiscoverySource};
use crate::error::{DeviceError, Result};
use crate::framed::{setting_str, setting_u64, Decoded, DEFAULT_CONNECT_TIMEOUT};
use crate::session::{lock, ConnectGates, SessionHub};
use crate::topic;

/// Time a closing session gets to flush its farewell before the client
/// task is aborted
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// MQTT client settings shared by every session
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker port when the device record has none
    pub default_port: u16,
    /// QoS used for commands and retained status
    pub default_qos: u8,
    /// Prefix of generated client identifiers
    pub client_id_prefix: String,
    #[allow(missing_docs)]
    pub keep_alive_secs: u16,
    /// Requests buffered by a client before publishers wait
    pub channel_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            default_port: 1883,
            default_qos: 1,
            client_id_prefix: "iotflow-".to_string(),
            keep_alive_secs: 60,
            channel_capacity: 64,
        }
    }
}

fn qos_level(level: u64) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

fn client_status(client_id: &str, status: &str) -> Value {
    json!({"status": status, "client_id": client_id})
}

fn client_error(device_id: &str, e: ClientError) -> DeviceError {
    debug!(device_id, error = %e, "mqtt client request rejected");
    DeviceError::not_connected(device_id)
}

struct MqttSession {
    hub: SessionHub,
    client: AsyncClient,
    client_id: String,
    qos: QoS,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for MqttSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttSession")
            .field("device_id", &self.hub.device_id())
            .field("client_id", &self.client_id)
            .field("qos", &self.qos)
            .finish_non_exhaustive()
    }
}

impl MqttSession {
    fn device_id(&self) -> &str {
        self.hub.device_id()
    }

    /// Whether `filter` is already delivered by the device wildcard
    fn covers(&self, filter: &str) -> bool {
        filter.starts_with(&format!("devices/{}/", self.device_id()))
    }

    /// Wait for CONNACK and the SUBACK of the device wildcard, then
    /// announce the client online
    async fn establish(&self, eventloop: &mut EventLoop) -> Result<()> {
        let refused = |e: rumqttc::ConnectionError| DeviceError::connection(self.device_id(), e.to_string());
        loop {
            if let Event::Incoming(Incoming::ConnAck(ack)) = eventloop.poll().await.map_err(refused)? {
                trace!(device_id = %self.device_id(), ?ack, "broker accepted client");
                break;
            }
        }

        self.client
            .subscribe(format!("devices/{}/#", self.device_id()), self.qos)
            .await
            .map_err(|e| client_error(self.device_id(), e))?;
        loop {
            match eventloop.poll().await.map_err(refused)? {
                Event::Incoming(Incoming::SubAck(_)) => break,
                Event::Incoming(Incoming::Publish(publish)) => {
                    self.route(&publish.topic, &publish.payload)
                }
                _ => {}
            }
        }

        self.client
            .publish(
                topic::status(&self.client_id),
                self.qos,
                true,
                client_status(&self.client_id, "online").to_string(),
            )
            .await
            .map_err(|e| client_error(self.device_id(), e))
    }

    fn route(&self, topic: &str, payload: &[u8]) {
        match route_publish(topic, payload) {
            Some(Decoded::Response { key, reply }) => self.hub.complete(&key, reply),
            Some(Decoded::Message {
                kind,
                topic,
                payload,
            }) => self.hub.deliver(kind, topic, payload),
            Some(Decoded::Reply(_)) | None => {}
        }
    }

    fn is_polling(&self) -> bool {
        lock(&self.poller)
            .as_ref()
            .map(|poller| !poller.is_finished())
            .unwrap_or(false)
    }
}

type SessionMap = Arc<DashMap<String, Arc<MqttSession>>>;

async fn poll_loop(sessions: SessionMap, session: Arc<MqttSession>, mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                trace!(device_id = %session.device_id(), topic = %publish.topic, "publish in");
                session.route(&publish.topic, &publish.payload);
            }
            Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                debug!(device_id = %session.device_id(), "client disconnected");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(device_id = %session.device_id(), error = %e, "broker connection failed");
                break;
            }
        }
    }

    let removed = sessions
        .remove_if(session.device_id(), |_, current| Arc::ptr_eq(current, &session))
        .is_some();
    if removed {
        session
            .hub
            .link_lost(|filter, message| topic::matches(filter, &message.topic));
    } else {
        session.hub.pending().clear();
    }
}

/// Message-bus adapter, one broker client per device
pub struct MqttAdapter {
    config: MqttConfig,
    sessions: SessionMap,
    gates: ConnectGates,
    next_subscription: AtomicU64,
    source: Option<Arc<dyn DiscoverySource>>,
}

impl fmt::Debug for MqttAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttAdapter")
            .field("config", &self.config)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl Default for MqttAdapter {
    fn default() -> Self {
        Self::new(MqttConfig::default())
    }
}

impl MqttAdapter {
    /// Create an adapter with the given client settings
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(DashMap::new()),
            gates: ConnectGates::new(),
            next_subscription: AtomicU64::new(1),
            source: None,
        }
    }

    /// Use `source` to answer [`ProtocolAdapter::discover`]
    pub fn with_discovery(mut self, source: Arc<dyn DiscoverySource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Whether a command with `command_id` still waits for its response
    pub fn is_pending(&self, device_id: &str, command_id: &str) -> bool {
        self.sessions
            .get(device_id)
            .map(|s| s.hub.pending().contains(command_id))
            .unwrap_or(false)
    }

    /// Connects currently running or queued
    pub fn connects_in_flight(&self) -> usize {
        self.gates.len()
    }

    fn session(&self, device_id: &str) -> Result<Arc<MqttSession>> {
        self.sessions
            .get(device_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| DeviceError::not_connected(device_id))
    }

    fn client_options(&self, device: &Device, client_id: &str, qos: QoS) -> MqttOptions {
        let host = device
            .address
            .clone()
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let port = device.port.unwrap_or(self.config.default_port);
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(u64::from(self.config.keep_alive_secs.max(1))));
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            topic::status(client_id),
            client_status(client_id, "offline").to_string(),
            qos,
            true,
        ));
        if let Some(username) = &device.credentials.username {
            let password = device
                .credentials
                .password
                .clone()
                .or_else(|| device.credentials.token.clone())
                .unwrap_or_default();
            options.set_credentials(username.clone(), password);
        }
        options
    }

    async fn open_session(&self, device: &Device, options: ConnectOptions) -> Result<bool> {
        if self.sessions.contains_key(&device.id) {
            debug!(device_id = %device.id, "already connected");
            return Ok(true);
        }

        let client_id = setting_str(device, &options, "client_id")
            .unwrap_or_else(|| format!("{}{}", self.config.client_id_prefix, device.id));
        let qos = qos_level(
            setting_u64(device, &options, "qos").unwrap_or(u64::from(self.config.default_qos)),
        );
        let (client, mut eventloop) = AsyncClient::new(
            self.client_options(device, &client_id, qos),
            self.config.channel_capacity.max(1),
        );
        let session = Arc::new(MqttSession {
            hub: SessionHub::new(&device.id, Protocol::Mqtt, options.inbound.clone()),
            client,
            client_id,
            qos,
            poller: Mutex::new(None),
        });

        let deadline = options.timeout_or(DEFAULT_CONNECT_TIMEOUT);
        tokio::time::timeout(deadline, session.establish(&mut eventloop))
            .await
            .map_err(|_| DeviceError::timeout(&device.id, "connect", deadline))??;

        self.sessions.insert(device.id.clone(), session.clone());
        let poller = tokio::spawn(poll_loop(self.sessions.clone(), session.clone(), eventloop));
        *lock(&session.poller) = Some(poller);

        info!(
            device_id = %device.id,
            client_id = %session.client_id,
            broker = ?device.address,
            "mqtt session open"
        );
        Ok(true)
    }
}

#[async_trait]
impl ProtocolAdapter for MqttAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Mqtt
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
        self.gates.forget(device_id);
        let offline = client_status(&session.client_id, "offline").to_string();
        if let Err(e) = session
            .client
            .publish(topic::status(&session.client_id), session.qos, true, offline)
            .await
        {
            debug!(device_id, error = %e, "offline status not delivered");
        }
        if let Err(e) = session.client.disconnect().await {
            debug!(device_id, error = %e, "disconnect not delivered");
        }
        session.hub.close();

        let poller = lock(&session.poller).take();
        if let Some(mut poller) = poller {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut poller).await.is_err() {
                poller.abort();
            }
        }
        info!(device_id, "mqtt session closed");
        Ok(true)
    }

    async fn is_connected(&self, device_id: &str) -> bool {
        self.sessions.contains_key(device_id)
    }

    async fn send_command(
        &self,
        device_id: &str,
        command: DeviceCommand,
    ) -> Result<CommandResponse> {
        let session = self.session(device_id)?;
        debug!(
            device_id,
            command = %command.command,
            command_id = %command.command_id,
            "publishing command"
        );
        let publish = session.client.publish(
            topic::commands(device_id),
            session.qos,
            false,
            command.envelope().to_string(),
        );
        let reply = session
            .hub
            .request(&command.command_id, command.timeout, &command.command, async {
                publish.await.map_err(|e| client_error(device_id, e))
            })
            .await?;
        Ok(match reply {
            Ok(result) => CommandResponse::ok(&command.command_id, result),
            Err(error) => CommandResponse::error(&command.command_id, error),
        })
    }

    async fn read_state(&self, device_id: &str) -> Result<DeviceState> {
        Ok(self.session(device_id)?.hub.snapshot())
    }

    async fn subscribe(&self, device_id: &str, filter: &str) -> Result<Subscription> {
        if !topic::is_valid_filter(filter) {
            return Err(DeviceError::transport(
                Protocol::Mqtt,
                format!("invalid subscription filter '{}'", filter),
            ));
        }
        let session = self.session(device_id)?;
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let subscription = session.hub.subscribe(id, filter);
        if !session.covers(filter) {
            if let Err(e) = session.client.subscribe(filter, session.qos).await {
                session.hub.unsubscribe(id);
                return Err(client_error(device_id, e));
            }
        }
        debug!(device_id, filter, subscription = id, "subscribed");
        Ok(subscription)
    }

    async fn unsubscribe(&self, device_id: &str, subscription_id: u64) -> Result<bool> {
        let session = self.session(device_id)?;
        let Some((filter, still_used)) = session.hub.unsubscribe(subscription_id) else {
            return Ok(false);
        };
        if !still_used && !session.covers(&filter) {
            session
                .client
                .unsubscribe(filter.clone())
                .await
                .map_err(|e| client_error(device_id, e))?;
        }
        debug!(device_id, filter = %filter, subscription = subscription_id, "unsubscribed");
        Ok(true)
    }

    /// The client keeps the broker connection alive on its own; a session
    /// whose client task is still polling is alive
    async fn ping(&self, device_id: &str) -> Result<bool> {
        Ok(self.session(device_id)?.is_polling())
    }

    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
        match &self.source {
            Some(source) => source.scan(Protocol::Mqtt, timeout).await,
            None => Ok(Vec::new()),
        }
    }
}

fn parse_payload(payload: &[u8]) -> Value {
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()))
}

fn route_publish(topic: &str, payload: &[u8]) -> Option<Decoded> {
    let payload = parse_payload(payload);
    let suffix = topic
        .strip_prefix("devices/")
        .and_then(|rest| rest.split_once('/'))
        .map(|(_, suffix)| suffix);

    let kind = match suffix {
        Some("commands/response") => {
            return match serde_json::from_value::<CommandResponse>(payload) {
                Ok(response) => Some(match response.status {
                    ResponseStatus::Ok => Decoded::ok(response.command_id, response.result),
                    ResponseStatus::Error => Decoded::failed(
                        response.command_id,
                        response
                            .error
                            .unwrap_or_else(|| "device reported an error".to_string()),
                    ),
                }),
                Err(e) => {
                    warn!(topic, error = %e, "malformed response envelope");
                    None
                }
            };
        }
        // Our own command publications echoed back by the broker
        Some("commands") => return None,
        Some("telemetry") => InboundKind::Telemetry,
        Some("events") => InboundKind::Event,
        Some("status") => InboundKind::Status,
        Some("state") => InboundKind::State,
        _ => InboundKind::Other,
    };

    let payload = match (kind, payload) {
        (InboundKind::State, Value::Object(mut report))
            if report.get("state").map(Value::is_object).unwrap_or(false) =>
        {
            report.remove("state").unwrap_or(Value::Null)
        }
        (_, payload) => payload,
    };
    Some(Decoded::message(kind, topic, payload))
}
