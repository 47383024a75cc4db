/*!
 * Device manager.
 *
 * Owns the lifecycle of every device: registration through the registry,
 * adapter selection, connect/disconnect, command delivery, and the
 * background loops (inbound processing, health checks, discovery).
 *
 * Status transitions happen only here:
 *
 * ```text
 * registered(offline) -> connecting -> online <-> error
 * online | error -> offline            (disconnect, link lost)
 * ```
 */
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use iotflow_core::config::{CommandConfig, Config, ManagerConfig};
use iotflow_core::device::{
    CommandResponse, Device, DeviceCommand, DeviceFilter, DeviceState, DeviceStatus, DeviceUpdate,
    Protocol,
};
use iotflow_core::event::{kinds, DeviceEvent, EventBus, Severity, SharedEventBus};
use iotflow_core::logging::component_span;
use iotflow_core::store::SharedStore;
use iotflow_core::types::{Params, Value};
use iotflow_core::utils::{spawn_and_log, TaskSet};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn, Instrument};

use crate::adapter::{
    AdapterTable, ConnectOptions, InboundKind, InboundMessage, SharedAdapter,
};
use crate::discovery::{DiscoveredDevice, DISCOVERED_ID_KEY};
use crate::error::{DeviceError, Result};
use crate::registry::{DeviceRegistry, SharedDeviceRegistry};
use crate::state::{SharedStateCache, StateCache};

/// Slack granted to an adapter past the command's own timeout before the
/// manager gives up on it
const COMMAND_GRACE: Duration = Duration::from_secs(1);

/// Connectivity and lifecycle service for all registered devices
pub struct DeviceManager {
    config: ManagerConfig,
    commands: CommandConfig,
    registry: SharedDeviceRegistry,
    adapters: AdapterTable,
    states: SharedStateCache,
    store: SharedStore,
    bus: SharedEventBus,
    /// Devices with a live session and the protocol serving them
    sessions: DashMap<String, Protocol>,
    /// Discovery ids announced and still unregistered, with the protocol
    /// that reported them
    announced: DashMap<String, Protocol>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    tasks: TaskSet,
    discovery_tasks: TaskSet,
    running: AtomicBool,
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("config", &self.config)
            .field("sessions", &self.sessions.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl DeviceManager {
    /// Create a manager over `store`, serving protocols from `adapters`
    pub fn new(config: &Config, store: SharedStore, adapters: AdapterTable) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.manager.inbound_capacity.max(1));
        Self {
            config: config.manager.clone(),
            commands: config.commands.clone(),
            registry: Arc::new(DeviceRegistry::new(store.clone())),
            adapters,
            states: Arc::new(StateCache::new(config.manager.state_ttl())),
            store,
            bus: Arc::new(EventBus::new()),
            sessions: DashMap::new(),
            announced: DashMap::new(),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            tasks: TaskSet::new(),
            discovery_tasks: TaskSet::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Publish events and inbound messages on `bus` instead of a private one
    pub fn with_event_bus(mut self, bus: SharedEventBus) -> Self {
        self.bus = bus;
        self
    }

    /// The device registry
    pub fn registry(&self) -> &SharedDeviceRegistry {
        &self.registry
    }

    /// The live state cache
    pub fn states(&self) -> &SharedStateCache {
        &self.states
    }

    /// The event bus events and inbound messages are published on
    pub fn event_bus(&self) -> &SharedEventBus {
        &self.bus
    }

    /// The persistence collaborator
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Adapter serving `protocol`
    pub fn adapter(&self, protocol: Protocol) -> Result<SharedAdapter> {
        self.adapters
            .get(protocol)
            .ok_or(DeviceError::UnsupportedProtocol(protocol))
    }

    /// Whether the background loops are running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ----- registry -----

    /// Register a device; returns the stored record with its assigned id
    pub async fn register_device(&self, device: Device) -> Result<Arc<Device>> {
        let device = self.registry.register(device).await?;
        if let Some(discovery_id) = device.metadata.get(DISCOVERED_ID_KEY).and_then(Value::as_str) {
            self.announced.remove(discovery_id);
        }
        info!(device_id = %device.id, name = %device.name, protocol = %device.protocol, "device registered");
        Ok(device)
    }

    /// Disconnect if needed, then soft-delete the device
    pub async fn unregister_device(&self, id: &str) -> Result<()> {
        self.registry.require(id)?;
        if self.sessions.contains_key(id) {
            if let Err(e) = self.disconnect_device(id).await {
                warn!(device_id = %id, error = %e, "forced disconnect failed");
            }
        }
        self.registry.unregister(id).await?;
        self.states.remove(id);
        info!(device_id = %id, "device unregistered");
        Ok(())
    }

    /// Look up a device
    pub fn get_device(&self, id: &str) -> Result<Arc<Device>> {
        self.registry.require(id)
    }

    /// Devices matching `filter`
    pub fn list_devices(&self, filter: &DeviceFilter) -> Vec<Arc<Device>> {
        self.registry.list(filter)
    }

    /// Apply a partial update to a device record
    pub async fn update_device(&self, id: &str, update: DeviceUpdate) -> Result<Arc<Device>> {
        self.registry.update(id, update).await
    }

    // ----- sessions -----

    /// Whether the device has a live session
    pub fn is_connected(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Ids of every connected device
    pub fn connected_devices(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Open a session with the device.
    ///
    /// Connecting an already connected device succeeds without touching
    /// the adapter. On failure the device ends in `error`.
    pub async fn connect_device(&self, id: &str, options: ConnectOptions) -> Result<bool> {
        let device = self.registry.require(id)?;
        let adapter = self.adapter(device.protocol)?;

        if self.sessions.contains_key(id) && adapter.is_connected(id).await {
            debug!(device_id = %id, "already connected");
            return Ok(true);
        }

        self.registry
            .set_status(id, DeviceStatus::Connecting, false)
            .await?;
        let timeout = options.timeout_or(self.commands.connect_timeout());
        let options = ConnectOptions {
            timeout: Some(timeout),
            inbound: Some(self.inbound_tx.clone()),
            ..options
        };

        let outcome = match adapter.connect(&device, options).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(DeviceError::connection(id, "adapter declined the session")),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {
                self.sessions.insert(id.to_string(), device.protocol);
                self.registry.set_status(id, DeviceStatus::Online, true).await?;
                self.states.update(id, |s| s.online = true);
                info!(device_id = %id, protocol = %device.protocol, "device connected");
                self.emit_event(
                    DeviceEvent::new(id, kinds::CONNECTED)
                        .with_data("protocol", json!(device.protocol)),
                )
                .await;
                Ok(true)
            }
            Err(e) => {
                warn!(device_id = %id, error = %e, "connect failed");
                if let Err(status_err) = self.registry.set_status(id, DeviceStatus::Error, false).await {
                    warn!(device_id = %id, error = %status_err, "could not record error status");
                }
                Err(e)
            }
        }
    }

    /// Close the device's session. Returns `false` when it had none.
    pub async fn disconnect_device(&self, id: &str) -> Result<bool> {
        let device = self.registry.require(id)?;
        if self.sessions.remove(id).is_none() {
            return Ok(false);
        }
        let adapter = self.adapter(device.protocol)?;
        if let Err(e) = adapter.disconnect(id).await {
            warn!(device_id = %id, error = %e, "adapter disconnect failed");
        }
        self.registry.set_status(id, DeviceStatus::Offline, false).await?;
        self.states.mark_offline(id);
        info!(device_id = %id, "device disconnected");
        self.emit_event(DeviceEvent::new(id, kinds::DISCONNECTED)).await;
        Ok(true)
    }

    // ----- commands and state -----

    /// Send a named command with the configured default timeout
    pub async fn send_command(
        &self,
        id: &str,
        command: &str,
        parameters: Params,
    ) -> Result<CommandResponse> {
        let command = DeviceCommand::new(id, command)
            .with_parameters(parameters)
            .with_timeout(self.commands.default_timeout());
        self.dispatch(command).await
    }

    /// Deliver a prepared command to its target device.
    ///
    /// Fails with not-connected when the device has no session and with a
    /// timeout when no response arrives within the command's timeout.
    pub async fn dispatch(&self, command: DeviceCommand) -> Result<CommandResponse> {
        let id = command.target_device.clone();
        let device = self.registry.require(&id)?;
        if !self.sessions.contains_key(&id) {
            return Err(DeviceError::not_connected(&id));
        }
        let adapter = self.adapter(device.protocol)?;

        let timeout = command.timeout;
        let name = command.command.clone();
        let response = tokio::time::timeout(timeout + COMMAND_GRACE, adapter.send_command(&id, command))
            .await
            .map_err(|_| DeviceError::timeout(&id, &name, timeout))?;

        match &response {
            Ok(reply) if !reply.is_ok() => {
                debug!(device_id = %id, command = %name, error = ?reply.error, "device rejected command")
            }
            Ok(_) => debug!(device_id = %id, command = %name, "command delivered"),
            Err(e) if e.is_not_connected() => {
                warn!(device_id = %id, "session vanished during command");
                self.mark_lost(&id, "session_closed").await;
            }
            Err(e) => warn!(device_id = %id, command = %name, error = %e, "command failed"),
        }
        response
    }

    /// Current state: a fresh cached snapshot, else a read through the
    /// adapter. A disconnected device yields its last known snapshot.
    pub async fn get_device_state(&self, id: &str) -> Result<DeviceState> {
        let device = self.registry.require(id)?;
        if let Some(state) = self.states.get(id) {
            return Ok(state);
        }
        if !self.sessions.contains_key(id) {
            return self
                .states
                .get_any(id)
                .ok_or_else(|| DeviceError::not_connected(id));
        }
        let adapter = self.adapter(device.protocol)?;
        let reported = adapter.read_state(id).await?;
        Ok(self.states.update(id, |state| {
            let mut merged = reported;
            // Keep optimistic fields the adapter has no view of
            for (key, value) in &state.state {
                merged.state.entry(key.clone()).or_insert_with(|| value.clone());
            }
            for (metric, value) in &state.sensor_data {
                merged.sensor_data.entry(metric.clone()).or_insert(*value);
            }
            *state = merged;
        }))
    }

    // ----- events -----

    /// Subscribe to device events
    pub fn events(&self) -> Result<broadcast::Receiver<DeviceEvent>> {
        Ok(self.bus.subscribe::<DeviceEvent>()?)
    }

    /// Subscribe to every inbound message after the manager processed it
    pub fn inbound(&self) -> Result<broadcast::Receiver<InboundMessage>> {
        Ok(self.bus.subscribe::<InboundMessage>()?)
    }

    /// Persist an event and broadcast it. Store failures are logged; the
    /// event is still broadcast.
    pub async fn emit_event(&self, event: DeviceEvent) {
        if let Err(e) = self.store.append_event(&event).await {
            warn!(device_id = %event.device_id, event = %event.event_type, error = %e, "event not persisted");
        }
        if let Err(e) = self.bus.publish(event) {
            warn!(error = %e, "event not broadcast");
        }
    }

    async fn mark_lost(&self, id: &str, reason: &str) {
        if self.sessions.remove(id).is_none() {
            return;
        }
        self.states.mark_offline(id);
        if let Err(e) = self.registry.set_status(id, DeviceStatus::Offline, false).await {
            warn!(device_id = %id, error = %e, "could not record offline status");
        }
        warn!(device_id = %id, reason, "device went offline");
        self.emit_event(
            DeviceEvent::new(id, kinds::DISCONNECTED)
                .with_severity(Severity::Warning)
                .with_data("reason", json!(reason)),
        )
        .await;
    }

    /// Apply one inbound message to the caches and re-broadcast it
    pub async fn process_inbound(&self, message: InboundMessage) {
        let id = message.device_id.clone();
        if !self.registry.contains(&id) {
            debug!(device_id = %id, "inbound message for unknown device");
            return;
        }
        match message.kind {
            InboundKind::State => {
                if let Some(report) = message.fields() {
                    self.states.update(&id, |s| s.merge_report(report));
                }
            }
            InboundKind::Telemetry => {
                let readings = message.readings();
                self.states.update(&id, |s| {
                    for (metric, value) in &readings {
                        s.record_metric(metric, *value);
                    }
                    s.online = true;
                });
            }
            InboundKind::Event => {
                let event_type = message
                    .payload
                    .get("event_type")
                    .or_else(|| message.payload.get("type"))
                    .and_then(Value::as_str)
                    .unwrap_or("device_event")
                    .to_string();
                let mut event = DeviceEvent::new(&id, event_type);
                if let Some(data) = message.fields() {
                    event = event.with_payload(data.clone());
                }
                self.emit_event(event).await;
            }
            InboundKind::Status if message.is_offline() => {
                let reason = message
                    .payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("offline");
                self.mark_lost(&id, reason).await;
            }
            InboundKind::Status | InboundKind::Response | InboundKind::Other => {}
        }
        if !message.is_offline() && self.sessions.contains_key(&id) {
            let status = self
                .registry
                .get(&id)
                .map(|d| d.status)
                .unwrap_or(DeviceStatus::Online);
            if let Err(e) = self.registry.set_status(&id, status, true).await {
                debug!(device_id = %id, error = %e, "last-seen not recorded");
            }
        }
        if let Err(e) = self.bus.publish(message) {
            warn!(error = %e, "inbound message not broadcast");
        }
    }

    // ----- health -----

    /// Ping every connected device once; returns the ids that failed
    pub async fn run_health_check(&self) -> Vec<String> {
        let mut failed = Vec::new();
        for id in self.connected_devices() {
            let Some(device) = self.registry.get(&id) else {
                continue;
            };
            let outcome = match self.adapter(device.protocol) {
                Ok(adapter) => adapter.ping(&id).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(true) => {
                    if let Err(e) = self.registry.set_status(&id, DeviceStatus::Online, true).await {
                        warn!(device_id = %id, error = %e, "could not refresh last-seen");
                    }
                }
                Ok(false) | Err(_) => {
                    let reason = match &outcome {
                        Err(e) => e.to_string(),
                        _ => "no answer to ping".to_string(),
                    };
                    warn!(device_id = %id, reason = %reason, "health check failed");
                    if let Err(e) = self.registry.set_status(&id, DeviceStatus::Error, false).await {
                        warn!(device_id = %id, error = %e, "could not record error status");
                    }
                    self.emit_event(
                        DeviceEvent::new(&id, kinds::HEALTH_CHECK_FAILED)
                            .with_severity(Severity::Warning)
                            .with_data("reason", json!(reason)),
                    )
                    .await;
                    failed.push(id);
                }
            }
        }
        failed
    }

    // ----- discovery -----

    /// Scan one protocol once; returns and announces the devices not
    /// seen before. Nothing is registered.
    pub async fn discover(&self, protocol: Protocol) -> Result<Vec<DiscoveredDevice>> {
        let adapter = self.adapter(protocol)?;
        let timeout = self.config.discovery_timeout();
        let found = tokio::time::timeout(timeout, adapter.discover(timeout))
            .await
            .map_err(|_| DeviceError::timeout(protocol.as_str(), "discover", timeout))??;

        // Forget announcements of devices that went away or got registered
        self.announced.retain(|discovery_id, reported_by| {
            *reported_by != protocol
                || (found.iter().any(|c| &c.discovery_id == discovery_id)
                    && !self.registry.has_discovery_id(discovery_id))
        });

        let mut fresh = Vec::new();
        for candidate in found {
            if self.registry.has_discovery_id(&candidate.discovery_id) {
                continue;
            }
            if self
                .announced
                .insert(candidate.discovery_id.clone(), protocol)
                .is_some()
            {
                continue;
            }
            info!(
                discovered_id = %candidate.discovery_id,
                name = %candidate.name,
                %protocol,
                "new device discovered"
            );
            self.emit_event(
                DeviceEvent::new(&candidate.discovery_id, kinds::DEVICE_DISCOVERED)
                    .with_payload(candidate.to_event_data()),
            )
            .await;
            fresh.push(candidate);
        }
        Ok(fresh)
    }

    /// Start one discovery loop per configured protocol
    pub fn start_discovery(self: &Arc<Self>) {
        for protocol in &self.config.discovery_protocols {
            if self.adapters.get(*protocol).is_none() {
                debug!(%protocol, "no adapter, discovery skipped");
                continue;
            }
            let manager = Arc::downgrade(self);
            let protocol = *protocol;
            let interval = self.config.discovery_interval();
            let span = component_span("discovery", Some(protocol.as_str()));
            self.discovery_tasks.push(tokio::spawn(
                discovery_loop(manager, protocol, interval).instrument(span),
            ));
        }
        info!(loops = self.discovery_tasks.len(), "discovery started");
    }

    /// Discovery ids announced and not yet registered
    pub fn pending_discoveries(&self) -> usize {
        self.announced.len()
    }

    /// Stop every discovery loop
    pub async fn stop_discovery(&self) {
        self.discovery_tasks.shutdown().await;
        info!("discovery stopped");
    }

    // ----- lifecycle -----

    /// Load devices, auto-connect flagged ones and start the loops
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.registry.is_empty() {
            self.registry.load().await?;
        }

        let inbound = self
            .inbound_rx
            .lock()
            .map_err(|_| DeviceError::Other(anyhow::anyhow!("inbound receiver lock poisoned")))?
            .take();
        if let Some(rx) = inbound {
            let manager = Arc::downgrade(self);
            self.tasks.push(tokio::spawn(
                inbound_loop(manager, rx).instrument(component_span("inbound", None)),
            ));
        }

        let manager = Arc::downgrade(self);
        let interval = self.config.health_check_interval();
        self.tasks.push(tokio::spawn(
            health_loop(manager, interval).instrument(component_span("health", None)),
        ));

        if self.config.discovery_enabled {
            self.start_discovery();
        }

        let auto: Vec<String> = self
            .registry
            .list(&DeviceFilter::default())
            .iter()
            .filter(|d| d.auto_connect)
            .map(|d| d.id.clone())
            .collect();
        for id in auto {
            let manager = self.clone();
            self.tasks.push(spawn_and_log("auto_connect", async move {
                manager.connect_device(&id, ConnectOptions::new()).await
            }));
        }

        info!(devices = self.registry.len(), "device manager started");
        Ok(())
    }

    /// Cancel the loops and disconnect every connected device
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.discovery_tasks.shutdown().await;
        self.tasks.shutdown().await;
        for id in self.connected_devices() {
            if let Err(e) = self.disconnect_device(&id).await {
                warn!(device_id = %id, error = %e, "disconnect on stop failed");
            }
        }
        info!("device manager stopped");
    }
}

async fn inbound_loop(manager: Weak<DeviceManager>, mut rx: mpsc::Receiver<InboundMessage>) {
    while let Some(message) = rx.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.process_inbound(message).await;
    }
    debug!("inbound loop finished");
}

async fn health_loop(manager: Weak<DeviceManager>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(manager) = manager.upgrade() else {
            break;
        };
        let failed = manager.run_health_check().await;
        if !failed.is_empty() {
            debug!(failed = failed.len(), "health sweep finished with failures");
        }
    }
}

async fn discovery_loop(manager: Weak<DeviceManager>, protocol: Protocol, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let Some(manager) = manager.upgrade() else {
            break;
        };
        match manager.discover(protocol).await {
            Ok(found) if !found.is_empty() => debug!(%protocol, new = found.len(), "discovery pass"),
            Ok(_) => {}
            Err(e) => warn!(%protocol, error = %e, "discovery pass failed"),
        }
    }
}

/// Shared manager handle
pub type SharedDeviceManager = Arc<DeviceManager>;
