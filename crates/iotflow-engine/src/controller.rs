/*!
 * Device controller.
 *
 * High-level control on top of the device manager: capability-checked
 * commands with transport fallback and optimistic state updates,
 * desired-state decomposition, groups, scenes, scheduled commands,
 * per-device control modes and the automation rule engine.
 */
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use iotflow_core::config::{CommandConfig, Config};
use iotflow_core::device::{
    Capability, CommandResponse, Device, DeviceCommand, DeviceGroup, DeviceState, Priority,
    Protocol, Scene,
};
use iotflow_core::logging::{component_span, device_span};
use iotflow_core::types::{as_switch, DeviceId, Params, Value};
use iotflow_core::utils::TaskSet;
use iotflow_devices::{DeviceError, SharedDeviceManager};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn, Instrument};

use crate::action::{LogNotifier, Notification, Notifier};
use crate::context::AutomationContext;
use crate::error::{Error, Result};
use crate::rules::{AutomationRule, RuleEngine};
use crate::scheduler::{CommandScheduler, ScheduledCommand};
use crate::types::{ControlMode, FieldResult, MemberResult, MemberResults};

/// Commands remembered by the journal
const JOURNAL_CAPACITY: usize = 256;

/// Capability a command needs; commands not listed need none
pub fn required_capability(command: &str) -> Option<Capability> {
    match command {
        "turn_on" | "turn_off" => Some(Capability::OnOff),
        "set_brightness" => Some(Capability::Dimming),
        "set_color" => Some(Capability::ColorControl),
        "set_temperature" => Some(Capability::TemperatureControl),
        "lock" | "unlock" => Some(Capability::LockUnlock),
        "play" | "pause" => Some(Capability::AudioPlayback),
        "start_recording" => Some(Capability::VideoStreaming),
        _ => None,
    }
}

/// State attribute a successful command is assumed to have changed
fn optimistic_update(command: &str, params: &Params) -> Option<(&'static str, Value)> {
    match command {
        "turn_on" => Some(("power", json!(true))),
        "turn_off" => Some(("power", json!(false))),
        "set_brightness" => params.get("level").map(|v| ("brightness", v.clone())),
        "set_color" => params.get("color").map(|v| ("color", v.clone())),
        "set_temperature" => params
            .get("temperature")
            .map(|v| ("target_temperature", v.clone())),
        "lock" => Some(("locked", json!(true))),
        "unlock" => Some(("locked", json!(false))),
        "play" => Some(("playing", json!(true))),
        "pause" => Some(("playing", json!(false))),
        "set_volume" => params.get("level").map(|v| ("volume", v.clone())),
        _ => None,
    }
}

/// One entry of the command journal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    #[allow(missing_docs)]
    pub command_id: String,
    #[allow(missing_docs)]
    pub device_id: DeviceId,
    #[allow(missing_docs)]
    pub command: String,
    #[allow(missing_docs)]
    pub priority: Priority,
    /// Transport that delivered the command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Protocol>,
    #[allow(missing_docs)]
    pub success: bool,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[allow(missing_docs)]
    pub issued_at: DateTime<Utc>,
}

/// High-level control service
pub struct DeviceController {
    commands: CommandConfig,
    preferred_transports: Vec<Protocol>,
    manager: SharedDeviceManager,
    groups: DashMap<String, DeviceGroup>,
    modes: DashMap<DeviceId, ControlMode>,
    scheduler: CommandScheduler,
    rules: Arc<RuleEngine>,
    notifier: Arc<dyn Notifier>,
    journal: Mutex<VecDeque<CommandRecord>>,
    tasks: TaskSet,
    running: AtomicBool,
}

impl std::fmt::Debug for DeviceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceController")
            .field("preferred_transports", &self.preferred_transports)
            .field("groups", &self.groups.len())
            .field("rules", &self.rules)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Shared handle to the controller
pub type SharedDeviceController = Arc<DeviceController>;

impl DeviceController {
    /// Create a controller driving devices through `manager`
    pub fn new(config: &Config, manager: SharedDeviceManager) -> Self {
        Self {
            commands: config.commands.clone(),
            preferred_transports: config.controller.preferred_transports.clone(),
            manager,
            groups: DashMap::new(),
            modes: DashMap::new(),
            scheduler: CommandScheduler::new(),
            rules: Arc::new(RuleEngine::new(&config.controller)),
            notifier: Arc::new(LogNotifier),
            journal: Mutex::new(VecDeque::with_capacity(JOURNAL_CAPACITY)),
            tasks: TaskSet::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Deliver rule notifications to `notifier` instead of the log
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// The device manager
    pub fn manager(&self) -> &SharedDeviceManager {
        &self.manager
    }

    /// The automation rule engine
    pub fn rules(&self) -> &Arc<RuleEngine> {
        &self.rules
    }

    /// Whether the controller is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ----- commands and state -----

    /// Send a command to a device.
    ///
    /// Fails fast with a capability error when the device lacks what the
    /// command needs. Preferred session transports are tried before the
    /// device's own adapter; the first success wins. A successful response
    /// updates the cached state without waiting for the device to report.
    ///
    /// There is no outbound queue: the command goes out on the caller's
    /// task and every attempt past the capability check is appended to the
    /// bounded journal read back by [`recent_commands`](Self::recent_commands).
    pub async fn control_device(
        &self,
        device_id: &str,
        command: &str,
        parameters: Params,
        priority: Priority,
    ) -> Result<CommandResponse> {
        let span = device_span("control", device_id);
        async move {
            let device = self.manager.get_device(device_id)?;
            if let Some(capability) = required_capability(command) {
                if !device.has_capability(capability) {
                    return Err(DeviceError::Capability {
                        device_id: device_id.to_string(),
                        command: command.to_string(),
                        capability,
                    }
                    .into());
                }
            }

            let cmd = DeviceCommand::new(device_id, command)
                .with_parameters(parameters.clone())
                .with_priority(priority)
                .with_timeout(self.commands.default_timeout());
            let mut record = CommandRecord {
                command_id: cmd.command_id.clone(),
                device_id: device_id.to_string(),
                command: command.to_string(),
                priority,
                transport: None,
                success: false,
                error: None,
                issued_at: cmd.issued_at,
            };

            let outcome = self.deliver(&device, cmd).await;
            match &outcome {
                Ok((response, via)) => {
                    record.transport = Some(*via);
                    record.success = response.is_ok();
                    record.error = response.error.clone();
                }
                Err(e) => record.error = Some(e.to_string()),
            }
            self.journal(record);

            let (response, _) = outcome?;
            if response.is_ok() {
                if let Some((attribute, value)) = optimistic_update(command, &parameters) {
                    self.manager.states().update(device_id, |state| {
                        state.set_attribute(attribute, value);
                        state.online = true;
                    });
                }
            }
            Ok(response)
        }
        .instrument(span)
        .await
    }

    async fn deliver(
        &self,
        device: &Device,
        command: DeviceCommand,
    ) -> Result<(CommandResponse, Protocol)> {
        for &protocol in &self.preferred_transports {
            if protocol == device.protocol {
                continue;
            }
            let adapter = match self.manager.adapter(protocol) {
                Ok(adapter) => adapter,
                Err(_) => continue,
            };
            if !adapter.is_connected(&device.id).await {
                continue;
            }
            let sent = tokio::time::timeout(
                command.timeout,
                adapter.send_command(&device.id, command.clone()),
            )
            .await;
            match sent {
                Ok(Ok(response)) => {
                    debug!(device_id = %device.id, transport = %protocol, "command delivered");
                    return Ok((response, protocol));
                }
                Ok(Err(e)) => {
                    warn!(device_id = %device.id, transport = %protocol, error = %e, "transport failed, trying next")
                }
                Err(_) => {
                    warn!(device_id = %device.id, transport = %protocol, "transport timed out, trying next")
                }
            }
        }
        let protocol = device.protocol;
        let response = self.manager.dispatch(command).await?;
        Ok((response, protocol))
    }

    fn journal(&self, record: CommandRecord) {
        if let Ok(mut journal) = self.journal.lock() {
            if journal.len() == JOURNAL_CAPACITY {
                journal.pop_front();
            }
            journal.push_back(record);
        }
    }

    /// Most recent commands, newest first
    pub fn recent_commands(&self, limit: usize) -> Vec<CommandRecord> {
        self.journal
            .lock()
            .map(|j| j.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Current state of a device
    pub async fn get_device_state(&self, device_id: &str) -> Result<DeviceState> {
        Ok(self.manager.get_device_state(device_id).await?)
    }

    /// Drive a device towards a desired state. Fields are applied in the
    /// order power, brightness, color, temperature, locked, volume; each
    /// reports its own outcome and a failure does not stop the rest.
    pub async fn set_device_state(&self, device_id: &str, desired: &Params) -> Result<Vec<FieldResult>> {
        self.manager.get_device(device_id)?;

        let mut plan: Vec<(&str, std::result::Result<(String, Params), String>)> = Vec::new();
        if let Some(value) = desired.get("power") {
            let step = match as_switch(value) {
                Some(true) => Ok(("turn_on".to_string(), Params::new())),
                Some(false) => Ok(("turn_off".to_string(), Params::new())),
                None => Err(format!("power must be a switch value, got {}", value)),
            };
            plan.push(("power", step));
        }
        if let Some(value) = desired.get("brightness") {
            plan.push(("brightness", Ok(("set_brightness".to_string(), single("level", value)))));
        }
        if let Some(value) = desired.get("color") {
            plan.push(("color", Ok(("set_color".to_string(), single("color", value)))));
        }
        if let Some(value) = desired.get("temperature") {
            plan.push((
                "temperature",
                Ok(("set_temperature".to_string(), single("temperature", value))),
            ));
        }
        if let Some(value) = desired.get("locked") {
            let step = match as_switch(value) {
                Some(true) => Ok(("lock".to_string(), Params::new())),
                Some(false) => Ok(("unlock".to_string(), Params::new())),
                None => Err(format!("locked must be a switch value, got {}", value)),
            };
            plan.push(("locked", step));
        }
        if let Some(value) = desired.get("volume") {
            plan.push(("volume", Ok(("set_volume".to_string(), single("level", value)))));
        }

        let mut results = Vec::with_capacity(plan.len());
        for (field, step) in plan {
            let result = match step {
                Ok((command, params)) => {
                    match self.control_device(device_id, &command, params, Priority::Normal).await {
                        Ok(response) if response.is_ok() => FieldResult {
                            field: field.to_string(),
                            command,
                            success: true,
                            error: None,
                        },
                        Ok(response) => FieldResult {
                            field: field.to_string(),
                            command,
                            success: false,
                            error: response.error.or_else(|| Some("device reported an error".into())),
                        },
                        Err(e) => {
                            warn!(device_id = %device_id, field, error = %e, "desired state not applied");
                            FieldResult {
                                field: field.to_string(),
                                command,
                                success: false,
                                error: Some(e.to_string()),
                            }
                        }
                    }
                }
                Err(reason) => FieldResult {
                    field: field.to_string(),
                    command: String::new(),
                    success: false,
                    error: Some(reason),
                },
            };
            results.push(result);
        }
        Ok(results)
    }

    // ----- groups -----

    /// Create a group of devices
    pub fn create_group<S: Into<String>>(
        &self,
        name: S,
        devices: Vec<DeviceId>,
        group_type: Option<String>,
    ) -> Result<DeviceGroup> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::validation("group name must not be empty"));
        }
        let mut members: Vec<DeviceId> = Vec::with_capacity(devices.len());
        for device in devices {
            if !members.contains(&device) {
                members.push(device);
            }
        }
        let mut group = DeviceGroup::new(name, members);
        group.group_type = group_type;
        info!(group_id = %group.id, name = %group.name, members = group.devices.len(), "group created");
        self.groups.insert(group.id.clone(), group.clone());
        Ok(group)
    }

    /// Delete a group
    pub fn delete_group(&self, group_id: &str) -> Result<DeviceGroup> {
        self.groups
            .remove(group_id)
            .map(|(_, group)| group)
            .ok_or_else(|| Error::not_found("group", group_id))
    }

    /// Get a group
    pub fn get_group(&self, group_id: &str) -> Result<DeviceGroup> {
        self.groups
            .get(group_id)
            .map(|g| g.clone())
            .ok_or_else(|| Error::not_found("group", group_id))
    }

    /// Every group, by name
    pub fn list_groups(&self) -> Vec<DeviceGroup> {
        let mut groups: Vec<_> = self.groups.iter().map(|g| g.clone()).collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        groups
    }

    /// Send a command to every member concurrently. One member's failure
    /// never affects the others.
    pub async fn control_group(
        &self,
        group_id: &str,
        command: &str,
        parameters: Params,
    ) -> Result<MemberResults> {
        let group = self.get_group(group_id)?;
        let outcomes = join_all(group.devices.iter().map(|device_id| {
            let parameters = parameters.clone();
            async move {
                let outcome = self
                    .control_device(device_id, command, parameters, Priority::Normal)
                    .await;
                (device_id.clone(), outcome)
            }
        }))
        .await;

        let results: MemberResults = outcomes
            .into_iter()
            .map(|(device_id, outcome)| {
                let result = match outcome {
                    Ok(response) => MemberResult::from_response(response),
                    Err(e) => MemberResult::failed(e.to_string()),
                };
                (device_id, result)
            })
            .collect();
        debug!(
            group_id = %group_id,
            command,
            succeeded = crate::types::success_count(&results),
            total = results.len(),
            "group command finished"
        );
        Ok(results)
    }

    // ----- scheduling -----

    /// Schedule a command at `at` (now when `None`), repeating every
    /// `repeat_every` until cancelled. Returns the schedule id.
    pub fn schedule_command(
        self: &Arc<Self>,
        device_id: &str,
        command: &str,
        parameters: Params,
        at: Option<DateTime<Utc>>,
        repeat_every: Option<Duration>,
    ) -> Result<String> {
        self.manager.get_device(device_id)?;
        let mut info = ScheduledCommand::new(
            device_id,
            command,
            parameters.clone(),
            at.unwrap_or_else(Utc::now),
        );
        info.repeat_every = repeat_every;

        let controller = Arc::downgrade(self);
        let device_id = device_id.to_string();
        let command = command.to_string();
        self.scheduler.schedule(info, move || {
            let controller = controller.clone();
            let device_id = device_id.clone();
            let command = command.clone();
            let parameters = parameters.clone();
            async move {
                let Some(controller) = controller.upgrade() else {
                    return false;
                };
                match controller
                    .control_device(&device_id, &command, parameters, Priority::Normal)
                    .await
                {
                    Ok(response) => response.is_ok(),
                    Err(e) => {
                        warn!(device_id = %device_id, command = %command, error = %e, "scheduled command not delivered");
                        false
                    }
                }
            }
        })
    }

    /// Cancel one schedule of a device, or all of them
    pub fn cancel_schedule(&self, device_id: &str, schedule_id: Option<&str>) -> Result<usize> {
        self.scheduler.cancel(device_id, schedule_id)
    }

    /// Pending schedules, optionally of one device
    pub fn list_schedules(&self, device_id: Option<&str>) -> Vec<ScheduledCommand> {
        self.scheduler.list(device_id)
    }

    // ----- control modes -----

    /// Set how a device is driven. Automatic enables the rules triggered by
    /// the device and manual disables them.
    pub fn set_control_mode(&self, device_id: &str, mode: ControlMode) -> Result<()> {
        self.manager.get_device(device_id)?;
        let rules = self.rules.rules_for_device(device_id);
        match mode {
            ControlMode::Automatic => {
                for rule_id in &rules {
                    self.rules.enable_rule(rule_id)?;
                }
            }
            ControlMode::Manual => {
                for rule_id in &rules {
                    self.rules.disable_rule(rule_id)?;
                }
            }
            ControlMode::Scheduled | ControlMode::Adaptive => {}
        }
        self.modes.insert(device_id.to_string(), mode);
        info!(device_id = %device_id, mode = %mode, rules = rules.len(), "control mode set");
        Ok(())
    }

    /// Current control mode of a device
    pub fn control_mode(&self, device_id: &str) -> ControlMode {
        self.modes.get(device_id).map(|m| *m).unwrap_or_default()
    }

    // ----- scenes -----

    /// Create and persist a scene
    pub async fn create_scene<S: Into<String>>(
        &self,
        name: S,
        devices: BTreeMap<DeviceId, Params>,
    ) -> Result<Scene> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::validation("scene name must not be empty"));
        }
        if devices.is_empty() {
            return Err(Error::validation(format!("scene '{}' has no devices", name)));
        }
        let scene = Scene::new(name, devices);
        self.manager.store().save_scene(&scene).await?;
        info!(scene_id = %scene.id, name = %scene.name, devices = scene.devices.len(), "scene created");
        Ok(scene)
    }

    /// Replay a scene's desired states concurrently, one result per device
    pub async fn activate_scene(&self, scene_id: &str) -> Result<MemberResults> {
        let scene = self
            .list_scenes()
            .await?
            .into_iter()
            .find(|s| s.id == scene_id)
            .ok_or_else(|| Error::not_found("scene", scene_id))?;

        let outcomes = join_all(scene.devices.iter().map(|(device_id, desired)| async move {
            (device_id.clone(), self.set_device_state(device_id, desired).await)
        }))
        .await;

        let results: MemberResults = outcomes
            .into_iter()
            .map(|(device_id, outcome)| {
                let result = match outcome {
                    Ok(fields) => {
                        let failures: Vec<String> = fields
                            .iter()
                            .filter(|f| !f.success)
                            .map(|f| format!("{}: {}", f.field, f.error.as_deref().unwrap_or("failed")))
                            .collect();
                        if failures.is_empty() {
                            MemberResult::ok(None)
                        } else {
                            MemberResult::failed(failures.join("; "))
                        }
                    }
                    Err(e) => MemberResult::failed(e.to_string()),
                };
                (device_id, result)
            })
            .collect();
        info!(scene_id = %scene_id, devices = results.len(), "scene activated");
        Ok(results)
    }

    /// Delete a scene
    pub async fn delete_scene(&self, scene_id: &str) -> Result<()> {
        if self.manager.store().delete_scene(scene_id).await? {
            Ok(())
        } else {
            Err(Error::not_found("scene", scene_id))
        }
    }

    /// Every persisted scene
    pub async fn list_scenes(&self) -> Result<Vec<Scene>> {
        Ok(self.manager.store().load_scenes().await?)
    }

    // ----- automation -----

    /// Add an automation rule; returns its id
    pub fn add_rule(&self, rule: AutomationRule) -> Result<String> {
        self.rules.add_rule(rule)
    }

    /// Replace a rule's definition
    pub fn update_rule(&self, rule_id: &str, rule: AutomationRule) -> Result<AutomationRule> {
        self.rules.update_rule(rule_id, rule)
    }

    /// Remove a rule
    pub fn remove_rule(&self, rule_id: &str) -> Result<AutomationRule> {
        self.rules.remove_rule(rule_id)
    }

    /// Get a rule
    pub fn get_rule(&self, rule_id: &str) -> Result<AutomationRule> {
        self.rules.get_rule(rule_id)
    }

    /// Every rule
    pub fn list_rules(&self) -> Vec<AutomationRule> {
        self.rules.list_rules()
    }

    /// Enable a rule
    pub fn enable_rule(&self, rule_id: &str) -> Result<()> {
        self.rules.enable_rule(rule_id)
    }

    /// Disable a rule
    pub fn disable_rule(&self, rule_id: &str) -> Result<()> {
        self.rules.disable_rule(rule_id)
    }

    // ----- lifecycle -----

    /// Start the rule loops and forward device events to event triggers
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let context: Arc<dyn AutomationContext> = self.clone();
        self.rules.start(Arc::downgrade(&context));

        let mut events = self.manager.events()?;
        let rules = Arc::downgrade(&self.rules);
        self.tasks.push(tokio::spawn(
            async move {
                loop {
                    match events.recv().await {
                        Ok(event) => match rules.upgrade() {
                            Some(rules) => rules.observe_event(&event),
                            None => break,
                        },
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "device events dropped before reaching rules")
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            .instrument(component_span("controller", Some("events"))),
        ));

        info!(rules = self.rules.list_rules().len(), "device controller started");
        Ok(())
    }

    /// Stop the rule loops, cancel schedules and background tasks
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.rules.stop();
        self.scheduler.cancel_all();
        self.tasks.shutdown().await;
        info!("device controller stopped");
    }
}

fn single(key: &str, value: &Value) -> Params {
    let mut params = Params::new();
    params.insert(key.to_string(), value.clone());
    params
}

#[async_trait]
impl AutomationContext for DeviceController {
    async fn device_state(&self, device_id: &str) -> Option<DeviceState> {
        self.manager.states().get_any(device_id)
    }

    async fn control_device(
        &self,
        device_id: &str,
        command: &str,
        parameters: Params,
    ) -> Result<CommandResponse> {
        DeviceController::control_device(self, device_id, command, parameters, Priority::Normal).await
    }

    async fn control_group(
        &self,
        group_id: &str,
        command: &str,
        parameters: Params,
    ) -> Result<MemberResults> {
        DeviceController::control_group(self, group_id, command, parameters).await
    }

    async fn notify(&self, notification: Notification) -> Result<()> {
        self.notifier.notify(&notification).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::condition::{ComparisonOperator, StateComparison};
    use crate::testing::MockAdapter;
    use crate::trigger::Trigger;
    use iotflow_core::device::DeviceType;
    use iotflow_core::params;
    use iotflow_core::store::MemoryStore;
    use iotflow_devices::{AdapterTable, ConnectOptions, DeviceManager};

    struct Fixture {
        controller: Arc<DeviceController>,
        http: Arc<MockAdapter>,
        ws: Arc<MockAdapter>,
        mqtt: Arc<MockAdapter>,
    }

    fn fixture() -> Fixture {
        let mut config = Config::default();
        config.manager.discovery_enabled = false;
        config.commands.default_timeout_secs = 2;
        let http = Arc::new(MockAdapter::new(Protocol::Http));
        let ws = Arc::new(MockAdapter::new(Protocol::WebSocket));
        let mqtt = Arc::new(MockAdapter::new(Protocol::Mqtt));
        let adapters = AdapterTable::new()
            .with_adapter(http.clone())
            .with_adapter(ws.clone())
            .with_adapter(mqtt.clone());
        let manager = Arc::new(DeviceManager::new(&config, Arc::new(MemoryStore::new()), adapters));
        let controller = Arc::new(DeviceController::new(&config, manager));
        Fixture {
            controller,
            http,
            ws,
            mqtt,
        }
    }

    fn light(id: &str) -> Device {
        Device::new(id, DeviceType::Light, Protocol::Http)
            .with_id(id)
            .with_capability(Capability::OnOff)
            .with_capability(Capability::Dimming)
    }

    async fn online(f: &Fixture, device: Device) {
        let id = device.id.clone();
        let manager = f.controller.manager();
        manager.register_device(device).await.unwrap();
        manager.connect_device(&id, ConnectOptions::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_capability_checked_before_sending() {
        let f = fixture();
        online(&f, light("lamp")).await;
        let err = f
            .controller
            .control_device("lamp", "lock", params!(), Priority::Normal)
            .await
            .unwrap_err();
        assert!(err.is_capability());
        assert!(f.http.sent().is_empty());

        // commands outside the table need no capability
        f.controller
            .control_device("lamp", "identify", params!(), Priority::Low)
            .await
            .unwrap();
        assert_eq!(f.http.sent(), vec![("lamp".to_string(), "identify".to_string())]);
    }

    #[tokio::test]
    async fn test_optimistic_state_after_success() {
        let f = fixture();
        online(&f, light("lamp")).await;
        f.controller
            .control_device("lamp", "set_brightness", params!("level" => 40), Priority::Normal)
            .await
            .unwrap();
        f.controller
            .control_device("lamp", "turn_on", params!(), Priority::High)
            .await
            .unwrap();
        let state = f.controller.manager().states().get_any("lamp").unwrap();
        assert_eq!(state.brightness, Some(40));
        assert_eq!(state.power, Some(true));

        let journal = f.controller.recent_commands(10);
        assert_eq!(journal.len(), 2);
        assert_eq!(journal[0].command, "turn_on");
        assert_eq!(journal[0].priority, Priority::High);
        assert_eq!(journal[0].transport, Some(Protocol::Http));
    }

    #[tokio::test]
    async fn test_journal_keeps_newest_commands() {
        let f = fixture();
        online(&f, light("lamp")).await;
        for level in 0..JOURNAL_CAPACITY + 4 {
            f.controller
                .control_device("lamp", "set_brightness", params!("level" => level % 100), Priority::Low)
                .await
                .unwrap();
        }
        assert_eq!(f.http.sent().len(), JOURNAL_CAPACITY + 4);
        let journal = f.controller.recent_commands(usize::MAX);
        assert_eq!(journal.len(), JOURNAL_CAPACITY);
        assert!(journal.iter().all(|record| record.success));
        assert!(journal[0].issued_at >= journal[JOURNAL_CAPACITY - 1].issued_at);
    }

    #[tokio::test]
    async fn test_transport_fallback_order() {
        let f = fixture();
        online(&f, light("lamp")).await;

        f.ws.open("lamp");
        f.controller
            .control_device("lamp", "turn_on", params!(), Priority::Normal)
            .await
            .unwrap();
        assert_eq!(f.ws.sent().len(), 1);
        assert!(f.http.sent().is_empty());

        // a failing session falls through to the bus, then the adapter
        f.ws.fail_commands("lamp");
        f.controller
            .control_device("lamp", "turn_off", params!(), Priority::Normal)
            .await
            .unwrap();
        assert_eq!(f.http.sent(), vec![("lamp".to_string(), "turn_off".to_string())]);

        f.mqtt.open("lamp");
        f.controller
            .control_device("lamp", "turn_on", params!(), Priority::Normal)
            .await
            .unwrap();
        assert_eq!(f.mqtt.sent().len(), 1);
        assert_eq!(f.controller.recent_commands(1)[0].transport, Some(Protocol::Mqtt));
    }

    #[tokio::test]
    async fn test_not_connected_is_distinguishable() {
        let f = fixture();
        f.controller.manager().register_device(light("lamp")).await.unwrap();
        let err = f
            .controller
            .control_device("lamp", "turn_on", params!(), Priority::Normal)
            .await
            .unwrap_err();
        assert!(err.is_not_connected());
        assert!(!f.controller.recent_commands(1)[0].success);
        assert!(f
            .controller
            .control_device("ghost", "turn_on", params!(), Priority::Normal)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_set_device_state_reports_per_field() {
        let f = fixture();
        online(&f, light("lamp")).await;
        let desired = params!("volume" => 3, "power" => "on", "brightness" => 70, "color" => "red");
        let results = f.controller.set_device_state("lamp", &desired).await.unwrap();
        let fields: Vec<&str> = results.iter().map(|r| r.field.as_str()).collect();
        assert_eq!(fields, vec!["power", "brightness", "color", "volume"]);
        assert!(results[0].success);
        assert!(results[1].success);
        assert!(!results[2].success, "light lacks color control");
        assert!(results[3].success);
        let state = f.controller.manager().states().get_any("lamp").unwrap();
        assert_eq!(state.power, Some(true));
        assert_eq!(state.volume, Some(3));
    }

    #[tokio::test]
    async fn test_group_member_failure_is_isolated() {
        let f = fixture();
        for id in ["a", "b", "c"] {
            online(&f, light(id)).await;
        }
        f.http.fail_commands("b");
        let group = f
            .controller
            .create_group("hall", vec!["a".into(), "b".into(), "c".into(), "a".into()], Some("room".into()))
            .unwrap();
        assert_eq!(group.devices.len(), 3);

        let results = f
            .controller
            .control_group(&group.id, "turn_on", params!())
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(crate::types::success_count(&results), 2);
        assert!(!results["b"].success);

        assert_eq!(f.controller.list_groups().len(), 1);
        f.controller.delete_group(&group.id).unwrap();
        assert!(f
            .controller
            .control_group(&group.id, "turn_on", params!())
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_scene_round_trip() {
        let f = fixture();
        online(&f, light("a")).await;
        online(&f, light("b")).await;
        let mut devices = BTreeMap::new();
        devices.insert("a".to_string(), params!("power" => true));
        devices.insert("b".to_string(), params!("power" => false));
        let scene = f.controller.create_scene("evening", devices).await.unwrap();

        let results = f.controller.activate_scene(&scene.id).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|r| r.success));
        let states = f.controller.manager().states();
        assert_eq!(states.get_any("a").unwrap().power, Some(true));
        assert_eq!(states.get_any("b").unwrap().power, Some(false));

        assert_eq!(f.controller.list_scenes().await.unwrap().len(), 1);
        f.controller.delete_scene(&scene.id).await.unwrap();
        assert!(f.controller.activate_scene(&scene.id).await.unwrap_err().is_not_found());
        assert!(f.controller.delete_scene(&scene.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_command_repeats_until_cancelled() {
        let f = fixture();
        online(&f, light("lamp")).await;
        let id = f
            .controller
            .schedule_command("lamp", "turn_on", params!(), None, Some(Duration::from_secs(60)))
            .unwrap();
        assert_eq!(f.controller.list_schedules(Some("lamp"))[0].id, id);

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(f.http.sent().len(), 3);

        assert_eq!(f.controller.cancel_schedule("lamp", Some(&id)).unwrap(), 1);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(f.http.sent().len(), 3);
        assert!(f.controller.list_schedules(None).is_empty());
    }

    fn hot_rule() -> AutomationRule {
        AutomationRule::new("cool down")
            .with_id("cool")
            .with_trigger(Trigger::DeviceState(StateComparison::new(
                "a",
                "temperature",
                ComparisonOperator::Gt,
                json!(30),
            )))
            .with_action(Action::DeviceCommand {
                device_id: "b".into(),
                command: "turn_off".into(),
                parameters: params!(),
            })
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_rule_turns_off_device_once() {
        let f = fixture();
        let sensor = Device::new("Thermo", DeviceType::Sensor, Protocol::Http)
            .with_id("a")
            .with_capability(Capability::TemperatureSensing);
        online(&f, sensor).await;
        online(&f, light("b")).await;
        f.controller.add_rule(hot_rule()).unwrap();
        f.controller.start().await.unwrap();

        f.controller
            .manager()
            .states()
            .update("a", |s| s.temperature = Some(31.0));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.http.sent(), vec![("b".to_string(), "turn_off".to_string())]);
        assert_eq!(f.controller.get_rule("cool").unwrap().trigger_count, 1);

        f.controller.stop().await;
    }

    #[tokio::test]
    async fn test_control_mode_toggles_rules() {
        let f = fixture();
        online(&f, light("a")).await;
        f.controller.add_rule(hot_rule()).unwrap();
        assert_eq!(f.controller.control_mode("a"), ControlMode::Manual);

        f.controller.set_control_mode("a", ControlMode::Manual).unwrap();
        assert!(!f.controller.get_rule("cool").unwrap().enabled);
        f.controller.set_control_mode("a", ControlMode::Automatic).unwrap();
        assert!(f.controller.get_rule("cool").unwrap().enabled);
        assert_eq!(f.controller.control_mode("a"), ControlMode::Automatic);

        // rules triggered by other devices are untouched
        online(&f, light("b")).await;
        f.controller.set_control_mode("b", ControlMode::Manual).unwrap();
        assert!(f.controller.get_rule("cool").unwrap().enabled);
        assert!(f
            .controller
            .set_control_mode("ghost", ControlMode::Automatic)
            .unwrap_err()
            .is_not_found());
    }
}
