//! Test doubles shared by the engine's unit tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use iotflow_core::device::{CommandResponse, Device, DeviceCommand, DeviceState, Protocol};
use iotflow_core::types::Params;
use iotflow_devices::{ConnectOptions, DeviceError, ProtocolAdapter, Subscription};
use serde_json::json;
use tokio::sync::mpsc;

use crate::action::Notification;
use crate::context::AutomationContext;
use crate::error::{Error, Result};
use crate::types::{MemberResult, MemberResults};

/// Automation context backed by plain maps, recording what rules do
#[derive(Debug, Default)]
pub struct RecordingContext {
    states: DashMap<String, DeviceState>,
    groups: DashMap<String, Vec<String>>,
    rejected: DashSet<String>,
    timing_out: DashSet<String>,
    commands: Mutex<Vec<(String, String)>>,
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, device_id: &str, state: DeviceState) {
        self.states.insert(device_id.to_string(), state);
    }

    pub fn set_temperature(&self, device_id: &str, value: f64) {
        let mut state = self.states.get(device_id).map(|s| s.clone()).unwrap_or_default();
        state.temperature = Some(value);
        self.set_state(device_id, state);
    }

    pub fn add_group(&self, group_id: &str, members: &[&str]) {
        self.groups.insert(
            group_id.to_string(),
            members.iter().map(|m| m.to_string()).collect(),
        );
    }

    pub fn reject(&self, device_id: &str) {
        self.rejected.insert(device_id.to_string());
    }

    pub fn time_out(&self, device_id: &str) {
        self.timing_out.insert(device_id.to_string());
    }

    pub fn commands(&self) -> Vec<(String, String)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }
}

#[async_trait]
impl AutomationContext for RecordingContext {
    async fn device_state(&self, device_id: &str) -> Option<DeviceState> {
        self.states.get(device_id).map(|s| s.clone())
    }

    async fn control_device(
        &self,
        device_id: &str,
        command: &str,
        _parameters: Params,
    ) -> Result<CommandResponse> {
        if self.timing_out.contains(device_id) {
            return Err(DeviceError::timeout(device_id, command, Duration::from_secs(1)).into());
        }
        self.commands
            .lock()
            .unwrap()
            .push((device_id.to_string(), command.to_string()));
        if self.rejected.contains(device_id) {
            Ok(CommandResponse::error("c", "rejected"))
        } else {
            Ok(CommandResponse::ok("c", json!({})))
        }
    }

    async fn control_group(
        &self,
        group_id: &str,
        command: &str,
        parameters: Params,
    ) -> Result<MemberResults> {
        let members = self
            .groups
            .get(group_id)
            .map(|g| g.clone())
            .ok_or_else(|| Error::not_found("group", group_id))?;
        let mut results = MemberResults::new();
        for member in members {
            let result = match self.control_device(&member, command, parameters.clone()).await {
                Ok(response) => MemberResult::from_response(response),
                Err(e) => MemberResult::failed(e.to_string()),
            };
            results.insert(member, result);
        }
        Ok(results)
    }

    async fn notify(&self, notification: Notification) -> Result<()> {
        self.notifications.lock().unwrap().push(notification);
        Ok(())
    }
}

/// In-process adapter that answers every command
#[derive(Debug)]
pub struct MockAdapter {
    protocol: Protocol,
    connected: DashSet<String>,
    failing: DashSet<String>,
    sent: Mutex<Vec<(String, String)>>,
    states: DashMap<String, DeviceState>,
}

impl MockAdapter {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            connected: DashSet::new(),
            failing: DashSet::new(),
            sent: Mutex::new(Vec::new()),
            states: DashMap::new(),
        }
    }

    /// Mark a session as open without going through `connect`
    pub fn open(&self, device_id: &str) {
        self.connected.insert(device_id.to_string());
    }

    /// Make every command to `device_id` fail at the transport
    pub fn fail_commands(&self, device_id: &str) {
        self.failing.insert(device_id.to_string());
    }

    /// Commands that reached this adapter, as (device, command)
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProtocolAdapter for MockAdapter {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn connect(&self, device: &Device, _options: ConnectOptions) -> iotflow_devices::Result<bool> {
        self.connected.insert(device.id.clone());
        Ok(true)
    }

    async fn disconnect(&self, device_id: &str) -> iotflow_devices::Result<bool> {
        Ok(self.connected.remove(device_id).is_some())
    }

    async fn is_connected(&self, device_id: &str) -> bool {
        self.connected.contains(device_id)
    }

    async fn send_command(
        &self,
        device_id: &str,
        command: DeviceCommand,
    ) -> iotflow_devices::Result<CommandResponse> {
        if !self.connected.contains(device_id) {
            return Err(DeviceError::not_connected(device_id));
        }
        if self.failing.contains(device_id) {
            return Err(DeviceError::transport(self.protocol, "link reset"));
        }
        self.sent
            .lock()
            .unwrap()
            .push((device_id.to_string(), command.command.clone()));
        Ok(CommandResponse::ok(
            command.command_id,
            json!({"via": self.protocol.as_str()}),
        ))
    }

    async fn read_state(&self, device_id: &str) -> iotflow_devices::Result<DeviceState> {
        Ok(self
            .states
            .get(device_id)
            .map(|s| s.clone())
            .unwrap_or_else(DeviceState::new))
    }

    async fn subscribe(&self, device_id: &str, filter: &str) -> iotflow_devices::Result<Subscription> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(Subscription::new(1, device_id, filter, rx))
    }

    async fn unsubscribe(&self, _device_id: &str, _subscription_id: u64) -> iotflow_devices::Result<bool> {
        Ok(true)
    }

    async fn ping(&self, device_id: &str) -> iotflow_devices::Result<bool> {
        Ok(self.connected.contains(device_id))
    }
}
