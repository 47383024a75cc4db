/*!
 * What automation rules can see and do.
 *
 * Triggers and conditions read device state, actions drive devices and
 * groups or raise notifications. The device controller is the production
 * implementation; tests substitute their own.
 */
use async_trait::async_trait;
use iotflow_core::device::{CommandResponse, DeviceState};
use iotflow_core::types::Params;

use crate::action::Notification;
use crate::error::Result;
use crate::types::MemberResults;

/// Services available to rule evaluation
#[async_trait]
pub trait AutomationContext: Send + Sync {
    /// Latest known state of a device, `None` when there is none
    async fn device_state(&self, device_id: &str) -> Option<DeviceState>;

    /// Send a command to one device
    async fn control_device(
        &self,
        device_id: &str,
        command: &str,
        parameters: Params,
    ) -> Result<CommandResponse>;

    /// Send a command to every member of a group
    async fn control_group(
        &self,
        group_id: &str,
        command: &str,
        parameters: Params,
    ) -> Result<MemberResults>;

    /// Deliver a notification raised by a rule
    async fn notify(&self, notification: Notification) -> Result<()>;
}
