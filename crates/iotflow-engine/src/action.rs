/*!
 * Rule actions.
 *
 * Actions run in order once a rule fires. A failing action is reported in
 * the rule's results and never stops the actions after it.
 */
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use iotflow_core::event::Severity;
use iotflow_core::types::{Params, Value};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::context::AutomationContext;
use crate::types::success_count;

/// Result of executing an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionResult {
    /// Action executed successfully with a value
    Success(Value),
    /// Action executed successfully with no value
    Completed,
    /// Action execution failed
    Failure(String),
    /// The device did not answer in time
    Timeout,
}

impl ActionResult {
    /// Check if the action executed successfully
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Completed)
    }

    /// Check if the action failed
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_) | Self::Timeout)
    }

    /// Get the value if successful
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Success(v) => Some(v),
            _ => None,
        }
    }

    /// Get the error message if failed
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failure(msg) => Some(msg),
            Self::Timeout => Some("Action execution timed out"),
            _ => None,
        }
    }
}

/// Something a rule does when it fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Send a command to one device
    DeviceCommand {
        #[allow(missing_docs)]
        device_id: String,
        #[allow(missing_docs)]
        command: String,
        #[allow(missing_docs)]
        #[serde(default)]
        parameters: Params,
    },
    /// Send a command to every member of a group
    GroupCommand {
        #[allow(missing_docs)]
        group_id: String,
        #[allow(missing_docs)]
        command: String,
        #[allow(missing_docs)]
        #[serde(default)]
        parameters: Params,
    },
    /// Pause before the next action
    Delay {
        #[allow(missing_docs)]
        seconds: f64,
    },
    /// Hand a message to the notifier
    Notification {
        #[allow(missing_docs)]
        message: String,
        #[allow(missing_docs)]
        #[serde(default)]
        severity: Severity,
        #[allow(missing_docs)]
        #[serde(default)]
        data: Params,
    },
}

impl Action {
    /// Action type tag
    pub fn action_type(&self) -> &'static str {
        match self {
            Action::DeviceCommand { .. } => "device_command",
            Action::GroupCommand { .. } => "group_command",
            Action::Delay { .. } => "delay",
            Action::Notification { .. } => "notification",
        }
    }

    /// Device this action commands, if any
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Action::DeviceCommand { device_id, .. } => Some(device_id),
            _ => None,
        }
    }

    /// Execute on behalf of a rule
    pub async fn execute(
        &self,
        ctx: &dyn AutomationContext,
        rule_id: &str,
        rule_name: &str,
    ) -> ActionResult {
        match self {
            Action::DeviceCommand {
                device_id,
                command,
                parameters,
            } => match ctx.control_device(device_id, command, parameters.clone()).await {
                Ok(response) if response.is_ok() => ActionResult::Success(response.result),
                Ok(response) => ActionResult::Failure(
                    response
                        .error
                        .unwrap_or_else(|| format!("{} rejected {}", device_id, command)),
                ),
                Err(e) if e.is_timeout() => ActionResult::Timeout,
                Err(e) => ActionResult::Failure(e.to_string()),
            },
            Action::GroupCommand {
                group_id,
                command,
                parameters,
            } => match ctx.control_group(group_id, command, parameters.clone()).await {
                Ok(results) => {
                    let succeeded = success_count(&results);
                    if succeeded == results.len() {
                        match serde_json::to_value(&results) {
                            Ok(value) => ActionResult::Success(value),
                            Err(_) => ActionResult::Completed,
                        }
                    } else {
                        ActionResult::Failure(format!(
                            "{} of {} members of group {} failed",
                            results.len() - succeeded,
                            results.len(),
                            group_id
                        ))
                    }
                }
                Err(e) => ActionResult::Failure(e.to_string()),
            },
            Action::Delay { seconds } => {
                tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
                ActionResult::Completed
            }
            Action::Notification {
                message,
                severity,
                data,
            } => {
                let notification = Notification {
                    rule_id: rule_id.to_string(),
                    rule_name: rule_name.to_string(),
                    message: message.clone(),
                    severity: *severity,
                    data: data.clone(),
                    timestamp: Utc::now(),
                };
                match ctx.notify(notification).await {
                    Ok(()) => ActionResult::Completed,
                    Err(e) => ActionResult::Failure(e.to_string()),
                }
            }
        }
    }
}

/// A message raised by a rule's notification action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Rule that raised it
    pub rule_id: String,
    #[allow(missing_docs)]
    pub rule_name: String,
    #[allow(missing_docs)]
    pub message: String,
    #[allow(missing_docs)]
    pub severity: Severity,
    #[allow(missing_docs)]
    #[serde(default)]
    pub data: Params,
    #[allow(missing_docs)]
    pub timestamp: DateTime<Utc>,
}

/// Delivers notifications to people or outside systems
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notification
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Notifier that writes to the log
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: &Notification) -> anyhow::Result<()> {
        match n.severity {
            Severity::Info => {
                info!(rule_id = %n.rule_id, rule = %n.rule_name, data = ?n.data, "{}", n.message)
            }
            Severity::Warning => {
                warn!(rule_id = %n.rule_id, rule = %n.rule_name, data = ?n.data, "{}", n.message)
            }
            Severity::Error | Severity::Critical => {
                error!(rule_id = %n.rule_id, rule = %n.rule_name, data = ?n.data, "{}", n.message)
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingContext;
    use iotflow_core::params;
    use serde_json::json;

    #[tokio::test]
    async fn test_device_command_outcomes() {
        let ctx = RecordingContext::new();
        let action = Action::DeviceCommand {
            device_id: "lamp".into(),
            command: "turn_off".into(),
            parameters: params!(),
        };
        assert!(action.execute(&ctx, "r1", "rule").await.is_success());
        assert_eq!(ctx.commands(), vec![("lamp".to_string(), "turn_off".to_string())]);

        ctx.reject("lamp");
        let result = action.execute(&ctx, "r1", "rule").await;
        assert!(result.is_failure());

        ctx.time_out("lamp");
        assert_eq!(action.execute(&ctx, "r1", "rule").await, ActionResult::Timeout);
    }

    #[tokio::test]
    async fn test_group_with_failed_member_is_failure() {
        let ctx = RecordingContext::new();
        ctx.add_group("hall", &["a", "b", "c"]);
        ctx.reject("b");
        let action = Action::GroupCommand {
            group_id: "hall".into(),
            command: "turn_on".into(),
            parameters: params!(),
        };
        let result = action.execute(&ctx, "r1", "rule").await;
        assert_eq!(result.error(), Some("1 of 3 members of group hall failed"));
    }

    #[tokio::test]
    async fn test_notification_reaches_context() {
        let ctx = RecordingContext::new();
        let action: Action = serde_json::from_value(json!({
            "type": "notification",
            "message": "door left open",
            "severity": "warning"
        }))
        .unwrap();
        assert_eq!(action.execute(&ctx, "r9", "door watch").await, ActionResult::Completed);
        let sent = ctx.notifications();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].rule_id, "r9");
        assert_eq!(sent[0].severity, Severity::Warning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_waits() {
        let ctx = RecordingContext::new();
        let started = tokio::time::Instant::now();
        let action = Action::Delay { seconds: 2.5 };
        assert!(action.execute(&ctx, "r1", "rule").await.is_success());
        assert!(started.elapsed() >= Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_log_notifier_accepts_everything() {
        let n = Notification {
            rule_id: "r".into(),
            rule_name: "rule".into(),
            message: "hello".into(),
            severity: Severity::Critical,
            data: params!("k" => 1),
            timestamp: Utc::now(),
        };
        assert!(LogNotifier.notify(&n).await.is_ok());
    }
}
