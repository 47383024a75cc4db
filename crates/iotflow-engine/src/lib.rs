/*!
 * iotflow engine
 *
 * Device control, automation and telemetry on top of the device manager:
 * the [`DeviceController`] (commands, groups, scenes, schedules, control
 * modes), the trigger/condition/action [`RuleEngine`] and the
 * [`TelemetryCollector`].
 */

#![warn(missing_docs)]

// Re-export core types
pub use iotflow_core::prelude;

pub mod action;
pub mod condition;
pub mod context;
pub mod controller;
pub mod error;
pub mod rules;
pub mod scheduler;
pub mod telemetry;
pub mod trigger;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use action::{Action, ActionResult, LogNotifier, Notification, Notifier};
pub use condition::{ComparisonOperator, Condition, StateComparison};
pub use context::AutomationContext;
pub use controller::{CommandRecord, DeviceController, SharedDeviceController};
pub use error::{Error, Result};
pub use rules::{AutomationRule, RuleEngine, RuleEngineEvent, RuleEvaluation, RuleSchedule};
pub use scheduler::{CommandScheduler, ScheduledCommand};
pub use telemetry::{
    AnomalyDetector, MetricHistory, MetricProcessor, SharedTelemetryCollector, TelemetryCollector,
    ThresholdDetector, ZScoreDetector,
};
pub use trigger::Trigger;
pub use types::{ControlMode, FieldResult, MemberResult, MemberResults};

/// iotflow engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the engine
pub fn init() -> Result<()> {
    tracing::info!(version = VERSION, "iotflow engine initialized");
    Ok(())
}
