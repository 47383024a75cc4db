/*!
 * Rule triggers.
 *
 * A rule is triggered when any of its triggers is satisfied. State and time
 * triggers are levels, re-read on every poll tick; event triggers are
 * pulses counted as events arrive.
 */
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Timelike, Utc};
use iotflow_core::event::DeviceEvent;
use serde::{Deserialize, Serialize};

use crate::condition::StateComparison;
use crate::types::clock_time;

const SECONDS_PER_DAY: i64 = 86_400;

/// What starts a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// A device attribute compares true
    DeviceState(StateComparison),
    /// The UTC time of day is within tolerance of `time`
    Time {
        #[allow(missing_docs)]
        #[serde(with = "clock_time")]
        time: NaiveTime,
    },
    /// A device event of the given type arrived
    Event {
        #[allow(missing_docs)]
        event_type: String,
        /// Restrict to events from this device
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
    },
}

impl Trigger {
    /// Device whose state or events this trigger watches
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Trigger::DeviceState(cmp) => Some(&cmp.device_id),
            Trigger::Event { device_id, .. } => device_id.as_deref(),
            Trigger::Time { .. } => None,
        }
    }

    /// Whether this is an event trigger
    pub fn is_event(&self) -> bool {
        matches!(self, Trigger::Event { .. })
    }

    /// Whether `now` is within `tolerance` of a time trigger, measured
    /// around the clock so 23:59:30 matches 00:00
    pub fn time_matches(&self, now: DateTime<Utc>, tolerance: Duration) -> bool {
        match self {
            Trigger::Time { time } => {
                let target = i64::from(time.num_seconds_from_midnight());
                let current = i64::from(now.time().num_seconds_from_midnight());
                let d = (current - target).abs();
                let distance = d.min(SECONDS_PER_DAY - d);
                distance <= tolerance.as_secs() as i64
            }
            _ => false,
        }
    }

    /// Whether an event trigger accepts `event`
    pub fn matches_event(&self, event: &DeviceEvent) -> bool {
        match self {
            Trigger::Event {
                event_type,
                device_id,
            } => {
                event.is(event_type)
                    && device_id
                        .as_deref()
                        .map_or(true, |id| id == event.device_id)
            }
            _ => false,
        }
    }
}
