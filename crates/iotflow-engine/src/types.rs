/*!
 * Shared engine types: control modes, per-member outcomes and the
 * wire formats of clock times and weekdays used in rule definitions.
 */
use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveTime, Weekday};
use iotflow_core::device::CommandResponse;
use iotflow_core::types::DeviceId;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How a device is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    /// Only explicit commands; rules triggered by the device are disabled
    Manual,
    /// Rules triggered by the device are enabled
    Automatic,
    /// Driven by scheduled commands
    Scheduled,
    /// Reserved for learned control
    Adaptive,
}

impl Default for ControlMode {
    fn default() -> Self {
        ControlMode::Manual
    }
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlMode::Manual => "manual",
            ControlMode::Automatic => "automatic",
            ControlMode::Scheduled => "scheduled",
            ControlMode::Adaptive => "adaptive",
        };
        f.write_str(name)
    }
}

/// Outcome of one member of a group or scene operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberResult {
    /// Whether the member completed
    pub success: bool,
    /// Device response, when a command was delivered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<CommandResponse>,
    /// Failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MemberResult {
    /// A member that completed, with the device response if any
    pub fn ok(response: Option<CommandResponse>) -> Self {
        Self {
            success: true,
            response,
            error: None,
        }
    }

    /// A member that failed
    pub fn failed<S: Into<String>>(error: S) -> Self {
        Self {
            success: false,
            response: None,
            error: Some(error.into()),
        }
    }

    /// Classify a delivered response: a device-reported error is a failure
    pub fn from_response(response: CommandResponse) -> Self {
        if response.is_ok() {
            Self::ok(Some(response))
        } else {
            let error = response
                .error
                .clone()
                .unwrap_or_else(|| "device reported an error".to_string());
            Self {
                success: false,
                response: Some(response),
                error: Some(error),
            }
        }
    }
}

/// Per-device outcomes of a fan-out operation
pub type MemberResults = BTreeMap<DeviceId, MemberResult>;

/// Count the successes in a fan-out result
pub fn success_count(results: &MemberResults) -> usize {
    results.values().filter(|r| r.success).count()
}

/// Outcome of one field of a desired-state update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldResult {
    /// Desired-state field, e.g. `brightness`
    pub field: String,
    /// Command the field was translated to
    pub command: String,
    #[allow(missing_docs)]
    pub success: bool,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Parse an `HH:MM` or `HH:MM:SS` clock time
pub fn parse_clock_time(text: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(text, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M:%S"))
        .map_err(|e| Error::validation(format!("invalid time '{}': {}", text, e)))
}

/// Whether `now` lies in `[start, end]`; a window whose end is before its
/// start spans midnight
pub fn within_window(start: Option<NaiveTime>, end: Option<NaiveTime>, now: NaiveTime) -> bool {
    match (start, end) {
        (Some(start), Some(end)) if start <= end => start <= now && now <= end,
        (Some(start), Some(end)) => now >= start || now <= end,
        (Some(start), None) => now >= start,
        (None, Some(end)) => now <= end,
        (None, None) => true,
    }
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// `HH:MM` serde format for [`NaiveTime`]
pub mod clock_time {
    use chrono::NaiveTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[allow(missing_docs)]
    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format("%H:%M").to_string())
    }

    #[allow(missing_docs)]
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let text = String::deserialize(d)?;
        super::parse_clock_time(&text).map_err(de::Error::custom)
    }

    /// The same format for optional fields
    pub mod option {
        use chrono::NaiveTime;
        use serde::{de, Deserialize, Deserializer, Serializer};

        #[allow(missing_docs)]
        pub fn serialize<S: Serializer>(time: &Option<NaiveTime>, s: S) -> Result<S::Ok, S::Error> {
            match time {
                Some(time) => s.serialize_str(&time.format("%H:%M").to_string()),
                None => s.serialize_none(),
            }
        }

        #[allow(missing_docs)]
        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveTime>, D::Error> {
            match Option::<String>::deserialize(d)? {
                Some(text) => crate::types::parse_clock_time(&text)
                    .map(Some)
                    .map_err(de::Error::custom),
                None => Ok(None),
            }
        }
    }
}

/// Weekday lists written as lowercase names (`"monday"`); short and
/// capitalized names are accepted on input
pub mod weekdays {
    use chrono::Weekday;
    use serde::{de, ser::SerializeSeq, Deserialize, Deserializer, Serializer};

    #[allow(missing_docs)]
    pub fn serialize<S: Serializer>(days: &[Weekday], s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(days.len()))?;
        for day in days {
            seq.serialize_element(super::weekday_name(*day))?;
        }
        seq.end()
    }

    #[allow(missing_docs)]
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Weekday>, D::Error> {
        Vec::<String>::deserialize(d)?
            .iter()
            .map(|name| {
                name.parse::<Weekday>()
                    .map_err(|_| de::Error::custom(format!("unknown weekday '{}'", name)))
            })
            .collect()
    }
}
