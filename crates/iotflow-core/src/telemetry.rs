/*!
 * Telemetry data model: raw samples and their multi-resolution aggregates.
 */
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::{DeviceId, Params};

/// A single metric sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMetric {
    #[allow(missing_docs)]
    pub device_id: DeviceId,
    #[allow(missing_docs)]
    pub metric_name: String,
    /// Normalized numeric value
    pub value: f64,
    #[allow(missing_docs)]
    #[serde(default)]
    pub unit: Option<String>,
    #[allow(missing_docs)]
    pub timestamp: DateTime<Utc>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub metadata: Params,
}

/// Aggregation granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    /// One minute windows
    #[serde(rename = "1min")]
    Minute,
    /// Five minute windows
    #[serde(rename = "5min")]
    FiveMinutes,
    /// One hour windows
    #[serde(rename = "1hour")]
    Hour,
    /// One day windows
    #[serde(rename = "1day")]
    Day,
}

impl Resolution {
    /// All resolutions from finest to coarsest
    pub const ALL: [Resolution; 4] = [
        Resolution::Minute,
        Resolution::FiveMinutes,
        Resolution::Hour,
        Resolution::Day,
    ];

    /// Tag used in storage and queries
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Minute => "1min",
            Resolution::FiveMinutes => "5min",
            Resolution::Hour => "1hour",
            Resolution::Day => "1day",
        }
    }

    /// Window length
    pub fn window(&self) -> TimeDelta {
        match self {
            Resolution::Minute => TimeDelta::minutes(1),
            Resolution::FiveMinutes => TimeDelta::minutes(5),
            Resolution::Hour => TimeDelta::hours(1),
            Resolution::Day => TimeDelta::days(1),
        }
    }

    /// Start of the window containing `ts`
    pub fn window_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        ts.duration_trunc(self.window()).unwrap_or(ts)
    }

    /// The most recent window that closed at or before `now`
    pub fn preceding_window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let end = self.window_start(now);
        (end - self.window(), end)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1min" => Ok(Resolution::Minute),
            "5min" => Ok(Resolution::FiveMinutes),
            "1hour" => Ok(Resolution::Hour),
            "1day" => Ok(Resolution::Day),
            other => Err(Error::invalid(format!("unknown resolution '{}'", other))),
        }
    }
}

/// Summary of the samples of one metric in one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct TelemetryAggregation {
    pub device_id: DeviceId,
    pub metric_name: String,
    pub resolution: Resolution,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub count: usize,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub stddev: f64,
    /// Percentile (25, 50, 75, 90, 95, 99) to value
    pub percentiles: BTreeMap<u8, f64>,
}

impl TelemetryAggregation {
    /// Upsert key: (device, metric, resolution, window start)
    pub fn key(&self) -> AggregationKey {
        AggregationKey {
            device_id: self.device_id.clone(),
            metric_name: self.metric_name.clone(),
            resolution: self.resolution,
            start_time: self.start_time,
        }
    }
}

/// Identity of an aggregate row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(missing_docs)]
pub struct AggregationKey {
    pub device_id: DeviceId,
    pub metric_name: String,
    pub resolution: Resolution,
    pub start_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_resolution_tags() {
        for r in Resolution::ALL {
            assert_eq!(r.as_str().parse::<Resolution>().unwrap(), r);
        }
        assert_eq!(
            serde_json::to_value(Resolution::Hour).unwrap(),
            serde_json::json!("1hour")
        );
    }

    #[test]
    fn test_preceding_window() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 14, 7, 30).unwrap();
        let (start, end) = Resolution::FiveMinutes.preceding_window(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 5, 10, 14, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 5, 10, 14, 5, 0).unwrap());

        let (start, end) = Resolution::Day.preceding_window(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 5, 9, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap());
    }
}
