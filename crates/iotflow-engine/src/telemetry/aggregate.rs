/*!
 * Window statistics over raw samples.
 */
use std::collections::BTreeMap;

use chrono::{DateTime, Timelike, Utc};
use iotflow_core::telemetry::{Resolution, TelemetryAggregation, TelemetryMetric};

/// Percentiles computed for every aggregate
pub const PERCENTILES: [u8; 6] = [25, 50, 75, 90, 95, 99];

/// Summarize one series over `[start, end)`. `None` when there are no values.
///
/// The standard deviation is the sample deviation (zero for a single
/// value). Percentile `p` is the sorted value at index `floor(n * p / 100)`,
/// clamped to the last element.
pub fn summarize(
    device_id: &str,
    metric_name: &str,
    resolution: Resolution,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    values: &[f64],
) -> Option<TelemetryAggregation> {
    if values.is_empty() {
        return None;
    }
    let n = values.len();
    let sum: f64 = values.iter().sum();
    let avg = sum / n as f64;
    let stddev = if n > 1 {
        let var = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / (n - 1) as f64;
        var.sqrt()
    } else {
        0.0
    };

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let percentiles = PERCENTILES
        .iter()
        .map(|&p| {
            let idx = (n * p as usize / 100).min(n - 1);
            (p, sorted[idx])
        })
        .collect();

    Some(TelemetryAggregation {
        device_id: device_id.to_string(),
        metric_name: metric_name.to_string(),
        resolution,
        start_time: start,
        end_time: end,
        count: n,
        sum,
        min: sorted[0],
        max: sorted[n - 1],
        avg,
        stddev,
        percentiles,
    })
}

/// Aggregate every (device, metric) series found in `metrics`
pub fn aggregate_window(
    metrics: &[TelemetryMetric],
    resolution: Resolution,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<TelemetryAggregation> {
    let mut series: BTreeMap<(&str, &str), Vec<f64>> = BTreeMap::new();
    for m in metrics
        .iter()
        .filter(|m| m.timestamp >= start && m.timestamp < end)
    {
        series
            .entry((m.device_id.as_str(), m.metric_name.as_str()))
            .or_default()
            .push(m.value);
    }
    series
        .into_iter()
        .filter_map(|((device, metric), values)| {
            summarize(device, metric, resolution, start, end, &values)
        })
        .collect()
}

/// Resolutions whose window closes at the aggregation tick `now`
pub fn due_resolutions(now: DateTime<Utc>) -> Vec<Resolution> {
    let mut due = vec![Resolution::Minute];
    if now.minute() % 5 == 0 {
        due.push(Resolution::FiveMinutes);
    }
    if now.minute() == 0 {
        due.push(Resolution::Hour);
        if now.hour() == 0 {
            due.push(Resolution::Day);
        }
    }
    due
}
