//! Bounded per-series sample buffers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use iotflow_core::telemetry::TelemetryMetric;
use iotflow_core::types::DeviceId;
use tracing::warn;

type SeriesKey = (DeviceId, String);

/// FIFO buffers keyed by (device, metric). A full buffer drops its oldest
/// sample to make room.
#[derive(Debug)]
pub struct MetricBuffer {
    capacity: usize,
    series: DashMap<SeriesKey, VecDeque<TelemetryMetric>>,
    dropped: AtomicU64,
}

impl MetricBuffer {
    /// Create buffers holding at most `capacity` samples per series
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            series: DashMap::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append a sample; returns the length of its series afterwards
    pub fn push(&self, metric: TelemetryMetric) -> usize {
        let key = (metric.device_id.clone(), metric.metric_name.clone());
        let mut queue = self.series.entry(key).or_default();
        if queue.len() == self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                device_id = %metric.device_id,
                metric = %metric.metric_name,
                capacity = self.capacity,
                "telemetry buffer full, oldest sample dropped"
            );
        }
        queue.push_back(metric);
        queue.len()
    }

    /// Take every buffered sample of a device, oldest first per series
    pub fn drain_device(&self, device_id: &str) -> Vec<TelemetryMetric> {
        let mut drained = Vec::new();
        for mut entry in self.series.iter_mut() {
            if entry.key().0 == device_id {
                drained.extend(entry.value_mut().drain(..));
            }
        }
        self.series.retain(|_, queue| !queue.is_empty());
        drained
    }

    /// Put samples back at the front of their series, ahead of anything
    /// collected since. The capacity still holds; the oldest go first.
    pub fn requeue_front(&self, metrics: Vec<TelemetryMetric>) {
        for metric in metrics.into_iter().rev() {
            let key = (metric.device_id.clone(), metric.metric_name.clone());
            let mut queue = self.series.entry(key).or_default();
            if queue.len() == self.capacity {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            queue.push_front(metric);
        }
    }

    /// Devices with buffered samples
    pub fn devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self
            .series
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| e.key().0.clone())
            .collect();
        devices.sort();
        devices.dedup();
        devices
    }

    /// Samples buffered for one series
    pub fn series_len(&self, device_id: &str, metric_name: &str) -> usize {
        self.series
            .get(&(device_id.to_string(), metric_name.to_string()))
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Samples buffered across every series
    pub fn len(&self) -> usize {
        self.series.iter().map(|e| e.value().len()).sum()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples discarded because a series was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use iotflow_core::types::Params;

    fn sample(device: &str, metric: &str, value: f64) -> TelemetryMetric {
        TelemetryMetric {
            device_id: device.into(),
            metric_name: metric.into(),
            value,
            unit: None,
            timestamp: Utc::now() + TimeDelta::milliseconds(value as i64),
            metadata: Params::new(),
        }
    }

    #[test]
    fn test_full_series_drops_oldest() {
        let buffer = MetricBuffer::new(3);
        for v in 0..5 {
            buffer.push(sample("d", "t", v as f64));
        }
        assert_eq!(buffer.series_len("d", "t"), 3);
        assert_eq!(buffer.dropped(), 2);
        let values: Vec<f64> = buffer.drain_device("d").iter().map(|m| m.value).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_is_per_device() {
        let buffer = MetricBuffer::new(10);
        buffer.push(sample("a", "t", 1.0));
        buffer.push(sample("a", "h", 2.0));
        buffer.push(sample("b", "t", 3.0));
        assert_eq!(buffer.devices(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(buffer.drain_device("a").len(), 2);
        assert_eq!(buffer.devices(), vec!["b".to_string()]);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_requeue_goes_ahead_of_newer_samples() {
        let buffer = MetricBuffer::new(4);
        buffer.push(sample("d", "t", 1.0));
        buffer.push(sample("d", "t", 2.0));
        let failed = buffer.drain_device("d");
        buffer.push(sample("d", "t", 3.0));
        buffer.requeue_front(failed);
        let values: Vec<f64> = buffer.drain_device("d").iter().map(|m| m.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_requeue_respects_capacity() {
        let buffer = MetricBuffer::new(2);
        buffer.push(sample("d", "t", 1.0));
        buffer.push(sample("d", "t", 2.0));
        let failed = buffer.drain_device("d");
        buffer.push(sample("d", "t", 3.0));
        buffer.requeue_front(failed);
        let values: Vec<f64> = buffer.drain_device("d").iter().map(|m| m.value).collect();
        assert_eq!(values, vec![2.0, 3.0]);
        assert_eq!(buffer.dropped(), 1);
    }
}
