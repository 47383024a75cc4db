/*!
 * Telemetry collection.
 *
 * Samples are normalized, buffered per (device, metric), mirrored into the
 * live state cache, handed to processors and anomaly detectors, and
 * flushed to the store in minute batches. Background loops flush, roll
 * raw samples up into multi-resolution aggregates and enforce retention.
 */
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use iotflow_core::config::{RetentionConfig, TelemetryConfig};
use iotflow_core::event::{kinds, DeviceEvent, Severity};
use iotflow_core::logging::component_span;
use iotflow_core::telemetry::{Resolution, TelemetryAggregation, TelemetryMetric};
use iotflow_core::types::{as_number, truncate_to_minute, DeviceId, Params, Value};
use iotflow_core::utils::TaskSet;
use iotflow_devices::{InboundKind, SharedDeviceManager};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::{Error, Result};

pub mod aggregate;
pub mod anomaly;
pub mod buffer;

pub use aggregate::{aggregate_window, due_resolutions, summarize};
pub use anomaly::{AnomalyDetector, ThresholdDetector, ZScoreDetector};
pub use buffer::MetricBuffer;

/// Observes samples of one metric after they are buffered
#[async_trait]
pub trait MetricProcessor: Send + Sync {
    /// Handle one sample. Errors are logged and never reach the caller of
    /// `collect`.
    async fn process(&self, metric: &TelemetryMetric) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> MetricProcessor for F
where
    F: Fn(&TelemetryMetric) -> anyhow::Result<()> + Send + Sync,
{
    async fn process(&self, metric: &TelemetryMetric) -> anyhow::Result<()> {
        self(metric)
    }
}

/// Split a raw reading into value, unit and metadata.
///
/// Numbers, booleans and numeric strings become the value. An object
/// contributes its `value` and `unit` keys; the remaining keys become
/// metadata. Anything unreadable is `0.0`.
pub fn normalize(raw: &Value) -> (f64, Option<String>, Params) {
    match raw {
        Value::Object(fields) => {
            let value = fields.get("value").and_then(as_number).unwrap_or(0.0);
            let unit = fields.get("unit").and_then(Value::as_str).map(str::to_string);
            let metadata = fields
                .iter()
                .filter(|(k, _)| k.as_str() != "value" && k.as_str() != "unit")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            (value, unit, metadata)
        }
        other => (as_number(other).unwrap_or(0.0), None, Params::new()),
    }
}

/// Most recent value of a metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestMetric {
    #[allow(missing_docs)]
    pub value: f64,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[allow(missing_docs)]
    pub timestamp: DateTime<Utc>,
}

/// History of a metric, raw or at a resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "rows", rename_all = "snake_case")]
pub enum MetricHistory {
    /// Raw samples, oldest first
    Raw(Vec<TelemetryMetric>),
    /// Aggregates, by window start
    Aggregated(Vec<TelemetryAggregation>),
}

impl MetricHistory {
    /// Number of rows
    pub fn len(&self) -> usize {
        match self {
            MetricHistory::Raw(rows) => rows.len(),
            MetricHistory::Aggregated(rows) => rows.len(),
        }
    }

    /// Whether there are no rows
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Rows removed by one retention pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Raw samples removed
    pub raw: usize,
    /// Aggregates removed per resolution
    pub aggregates: BTreeMap<Resolution, usize>,
}

/// How long rows of a resolution are kept; `None` for raw samples
pub fn retention(config: &RetentionConfig, resolution: Option<Resolution>) -> TimeDelta {
    match resolution {
        None => TimeDelta::hours(config.raw_hours),
        Some(Resolution::Minute) => TimeDelta::days(config.minute_days),
        Some(Resolution::FiveMinutes) => TimeDelta::days(config.five_minute_days),
        Some(Resolution::Hour) => TimeDelta::days(config.hour_days),
        Some(Resolution::Day) => TimeDelta::days(config.day_days),
    }
}

type SeriesKey = (DeviceId, String);

/// Telemetry pipeline over the device manager's store and state cache
pub struct TelemetryCollector {
    config: TelemetryConfig,
    manager: SharedDeviceManager,
    buffer: MetricBuffer,
    processors: DashMap<String, Vec<(u64, Arc<dyn MetricProcessor>)>>,
    detectors: DashMap<SeriesKey, Arc<dyn AnomalyDetector>>,
    next_id: AtomicU64,
    tasks: TaskSet,
    running: AtomicBool,
}

impl std::fmt::Debug for TelemetryCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryCollector")
            .field("buffered", &self.buffer.len())
            .field("processors", &self.processors.len())
            .field("detectors", &self.detectors.len())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Shared handle to the collector
pub type SharedTelemetryCollector = Arc<TelemetryCollector>;

impl TelemetryCollector {
    /// Create a collector storing through `manager`'s store
    pub fn new(config: &TelemetryConfig, manager: SharedDeviceManager) -> Self {
        Self {
            config: config.clone(),
            manager,
            buffer: MetricBuffer::new(config.buffer_capacity),
            processors: DashMap::new(),
            detectors: DashMap::new(),
            next_id: AtomicU64::new(1),
            tasks: TaskSet::new(),
            running: AtomicBool::new(false),
        }
    }

    /// The sample buffers
    pub fn buffer(&self) -> &MetricBuffer {
        &self.buffer
    }

    /// Whether the background loops are running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ----- ingestion -----

    /// Collect readings reported by a device, stamped `timestamp` or now.
    /// Returns how many samples were taken.
    pub async fn collect(
        &self,
        device_id: &str,
        metrics: &Params,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let timestamp = timestamp.unwrap_or_else(Utc::now);
        let mut flush_due = false;

        for (name, raw) in metrics {
            let (value, unit, metadata) = normalize(raw);
            let metric = TelemetryMetric {
                device_id: device_id.to_string(),
                metric_name: name.clone(),
                value,
                unit,
                timestamp,
                metadata,
            };

            if self.buffer.push(metric.clone()) >= self.config.batch_size {
                flush_due = true;
            }
            self.manager.states().update(device_id, |state| {
                state.record_metric(name, value);
                state.online = true;
            });
            self.run_processors(&metric).await;
            self.run_detector(&metric).await;
        }

        if flush_due {
            if let Err(e) = self.flush_device(device_id).await {
                warn!(device_id = %device_id, error = %e, "size-triggered flush failed");
            }
        }
        Ok(metrics.len())
    }

    async fn run_processors(&self, metric: &TelemetryMetric) {
        let processors: Vec<Arc<dyn MetricProcessor>> = match self.processors.get(&metric.metric_name) {
            Some(list) => list.iter().map(|(_, p)| p.clone()).collect(),
            None => return,
        };
        for processor in processors {
            if let Err(e) = processor.process(metric).await {
                error!(device_id = %metric.device_id, metric = %metric.metric_name, error = %e, "metric processor failed");
            }
        }
    }

    async fn run_detector(&self, metric: &TelemetryMetric) {
        let key = (metric.device_id.clone(), metric.metric_name.clone());
        let Some(detector) = self.detectors.get(&key).map(|d| d.clone()) else {
            return;
        };
        if !detector.check(metric) {
            return;
        }
        warn!(
            device_id = %metric.device_id,
            metric = %metric.metric_name,
            value = metric.value,
            "anomaly detected"
        );
        let event = DeviceEvent::new(&metric.device_id, kinds::ANOMALY_DETECTED)
            .with_severity(Severity::Warning)
            .with_data("metric", json!(metric.metric_name))
            .with_data("value", json!(metric.value))
            .with_data("threshold", detector.threshold());
        self.manager.emit_event(event).await;
    }

    /// Register a processor for a metric name; returns its id
    pub fn add_metric_processor<S: Into<String>>(
        &self,
        metric_name: S,
        processor: Arc<dyn MetricProcessor>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.processors
            .entry(metric_name.into())
            .or_default()
            .push((id, processor));
        id
    }

    /// Remove a processor; returns whether it was registered
    pub fn remove_metric_processor(&self, metric_name: &str, processor_id: u64) -> bool {
        let Some(mut list) = self.processors.get_mut(metric_name) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != processor_id);
        let removed = list.len() != before;
        let empty = list.is_empty();
        drop(list);
        if empty {
            self.processors.remove_if(metric_name, |_, list| list.is_empty());
        }
        removed
    }

    /// Attach a detector to one series, replacing any previous one
    pub fn add_anomaly_detector<D: Into<String>, M: Into<String>>(
        &self,
        device_id: D,
        metric_name: M,
        detector: Arc<dyn AnomalyDetector>,
    ) {
        let key = (device_id.into(), metric_name.into());
        debug!(device_id = %key.0, metric = %key.1, "anomaly detector attached");
        self.detectors.insert(key, detector);
    }

    /// Detach a series' detector; returns whether one was attached
    pub fn remove_anomaly_detector(&self, device_id: &str, metric_name: &str) -> bool {
        self.detectors
            .remove(&(device_id.to_string(), metric_name.to_string()))
            .is_some()
    }

    // ----- flushing -----

    /// Write a device's buffered samples in minute batches. Batches the
    /// store rejects go back to the front of the buffer.
    pub async fn flush_device(&self, device_id: &str) -> Result<usize> {
        let drained = self.buffer.drain_device(device_id);
        if drained.is_empty() {
            return Ok(0);
        }
        let mut batches: BTreeMap<DateTime<Utc>, Vec<TelemetryMetric>> = BTreeMap::new();
        for metric in drained {
            batches
                .entry(truncate_to_minute(metric.timestamp))
                .or_default()
                .push(metric);
        }

        let store = self.manager.store();
        let mut stored = 0;
        let mut failed = Vec::new();
        let mut last_error = None;
        for (minute, batch) in batches {
            match store.insert_metrics(&batch).await {
                Ok(()) => stored += batch.len(),
                Err(e) => {
                    warn!(device_id = %device_id, %minute, samples = batch.len(), error = %e, "telemetry batch not stored");
                    failed.extend(batch);
                    last_error = Some(e);
                }
            }
        }

        if !failed.is_empty() {
            self.buffer.requeue_front(failed);
        }
        match last_error {
            Some(e) => Err(e.into()),
            None => {
                debug!(device_id = %device_id, samples = stored, "telemetry flushed");
                Ok(stored)
            }
        }
    }

    /// Flush every device; returns how many samples were stored
    pub async fn flush_all(&self) -> usize {
        let mut stored = 0;
        for device_id in self.buffer.devices() {
            match self.flush_device(&device_id).await {
                Ok(n) => stored += n,
                Err(e) => warn!(device_id = %device_id, error = %e, "flush failed"),
            }
        }
        stored
    }

    // ----- aggregation and retention -----

    /// Aggregate the window of `resolution` that closed at or before `now`.
    /// Re-running for the same window replaces its rows.
    pub async fn aggregate(&self, resolution: Resolution, now: DateTime<Utc>) -> Result<usize> {
        let (start, end) = resolution.preceding_window(now);
        let store = self.manager.store();
        let metrics = store.metrics_between(start, end).await?;
        let rows = aggregate_window(&metrics, resolution, start, end);
        if !rows.is_empty() {
            store.upsert_aggregations(&rows).await?;
        }
        debug!(%resolution, %start, rows = rows.len(), "aggregation pass");
        Ok(rows.len())
    }

    /// Aggregate every resolution due at `now`
    pub async fn run_aggregation(&self, now: DateTime<Utc>) -> usize {
        let mut rows = 0;
        for resolution in due_resolutions(now) {
            match self.aggregate(resolution, now).await {
                Ok(n) => rows += n,
                Err(e) => warn!(%resolution, error = %e, "aggregation failed"),
            }
        }
        rows
    }

    /// Delete rows past their retention
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let store = self.manager.store();
        let retention_cfg = &self.config.retention;
        let mut report = CleanupReport {
            raw: store
                .delete_metrics_before(now - retention(retention_cfg, None))
                .await?,
            ..Default::default()
        };
        for resolution in Resolution::ALL {
            let cutoff = now - retention(retention_cfg, Some(resolution));
            let removed = store.delete_aggregations_before(resolution, cutoff).await?;
            report.aggregates.insert(resolution, removed);
        }
        info!(raw = report.raw, aggregates = report.aggregates.values().sum::<usize>(), "telemetry retention applied");
        Ok(report)
    }

    // ----- queries -----

    /// Latest value of each metric of a device, optionally only `names`.
    /// The live state cache answers when it has readings; the store
    /// otherwise.
    pub async fn latest_metrics(
        &self,
        device_id: &str,
        names: Option<&[&str]>,
    ) -> Result<BTreeMap<String, LatestMetric>> {
        let wanted = |name: &str| names.map_or(true, |n| n.contains(&name));

        if let Some(state) = self.manager.states().get(device_id) {
            if !state.sensor_data.is_empty() {
                return Ok(state
                    .sensor_data
                    .iter()
                    .filter(|(name, _)| wanted(name))
                    .map(|(name, value)| {
                        let latest = LatestMetric {
                            value: *value,
                            unit: None,
                            timestamp: state.updated_at,
                        };
                        (name.clone(), latest)
                    })
                    .collect());
            }
        }

        let rows = self.manager.store().latest_metrics(device_id).await?;
        Ok(rows
            .into_iter()
            .filter(|m| wanted(&m.metric_name))
            .map(|m| {
                let latest = LatestMetric {
                    value: m.value,
                    unit: m.unit,
                    timestamp: m.timestamp,
                };
                (m.metric_name, latest)
            })
            .collect())
    }

    /// History of one metric between `start` and `end` inclusive: raw
    /// samples, or aggregates when a resolution is given
    pub async fn metric_history(
        &self,
        device_id: &str,
        metric_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        resolution: Option<Resolution>,
    ) -> Result<MetricHistory> {
        if start > end {
            return Err(Error::validation(format!("history start {} is after end {}", start, end)));
        }
        let store = self.manager.store();
        match resolution {
            None => Ok(MetricHistory::Raw(
                store.metric_history(device_id, metric_name, start, end).await?,
            )),
            Some(resolution) => {
                let mut rows = store
                    .aggregation_history(device_id, metric_name, resolution, start, end)
                    .await?;
                rows.retain(|r| r.end_time <= end);
                rows.sort_by_key(|r| r.start_time);
                Ok(MetricHistory::Aggregated(rows))
            }
        }
    }

    // ----- lifecycle -----

    /// Feed the manager's inbound telemetry messages into `collect`
    pub fn attach(self: &Arc<Self>) -> Result<()> {
        let mut inbound = self.manager.inbound()?;
        let collector = Arc::downgrade(self);
        self.tasks.push(tokio::spawn(
            async move {
                loop {
                    match inbound.recv().await {
                        Ok(message) if message.kind == InboundKind::Telemetry => {
                            let Some(collector) = collector.upgrade() else {
                                break;
                            };
                            if let Some(fields) = message.fields() {
                                if let Err(e) = collector
                                    .collect(&message.device_id, fields, Some(message.received_at))
                                    .await
                                {
                                    warn!(device_id = %message.device_id, error = %e, "telemetry not collected");
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "inbound messages dropped before reaching telemetry")
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            .instrument(component_span("telemetry", Some("inbound"))),
        ));
        debug!("telemetry attached to inbound messages");
        Ok(())
    }

    /// Start the flush, aggregation and cleanup loops
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        for chore in Chore::ALL {
            let collector = Arc::downgrade(self);
            let period = chore.period(&self.config);
            self.tasks.push(tokio::spawn(
                background_loop(collector, chore, period)
                    .instrument(component_span("telemetry", Some(chore.name()))),
            ));
        }
        info!(
            flush = ?self.config.flush_interval(),
            batch_size = self.config.batch_size,
            "telemetry collector started"
        );
    }

    /// Stop the loops and flush what is buffered
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.tasks.shutdown().await;
        let stored = self.flush_all().await;
        info!(stored, remaining = self.buffer.len(), "telemetry collector stopped");
    }
}

/// Periodic work of a started collector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chore {
    Flush,
    Aggregation,
    Cleanup,
}

impl Chore {
    const ALL: [Chore; 3] = [Chore::Flush, Chore::Aggregation, Chore::Cleanup];

    fn name(self) -> &'static str {
        match self {
            Chore::Flush => "flush",
            Chore::Aggregation => "aggregation",
            Chore::Cleanup => "cleanup",
        }
    }

    fn period(self, config: &TelemetryConfig) -> Duration {
        match self {
            Chore::Flush => config.flush_interval(),
            Chore::Aggregation => config.aggregation_interval(),
            Chore::Cleanup => config.cleanup_interval(),
        }
    }

    async fn run(self, collector: &TelemetryCollector) {
        match self {
            Chore::Flush => {
                collector.flush_all().await;
            }
            Chore::Aggregation => {
                collector.run_aggregation(Utc::now()).await;
            }
            Chore::Cleanup => {
                if let Err(e) = collector.cleanup(Utc::now()).await {
                    warn!(error = %e, "retention pass failed");
                }
            }
        }
    }
}

async fn background_loop(collector: Weak<TelemetryCollector>, chore: Chore, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(collector) = collector.upgrade() else {
            break;
        };
        chore.run(&collector).await;
    }
}
