/*!
 * Persistence boundary.
 *
 * The engine never talks to a database directly. It needs device CRUD,
 * event append, raw-metric batch insert, aggregate upsert and range
 * queries, expressed here as traits. [`MemoryStore`] implements all of
 * them in process and backs tests and single-node deployments.
 */
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::device::{Device, DeviceStatus, Scene};
use crate::error::{Error, Result};
use crate::event::DeviceEvent;
use crate::telemetry::{AggregationKey, Resolution, TelemetryAggregation, TelemetryMetric};

/// Durable device records
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Insert a new device; conflict if an enabled record with the id exists
    async fn insert_device(&self, device: &Device) -> Result<()>;

    /// Replace an existing device record
    async fn update_device(&self, device: &Device) -> Result<()>;

    /// Persist a status change
    async fn update_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Soft-delete a device
    async fn disable_device(&self, device_id: &str) -> Result<()>;

    /// Load every enabled device
    async fn load_devices(&self) -> Result<Vec<Device>>;
}

/// Append-only event log
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event
    async fn append_event(&self, event: &DeviceEvent) -> Result<()>;

    /// Most recent events of a device, newest first
    async fn recent_events(&self, device_id: &str, limit: usize) -> Result<Vec<DeviceEvent>>;
}

/// Raw samples and aggregates
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Insert a batch of raw samples
    async fn insert_metrics(&self, batch: &[TelemetryMetric]) -> Result<()>;

    /// Raw samples of every device with `start <= timestamp < end`
    async fn metrics_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TelemetryMetric>>;

    /// Raw samples of one metric with `start <= timestamp <= end`, oldest first
    async fn metric_history(
        &self,
        device_id: &str,
        metric_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TelemetryMetric>>;

    /// The most recent sample of each metric of a device
    async fn latest_metrics(&self, device_id: &str) -> Result<Vec<TelemetryMetric>>;

    /// Insert or replace aggregates keyed by (device, metric, resolution, window start)
    async fn upsert_aggregations(&self, rows: &[TelemetryAggregation]) -> Result<()>;

    /// Aggregates of one metric whose window starts within `[start, end]`
    async fn aggregation_history(
        &self,
        device_id: &str,
        metric_name: &str,
        resolution: Resolution,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TelemetryAggregation>>;

    /// Delete raw samples older than `cutoff`, returning how many went
    async fn delete_metrics_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Delete aggregates of a resolution whose window starts before `cutoff`
    async fn delete_aggregations_before(
        &self,
        resolution: Resolution,
        cutoff: DateTime<Utc>,
    ) -> Result<usize>;
}

/// Persisted scenes
#[async_trait]
pub trait SceneStore: Send + Sync {
    /// Insert or replace a scene
    async fn save_scene(&self, scene: &Scene) -> Result<()>;

    /// Load every scene
    async fn load_scenes(&self) -> Result<Vec<Scene>>;

    /// Delete a scene, returning whether it existed
    async fn delete_scene(&self, scene_id: &str) -> Result<bool>;
}

/// Everything the engine needs from persistence
pub trait Store: DeviceStore + EventStore + TelemetryStore + SceneStore {}

impl<T: DeviceStore + EventStore + TelemetryStore + SceneStore> Store for T {}

/// Shared handle to a store
pub type SharedStore = Arc<dyn Store>;

struct DeviceRow {
    device: Device,
    enabled: bool,
}

/// In-process implementation of every store trait
#[derive(Default)]
pub struct MemoryStore {
    devices: DashMap<String, DeviceRow>,
    events: RwLock<Vec<DeviceEvent>>,
    metrics: RwLock<Vec<TelemetryMetric>>,
    aggregations: RwLock<BTreeMap<AggregationKey, TelemetryAggregation>>,
    scenes: DashMap<String, Scene>,
    read_only: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every write while set. Reads keep working.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            Err(Error::store("store is read-only"))
        } else {
            Ok(())
        }
    }

    /// Number of raw samples held
    pub async fn metric_count(&self) -> usize {
        self.metrics.read().await.len()
    }

    /// Number of aggregate rows held
    pub async fn aggregation_count(&self) -> usize {
        self.aggregations.read().await.len()
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn insert_device(&self, device: &Device) -> Result<()> {
        self.check_writable()?;
        match self.devices.entry(device.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if entry.get().enabled {
                    return Err(Error::conflict(format!("device {} already exists", device.id)));
                }
                entry.insert(DeviceRow {
                    device: device.clone(),
                    enabled: true,
                });
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(DeviceRow {
                    device: device.clone(),
                    enabled: true,
                });
            }
        }
        Ok(())
    }

    async fn update_device(&self, device: &Device) -> Result<()> {
        self.check_writable()?;
        let mut row = self
            .devices
            .get_mut(&device.id)
            .ok_or_else(|| Error::not_found(format!("device {}", device.id)))?;
        row.device = device.clone();
        Ok(())
    }

    async fn update_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.check_writable()?;
        let mut row = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| Error::not_found(format!("device {}", device_id)))?;
        row.device.status = status;
        if last_seen.is_some() {
            row.device.last_seen = last_seen;
        }
        Ok(())
    }

    async fn disable_device(&self, device_id: &str) -> Result<()> {
        self.check_writable()?;
        let mut row = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| Error::not_found(format!("device {}", device_id)))?;
        row.enabled = false;
        Ok(())
    }

    async fn load_devices(&self) -> Result<Vec<Device>> {
        Ok(self
            .devices
            .iter()
            .filter(|row| row.enabled)
            .map(|row| row.device.clone())
            .collect())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append_event(&self, event: &DeviceEvent) -> Result<()> {
        self.check_writable()?;
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn recent_events(&self, device_id: &str, limit: usize) -> Result<Vec<DeviceEvent>> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .rev()
            .filter(|e| e.device_id == device_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn insert_metrics(&self, batch: &[TelemetryMetric]) -> Result<()> {
        self.check_writable()?;
        self.metrics.write().await.extend_from_slice(batch);
        Ok(())
    }

    async fn metrics_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TelemetryMetric>> {
        let metrics = self.metrics.read().await;
        Ok(metrics
            .iter()
            .filter(|m| m.timestamp >= start && m.timestamp < end)
            .cloned()
            .collect())
    }

    async fn metric_history(
        &self,
        device_id: &str,
        metric_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TelemetryMetric>> {
        let metrics = self.metrics.read().await;
        let mut rows: Vec<_> = metrics
            .iter()
            .filter(|m| {
                m.device_id == device_id
                    && m.metric_name == metric_name
                    && m.timestamp >= start
                    && m.timestamp <= end
            })
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.timestamp);
        Ok(rows)
    }

    async fn latest_metrics(&self, device_id: &str) -> Result<Vec<TelemetryMetric>> {
        let metrics = self.metrics.read().await;
        let mut latest: HashMap<&str, &TelemetryMetric> = HashMap::new();
        for m in metrics.iter().filter(|m| m.device_id == device_id) {
            match latest.get(m.metric_name.as_str()) {
                Some(current) if current.timestamp > m.timestamp => {}
                _ => {
                    latest.insert(m.metric_name.as_str(), m);
                }
            }
        }
        let mut rows: Vec<_> = latest.into_values().cloned().collect();
        rows.sort_by(|a, b| a.metric_name.cmp(&b.metric_name));
        Ok(rows)
    }

    async fn upsert_aggregations(&self, rows: &[TelemetryAggregation]) -> Result<()> {
        self.check_writable()?;
        let mut aggregations = self.aggregations.write().await;
        for row in rows {
            aggregations.insert(row.key(), row.clone());
        }
        Ok(())
    }

    async fn aggregation_history(
        &self,
        device_id: &str,
        metric_name: &str,
        resolution: Resolution,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TelemetryAggregation>> {
        let aggregations = self.aggregations.read().await;
        Ok(aggregations
            .values()
            .filter(|a| {
                a.device_id == device_id
                    && a.metric_name == metric_name
                    && a.resolution == resolution
                    && a.start_time >= start
                    && a.start_time <= end
            })
            .cloned()
            .collect())
    }

    async fn delete_metrics_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.check_writable()?;
        let mut metrics = self.metrics.write().await;
        let before = metrics.len();
        metrics.retain(|m| m.timestamp >= cutoff);
        Ok(before - metrics.len())
    }

    async fn delete_aggregations_before(
        &self,
        resolution: Resolution,
        cutoff: DateTime<Utc>,
    ) -> Result<usize> {
        self.check_writable()?;
        let mut aggregations = self.aggregations.write().await;
        let before = aggregations.len();
        aggregations.retain(|k, _| k.resolution != resolution || k.start_time >= cutoff);
        Ok(before - aggregations.len())
    }
}

#[async_trait]
impl SceneStore for MemoryStore {
    async fn save_scene(&self, scene: &Scene) -> Result<()> {
        self.check_writable()?;
        self.scenes.insert(scene.id.clone(), scene.clone());
        Ok(())
    }

    async fn load_scenes(&self) -> Result<Vec<Scene>> {
        Ok(self.scenes.iter().map(|s| s.value().clone()).collect())
    }

    async fn delete_scene(&self, scene_id: &str) -> Result<bool> {
        self.check_writable()?;
        Ok(self.scenes.remove(scene_id).is_some())
    }
}
