/*!
 * Live device state cache.
 *
 * Snapshots reported by adapters, inbound messages, optimistic command
 * updates and telemetry all land here. Entries expire after a TTL so a
 * stale snapshot is re-read from the device.
 */
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use iotflow_core::device::DeviceState;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone)]
struct Entry {
    state: DeviceState,
    stored_at: Instant,
}

/// Per-device state snapshots with a time-to-live.
///
/// A zero TTL keeps entries forever.
#[derive(Debug)]
pub struct StateCache {
    entries: DashMap<String, Entry>,
    ttl: Duration,
}

/// Shared state cache handle
pub type SharedStateCache = Arc<StateCache>;

impl StateCache {
    /// Create a cache whose entries stay fresh for `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Time-to-live of an entry
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_fresh(&self, entry: &Entry) -> bool {
        self.ttl.is_zero() || entry.stored_at.elapsed() < self.ttl
    }

    /// Fresh snapshot of a device
    pub fn get(&self, device_id: &str) -> Option<DeviceState> {
        let entry = self.entries.get(device_id)?;
        if self.is_fresh(&entry) {
            Some(entry.state.clone())
        } else {
            trace!(device_id, "cached state expired");
            None
        }
    }

    /// Last snapshot of a device, fresh or not
    pub fn get_any(&self, device_id: &str) -> Option<DeviceState> {
        self.entries.get(device_id).map(|e| e.state.clone())
    }

    /// Replace the snapshot of a device
    pub fn put(&self, device_id: &str, state: DeviceState) {
        self.entries.insert(
            device_id.to_string(),
            Entry {
                state,
                stored_at: Instant::now(),
            },
        );
    }

    /// Modify the snapshot of a device in place, starting from an empty
    /// state when there is none, and return the result.
    ///
    /// An expired snapshot is still the starting point: partial updates
    /// must not erase fields the device reported earlier.
    pub fn update<F>(&self, device_id: &str, f: F) -> DeviceState
    where
        F: FnOnce(&mut DeviceState),
    {
        let mut entry = self
            .entries
            .entry(device_id.to_string())
            .or_insert_with(|| Entry {
                state: DeviceState::new(),
                stored_at: Instant::now(),
            });
        f(&mut entry.state);
        entry.stored_at = Instant::now();
        entry.state.clone()
    }

    /// Mark a device offline, keeping the rest of its snapshot
    pub fn mark_offline(&self, device_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(device_id) {
            entry.state.online = false;
        }
    }

    /// Forget a device
    pub fn remove(&self, device_id: &str) -> Option<DeviceState> {
        self.entries.remove(device_id).map(|(_, e)| e.state)
    }

    /// Drop every expired entry; returns how many were dropped
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| self.is_fresh(entry));
        before - self.entries.len()
    }

    /// Number of cached devices
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = StateCache::new(Duration::from_secs(10));
        cache.update("lamp", |s| s.power = Some(true));
        assert_eq!(cache.get("lamp").unwrap().power, Some(true));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get("lamp").is_none());
        assert_eq!(cache.get_any("lamp").unwrap().power, Some(true));
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_never_expires() {
        let cache = StateCache::new(Duration::ZERO);
        cache.put("s1", DeviceState::new());
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(cache.get("s1").is_some());
        assert_eq!(cache.purge_expired(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_keeps_earlier_fields_and_refreshes() {
        let cache = StateCache::new(Duration::from_secs(10));
        cache.update("thermo", |s| s.set_attribute("temperature", json!(21.5)));
        tokio::time::advance(Duration::from_secs(20)).await;

        let state = cache.update("thermo", |s| s.set_attribute("target_temperature", json!(23)));
        assert_eq!(state.temperature, Some(21.5));
        assert_eq!(state.attribute("target_temperature"), Some(json!(23)));
        assert!(cache.get("thermo").is_some());
    }

    #[test]
    fn test_mark_offline() {
        let cache = StateCache::default();
        cache.update("cam", |s| s.online = true);
        cache.mark_offline("cam");
        assert!(!cache.get("cam").unwrap().online);
        assert!(cache.remove("cam").is_some());
        assert_eq!(cache.len(), 0);
    }
}
