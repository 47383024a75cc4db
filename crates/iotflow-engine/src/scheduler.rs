/*!
 * Scheduled device commands.
 *
 * Each schedule is a background task that waits until its start time,
 * runs once, and then repeats on its interval until cancelled. Finished
 * one-shot schedules are pruned lazily on list and cancel.
 */
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use iotflow_core::types::{new_id, Params};
use iotflow_core::utils::until;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A command scheduled for later, possibly repeating
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledCommand {
    #[allow(missing_docs)]
    pub id: String,
    #[allow(missing_docs)]
    pub device_id: String,
    #[allow(missing_docs)]
    pub command: String,
    #[allow(missing_docs)]
    #[serde(default)]
    pub parameters: Params,
    /// First execution
    pub run_at: DateTime<Utc>,
    /// Interval between repeats; `None` runs once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_every: Option<Duration>,
    /// Executions so far
    #[serde(default)]
    pub runs: u64,
    #[allow(missing_docs)]
    pub created_at: DateTime<Utc>,
}

impl ScheduledCommand {
    /// Schedule `command` for `device_id` at `run_at`
    pub fn new<D: Into<String>, C: Into<String>>(
        device_id: D,
        command: C,
        parameters: Params,
        run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id(),
            device_id: device_id.into(),
            command: command.into(),
            parameters,
            run_at,
            repeat_every: None,
            runs: 0,
            created_at: Utc::now(),
        }
    }

    /// Repeat on `interval` after the first run
    pub fn repeating(mut self, interval: Duration) -> Self {
        self.repeat_every = Some(interval);
        self
    }
}

#[derive(Debug)]
struct Entry {
    info: ScheduledCommand,
    runs: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

impl Entry {
    fn snapshot(&self) -> ScheduledCommand {
        let mut info = self.info.clone();
        info.runs = self.runs.load(Ordering::SeqCst);
        info
    }
}

/// Owner of every scheduled-command task
#[derive(Debug, Default)]
pub struct CommandScheduler {
    entries: DashMap<String, Entry>,
}

impl CommandScheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a schedule. `run` performs one execution and reports whether
    /// it succeeded; failures are logged and do not end a repeating
    /// schedule.
    pub fn schedule<F, Fut>(&self, info: ScheduledCommand, run: F) -> Result<String>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        if info.repeat_every == Some(Duration::ZERO) {
            return Err(Error::validation("repeat interval must be positive"));
        }
        let id = info.id.clone();
        let runs = Arc::new(AtomicU64::new(0));
        let counter = runs.clone();
        let delay = until(info.run_at);
        let repeat = info.repeat_every;
        let schedule_id = id.clone();
        let device_id = info.device_id.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            loop {
                let ok = run().await;
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if ok {
                    debug!(schedule_id = %schedule_id, device_id = %device_id, run = n, "scheduled command executed");
                } else {
                    warn!(schedule_id = %schedule_id, device_id = %device_id, run = n, "scheduled command failed");
                }
                match repeat {
                    Some(every) => tokio::time::sleep(every).await,
                    None => break,
                }
            }
        });

        info!(
            schedule_id = %id,
            device_id = %info.device_id,
            command = %info.command,
            run_at = %info.run_at,
            repeat = ?info.repeat_every,
            "command scheduled"
        );
        self.entries.insert(id.clone(), Entry { info, runs, handle });
        Ok(id)
    }

    /// Cancel one schedule of a device, or all of them when `schedule_id`
    /// is `None`. Returns how many were cancelled.
    pub fn cancel(&self, device_id: &str, schedule_id: Option<&str>) -> Result<usize> {
        self.prune();
        match schedule_id {
            Some(id) => {
                let removed = self
                    .entries
                    .remove_if(id, |_, entry| entry.info.device_id == device_id);
                match removed {
                    Some((_, entry)) => {
                        entry.handle.abort();
                        info!(schedule_id = %id, device_id = %device_id, "schedule cancelled");
                        Ok(1)
                    }
                    None => Err(Error::not_found("schedule", id)),
                }
            }
            None => {
                let ids: Vec<String> = self
                    .entries
                    .iter()
                    .filter(|e| e.info.device_id == device_id)
                    .map(|e| e.key().clone())
                    .collect();
                let mut cancelled = 0;
                for id in ids {
                    if let Some((_, entry)) = self.entries.remove(&id) {
                        entry.handle.abort();
                        cancelled += 1;
                    }
                }
                info!(device_id = %device_id, cancelled, "schedules cancelled");
                Ok(cancelled)
            }
        }
    }

    /// Pending and repeating schedules, optionally of one device, in
    /// start-time order
    pub fn list(&self, device_id: Option<&str>) -> Vec<ScheduledCommand> {
        self.prune();
        let mut list: Vec<_> = self
            .entries
            .iter()
            .filter(|e| device_id.map_or(true, |d| e.info.device_id == d))
            .map(|e| e.snapshot())
            .collect();
        list.sort_by(|a, b| a.run_at.cmp(&b.run_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Cancel every schedule
    pub fn cancel_all(&self) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                entry.handle.abort();
            }
        }
    }

    fn prune(&self) {
        self.entries.retain(|_, entry| !entry.handle.is_finished());
    }
}

impl Drop for CommandScheduler {
    fn drop(&mut self) {
        for entry in self.entries.iter() {
            entry.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use iotflow_core::params;

    fn counting(counter: &Arc<AtomicU64>) -> impl Fn() -> std::future::Ready<bool> + Send + Sync + 'static {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(true)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_runs_once_then_disappears() {
        let scheduler = CommandScheduler::new();
        let hits = Arc::new(AtomicU64::new(0));
        let info = ScheduledCommand::new("lamp", "turn_on", params!(), Utc::now() + TimeDelta::seconds(5));
        scheduler.schedule(info, counting(&hits)).unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.list(Some("lamp")).len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        tokio::task::yield_now().await;
        assert!(scheduler.list(None).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_until_cancelled() {
        let scheduler = CommandScheduler::new();
        let hits = Arc::new(AtomicU64::new(0));
        let info = ScheduledCommand::new("pump", "pulse", params!(), Utc::now())
            .repeating(Duration::from_secs(10));
        let id = scheduler.schedule(info, counting(&hits)).unwrap();

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 4);
        assert_eq!(scheduler.list(None)[0].runs, 4);

        assert!(scheduler.cancel("other", Some(&id)).unwrap_err().is_not_found());
        assert_eq!(scheduler.cancel("pump", Some(&id)).unwrap(), 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 4);
        assert!(scheduler.cancel("pump", Some(&id)).unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_of_a_device() {
        let scheduler = CommandScheduler::new();
        let hits = Arc::new(AtomicU64::new(0));
        let later = Utc::now() + TimeDelta::minutes(10);
        for device in ["a", "a", "b"] {
            let info = ScheduledCommand::new(device, "turn_off", params!(), later);
            scheduler.schedule(info, counting(&hits)).unwrap();
        }
        assert_eq!(scheduler.cancel("a", None).unwrap(), 2);
        assert_eq!(scheduler.cancel("a", None).unwrap(), 0);
        assert_eq!(scheduler.list(None).len(), 1);
        scheduler.cancel_all();
        assert!(scheduler.list(None).is_empty());
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let scheduler = CommandScheduler::new();
        let hits = Arc::new(AtomicU64::new(0));
        let info = ScheduledCommand::new("a", "x", params!(), Utc::now()).repeating(Duration::ZERO);
        assert!(scheduler.schedule(info, counting(&hits)).is_err());
    }
}
