/*!
 * Async helpers shared by the services.
 */
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Run a future with a timeout
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `what` - Operation name used in the timeout error
/// * `future` - The future to run
pub async fn with_timeout<F, T>(duration: Duration, what: &str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!("{} timed out after {:?}", what, duration))),
    }
}

/// Spawn a task that logs its failure instead of returning it
pub fn spawn_and_log<F, T, E>(name: &str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let task_name = name.to_string();
    tokio::spawn(async move {
        match fut.await {
            Ok(_) => debug!(task = %task_name, "task completed"),
            Err(e) => warn!(task = %task_name, error = %e, "task failed"),
        }
    })
}

/// Time left until `at`, zero if it already passed
pub fn until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// A set of background tasks cancelled together
#[derive(Debug, Default)]
pub struct TaskSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a spawned task
    pub fn push(&self, handle: JoinHandle<()>) {
        if let Ok(mut handles) = self.handles.lock() {
            handles.retain(|h| !h.is_finished());
            handles.push(handle);
        } else {
            handle.abort();
        }
    }

    /// Number of tasks still running
    pub fn len(&self) -> usize {
        self.handles
            .lock()
            .map(|h| h.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }

    /// Whether no task is running
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort every task and wait for them to unwind
    pub async fn shutdown(&self) {
        let handles: Vec<_> = match self.handles.lock() {
            Ok(mut handles) => handles.drain(..).collect(),
            Err(_) => return,
        };
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(Duration::from_secs(1), "answer", async { Ok::<_, Error>(42) }).await;
        assert_eq!(tokio_test::assert_ok!(result), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), "sleepy", async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, Error>(42)
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(msg)) if msg.contains("sleepy")));
    }

    #[test]
    fn test_until() {
        assert_eq!(until(Utc::now() - TimeDelta::seconds(5)), Duration::ZERO);
        assert!(until(Utc::now() + TimeDelta::seconds(5)) > Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_task_set_shutdown() {
        let tasks = TaskSet::new();
        tasks.push(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }));
        tasks.push(spawn_and_log("noop", async { Ok::<_, Error>(()) }));
        tasks.shutdown().await;
        assert!(tasks.is_empty());
    }
}
