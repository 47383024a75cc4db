/*!
 * Request/response correlation.
 *
 * A request registers its key before the frame leaves, the receive loop
 * completes the key when the matching response arrives. A waiter that
 * times out removes its entry so a late response finds nothing to
 * complete and is dropped instead of being handed to another request.
 */
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;

/// Why waiting for a response ended without one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The deadline passed
    TimedOut,
    /// The session went away before a response arrived
    Closed,
}

/// Table of outstanding requests keyed by correlation id
#[derive(Debug)]
pub struct Correlator<T> {
    pending: DashMap<String, oneshot::Sender<T>>,
}

impl<T> Default for Correlator<T> {
    fn default() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }
}

impl<T> Correlator<T> {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a key. Returns `None` if the key is already outstanding.
    pub fn register(&self, key: &str) -> Option<oneshot::Receiver<T>> {
        match self.pending.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                Some(rx)
            }
        }
    }

    /// Deliver a response. Returns `false` when nobody waits for the key.
    pub fn complete(&self, key: &str, value: T) -> bool {
        match self.pending.remove(key) {
            Some((_, tx)) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Forget a key without answering it
    pub fn cancel(&self, key: &str) -> bool {
        self.pending.remove(key).is_some()
    }

    /// Whether the key is outstanding
    pub fn contains(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    /// Number of outstanding requests
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every outstanding request; their waiters see [`WaitError::Closed`]
    pub fn clear(&self) {
        self.pending.clear();
    }

    /// Wait for the response to `key`, removing the entry on timeout
    pub async fn wait(
        &self,
        key: &str,
        rx: oneshot::Receiver<T>,
        timeout: Duration,
    ) -> Result<T, WaitError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => {
                self.pending.remove(key);
                Err(WaitError::Closed)
            }
            Err(_) => {
                self.pending.remove(key);
                Err(WaitError::TimedOut)
            }
        }
    }
}
