/*!
 * Per-device session bookkeeping shared by the built-in adapters.
 *
 * Whatever carries the bytes (a framed link, a broker client, an HTTP
 * client), a connected device has the same hub: outstanding requests
 * keyed for correlation, live subscriptions, the last observed state and
 * the channel inbound traffic is forwarded on.
 */
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use iotflow_core::device::{DeviceState, Protocol};
use iotflow_core::types::Value;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::adapter::{InboundKind, InboundMessage, InboundSender, Subscription};
use crate::correlation::{Correlator, WaitError};
use crate::error::{DeviceError, Result};
use crate::topic;

const SUBSCRIPTION_CAPACITY: usize = 256;

/// Result carried back to a waiting request: the device's result or its
/// error message
pub type Reply = std::result::Result<Value, String>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct SubscriptionEntry {
    id: u64,
    filter: String,
    sender: mpsc::Sender<InboundMessage>,
}

/// State of one connected device
#[derive(Debug)]
pub struct SessionHub {
    device_id: String,
    protocol: Protocol,
    pending: Correlator<Reply>,
    subscriptions: Mutex<Vec<SubscriptionEntry>>,
    state: Mutex<DeviceState>,
    inbound: Option<InboundSender>,
}

impl SessionHub {
    /// Create a hub forwarding inbound traffic to `inbound` when given
    pub fn new<D: Into<String>>(device_id: D, protocol: Protocol, inbound: Option<InboundSender>) -> Self {
        Self {
            device_id: device_id.into(),
            protocol,
            pending: Correlator::new(),
            subscriptions: Mutex::new(Vec::new()),
            state: Mutex::new(DeviceState::new()),
            inbound,
        }
    }

    #[allow(missing_docs)]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    #[allow(missing_docs)]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Outstanding requests
    pub fn pending(&self) -> &Correlator<Reply> {
        &self.pending
    }

    /// Register `key`, run `send`, then wait up to `timeout` for the reply.
    ///
    /// The key is withdrawn when sending fails or the deadline passes, so a
    /// late response is dropped.
    pub async fn request<F>(&self, key: &str, timeout: Duration, operation: &str, send: F) -> Result<Reply>
    where
        F: Future<Output = Result<()>>,
    {
        let rx = self.pending.register(key).ok_or_else(|| {
            DeviceError::transport(
                self.protocol,
                format!("request '{}' is already outstanding", key),
            )
        })?;
        if let Err(e) = send.await {
            self.pending.cancel(key);
            return Err(e);
        }
        self.pending
            .wait(key, rx, timeout)
            .await
            .map_err(|e| match e {
                WaitError::TimedOut => {
                    warn!(
                        device_id = %self.device_id,
                        key = %key,
                        operation,
                        "no response within {:?}",
                        timeout
                    );
                    DeviceError::timeout(&self.device_id, operation, timeout)
                }
                WaitError::Closed => DeviceError::not_connected(&self.device_id),
            })
    }

    /// Hand a response to the request waiting for `key`
    pub fn complete(&self, key: &str, reply: Reply) {
        if !self.pending.complete(key, reply) {
            debug!(
                device_id = %self.device_id,
                key = %key,
                "discarding response with no waiting request"
            );
        }
    }

    /// Record and forward an unsolicited message, matching subscriptions by
    /// topic filter
    pub fn deliver<T: Into<String>>(&self, kind: InboundKind, topic: T, payload: Value) {
        self.deliver_with(kind, topic, payload, |filter, message| {
            topic::matches(filter, &message.topic)
        });
    }

    /// Like [`deliver`](Self::deliver) with a protocol-specific filter match
    pub fn deliver_with<T, M>(&self, kind: InboundKind, topic: T, payload: Value, matches: M)
    where
        T: Into<String>,
        M: Fn(&str, &InboundMessage) -> bool,
    {
        let message = InboundMessage::new(&self.device_id, self.protocol, kind, topic, payload);
        self.observe(&message);
        self.publish(message, matches);
    }

    fn observe(&self, message: &InboundMessage) {
        let mut state = lock(&self.state);
        match message.kind {
            InboundKind::State => {
                if let Some(report) = message.fields() {
                    state.merge_report(report);
                }
            }
            InboundKind::Telemetry => {
                for (metric, value) in message.readings() {
                    state.record_metric(&metric, value);
                }
                state.online = true;
            }
            _ => {}
        }
    }

    fn publish<M>(&self, message: InboundMessage, matches: M)
    where
        M: Fn(&str, &InboundMessage) -> bool,
    {
        {
            let mut subscriptions = lock(&self.subscriptions);
            subscriptions.retain(|entry| !entry.sender.is_closed());
            for entry in subscriptions
                .iter()
                .filter(|entry| matches(&entry.filter, &message))
            {
                if entry.sender.try_send(message.clone()).is_err() {
                    warn!(
                        device_id = %self.device_id,
                        subscription = entry.id,
                        "subscriber lagging, message dropped"
                    );
                }
            }
        }
        if let Some(inbound) = &self.inbound {
            if let Err(e) = inbound.try_send(message) {
                warn!(device_id = %self.device_id, error = %e, "inbound channel rejected message");
            }
        }
    }

    /// Add a subscription under `id`
    pub fn subscribe(&self, id: u64, filter: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        lock(&self.subscriptions).push(SubscriptionEntry {
            id,
            filter: filter.to_string(),
            sender: tx,
        });
        Subscription::new(id, &self.device_id, filter, rx)
    }

    /// Remove a subscription. Returns its filter and whether another
    /// subscription still uses the same filter.
    pub fn unsubscribe(&self, id: u64) -> Option<(String, bool)> {
        let mut subscriptions = lock(&self.subscriptions);
        let index = subscriptions.iter().position(|e| e.id == id)?;
        let entry = subscriptions.remove(index);
        let still_used = subscriptions.iter().any(|e| e.filter == entry.filter);
        Some((entry.filter, still_used))
    }

    /// Fold a report into the observed state
    pub fn update_state<F: FnOnce(&mut DeviceState)>(&self, apply: F) {
        apply(&mut lock(&self.state));
    }

    /// Observed state of a live session
    pub fn snapshot(&self) -> DeviceState {
        let mut snapshot = lock(&self.state).clone();
        snapshot.online = true;
        snapshot
    }

    /// Fail outstanding requests and end every subscription
    pub fn close(&self) {
        self.pending.clear();
        lock(&self.subscriptions).clear();
    }

    /// Announce that the link dropped without a disconnect
    pub fn link_lost<M>(&self, matches: M)
    where
        M: Fn(&str, &InboundMessage) -> bool,
    {
        self.pending.clear();
        warn!(device_id = %self.device_id, protocol = %self.protocol, "link lost");
        let message = InboundMessage::new(
            &self.device_id,
            self.protocol,
            InboundKind::Status,
            topic::status(&self.device_id),
            json!({"status": "offline", "reason": "link_lost"}),
        );
        self.publish(message, matches);
    }
}

/// Serializes concurrent connects per device.
///
/// A gate lives only while a connect for its device is running or waiting.
#[derive(Debug, Default)]
pub struct ConnectGates {
    gates: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl ConnectGates {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` once no other connect for `device_id` is in flight
    pub async fn run<F: Future>(&self, device_id: &str, work: F) -> F::Output {
        let gate = self
            .gates
            .entry(device_id.to_string())
            .or_default()
            .value()
            .clone();
        let output = {
            let _guard = gate.lock().await;
            work.await
        };
        // Two holders left means the map and us: nobody is queued behind
        self.gates.remove_if(device_id, |_, current| {
            Arc::ptr_eq(current, &gate) && Arc::strong_count(current) == 2
        });
        output
    }

    /// Drop an idle gate left by a cancelled connect
    pub fn forget(&self, device_id: &str) {
        self.gates
            .remove_if(device_id, |_, current| Arc::strong_count(current) == 1);
    }

    /// Gates currently held
    pub fn len(&self) -> usize {
        self.gates.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deliver_reaches_matching_subscriptions() {
        let (tx, mut inbound) = mpsc::channel(4);
        let hub = SessionHub::new("lamp", Protocol::WebSocket, Some(tx));
        let mut state = hub.subscribe(1, "devices/lamp/state");
        let mut telemetry = hub.subscribe(2, "devices/+/telemetry");

        hub.deliver(InboundKind::State, topic::state("lamp"), json!({"power": true}));
        assert_eq!(state.recv().await.unwrap().payload, json!({"power": true}));
        assert!(telemetry.try_recv().is_none());
        assert_eq!(inbound.recv().await.unwrap().kind, InboundKind::State);
        assert_eq!(hub.snapshot().power, Some(true));

        assert_eq!(hub.unsubscribe(1), Some(("devices/lamp/state".to_string(), false)));
        assert_eq!(hub.unsubscribe(1), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_withdraws_key_on_send_failure() {
        let hub = SessionHub::new("lamp", Protocol::WebSocket, None);
        let err = hub
            .request("k", Duration::from_secs(1), "turn_on", async {
                Err(DeviceError::not_connected("lamp"))
            })
            .await
            .unwrap_err();
        assert!(err.is_not_connected());
        assert!(hub.pending().is_empty());
    }

    #[tokio::test]
    async fn test_link_lost_announces_offline() {
        let (tx, mut inbound) = mpsc::channel(4);
        let hub = SessionHub::new("lamp", Protocol::Mqtt, Some(tx));
        hub.link_lost(|filter, message| topic::matches(filter, &message.topic));
        let message = inbound.recv().await.unwrap();
        assert!(message.is_offline());
        assert_eq!(message.payload["reason"], "link_lost");
    }

    #[tokio::test]
    async fn test_gates_are_pruned_after_connect() {
        let gates = Arc::new(ConnectGates::new());
        assert_eq!(gates.run("lamp", async { 7 }).await, 7);
        assert!(gates.is_empty());

        // A queued connect keeps the gate until it finishes too
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let first = {
            let gates = gates.clone();
            tokio::spawn(async move {
                gates
                    .run("lamp", async {
                        let _ = release_rx.await;
                    })
                    .await
            })
        };
        while gates.is_empty() {
            tokio::task::yield_now().await;
        }
        let second = {
            let gates = gates.clone();
            tokio::spawn(async move { gates.run("lamp", async {}).await })
        };
        tokio::task::yield_now().await;
        release_tx.send(()).unwrap();
        first.await.unwrap();
        second.await.unwrap();
        assert!(gates.is_empty());
    }
}
