//! In-process progress broker: per-execution fan-out of JSON events.
//!
//! Events are best-effort. Nothing is persisted or replayed; a subscriber
//! that connects late sees only what is published after it subscribed.
//! Delivery order within one healthy subscriber follows publish order, and
//! concurrent publishes for the same execution are serialized by the map
//! lock so subscribers always see whole events.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::events::ProgressEvent;

/// Token identifying one subscription, returned by [`ProgressBroker::subscribe`].
pub type SubscriberToken = u64;

/// Fan-out hub mapping execution ids to live subscribers.
pub struct ProgressBroker {
    subscribers: Mutex<HashMap<Uuid, HashMap<SubscriberToken, mpsc::UnboundedSender<String>>>>,
    next_token: AtomicU64,
}

impl ProgressBroker {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Register a subscriber for one execution's event stream.
    pub fn subscribe(
        &self,
        execution_id: Uuid,
    ) -> (SubscriberToken, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("broker lock poisoned")
            .entry(execution_id)
            .or_default()
            .insert(token, tx);
        debug!(execution_id = %execution_id, token, "subscriber registered");
        (token, rx)
    }

    /// Drop one subscriber. Removing an already-gone subscriber is a no-op.
    pub fn unsubscribe(&self, execution_id: Uuid, token: SubscriberToken) {
        let mut map = self.subscribers.lock().expect("broker lock poisoned");
        if let Some(subs) = map.get_mut(&execution_id) {
            subs.remove(&token);
            if subs.is_empty() {
                map.remove(&execution_id);
            }
        }
    }

    /// Serialize the event once and deliver it to every current subscriber.
    /// Subscribers whose channel is closed are dropped.
    pub fn publish(&self, execution_id: Uuid, event: &ProgressEvent) {
        let message = match serde_json::to_string(event) {
            Ok(m) => m,
            Err(e) => {
                error!(execution_id = %execution_id, event = event.name(),
                    "failed to serialize event: {}", e);
                return;
            }
        };
        debug!(execution_id = %execution_id, event = event.name(), "publishing event");

        let mut map = self.subscribers.lock().expect("broker lock poisoned");
        let Some(subs) = map.get_mut(&execution_id) else {
            return;
        };

        let mut dead = Vec::new();
        for (token, tx) in subs.iter() {
            if tx.send(message.clone()).is_err() {
                dead.push(*token);
            }
        }
        for token in dead {
            warn!(execution_id = %execution_id, token, "dropping dead subscriber");
            subs.remove(&token);
        }
        if subs.is_empty() {
            map.remove(&execution_id);
        }
    }

    /// Number of live subscribers for one execution.
    pub fn subscriber_count(&self, execution_id: Uuid) -> usize {
        self.subscribers
            .lock()
            .expect("broker lock poisoned")
            .get(&execution_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

impl Default for ProgressBroker {
    fn default() -> Self {
        Self::new()
    }
}
