// =============================================================================
// Event bus — fan-out of engine events to WebSocket subscribers
// =============================================================================
//
// The engine calls `publish` once per event; every subscriber gets its own
// clone over an unbounded mpsc channel. Subscribers that have dropped their
// receiver (disconnected sockets) are pruned on the next publish rather than
// eagerly, keeping the hot path a single read-lock pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::EngineEvent;

pub type SubscriberId = u64;

pub struct EventBus {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<SubscriberId, mpsc::UnboundedSender<EngineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a new subscriber and returns its id plus the receiving end.
    /// Pair the id with a later call to `unsubscribe` on disconnect.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().insert(id, tx);
        debug!(subscriber_id = id, "event bus subscriber registered");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.write().remove(&id);
        debug!(subscriber_id = id, "event bus subscriber removed");
    }

    /// Clones `event` to every live subscriber. Dead channels are collected
    /// during the broadcast and pruned in a single follow-up write-lock pass.
    pub fn publish(&self, event: EngineEvent) {
        let dead: Vec<SubscriberId> = {
            let subscribers = self.subscribers.read();
            subscribers
                .iter()
                .filter_map(|(id, tx)| tx.send(event.clone()).err().map(|_| *id))
                .collect()
        };

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in dead {
                subscribers.remove(&id);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EngineEventKind;
    use serde_json::json;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let (_, mut rx) = bus.subscribe();

        bus.publish(EngineEvent::new(EngineEventKind::EngineStarted, json!({"ok": true})));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event, EngineEventKind::EngineStarted);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_next_publish() {
        let bus = EventBus::new();
        let (id, rx) = bus.subscribe();
        drop(rx);

        bus.publish(EngineEvent::new(EngineEventKind::EngineStopped, json!({})));
        assert_eq!(bus.subscriber_count(), 0);
        bus.unsubscribe(id); // no-op, already pruned
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive_broadcast() {
        let bus = EventBus::new();
        let (_, mut rx1) = bus.subscribe();
        let (_, mut rx2) = bus.subscribe();

        bus.publish(EngineEvent::new(EngineEventKind::CycleCompleted, json!({"n": 1})));

        assert_eq!(rx1.recv().await.unwrap().event, EngineEventKind::CycleCompleted);
        assert_eq!(rx2.recv().await.unwrap().event, EngineEventKind::CycleCompleted);
    }
}
