//! In-process bus for single-node deployments and tests.
//!
//! A `MemoryBusNetwork` is the shared subject map; each server instance
//! gets its own `MemoryBus` endpoint. Delivery is synchronous and in
//! publish order, and a publisher's own endpoint receives its own messages
//! just like with a real broker — the origin check on ingress is what
//! suppresses self-delivery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::{Bus, BusEnvelope, BusHandler, SubscriptionHandle};
use crate::error::BusError;

struct Subscriber {
    id: u64,
    handler: BusHandler,
}

#[derive(Default)]
pub struct MemoryBusNetwork {
    subjects: DashMap<String, Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl MemoryBusNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create an endpoint for one server instance.
    pub fn endpoint(self: &Arc<Self>, server_id: impl Into<String>) -> MemoryBus {
        MemoryBus {
            network: self.clone(),
            server_id: server_id.into(),
        }
    }

    fn add(&self, subject: &str, handler: BusHandler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subjects
            .entry(subject.to_string())
            .or_default()
            .push(Subscriber { id, handler });
        id
    }

    fn remove(&self, subject: &str, id: u64) {
        if let Some(mut subs) = self.subjects.get_mut(subject) {
            subs.retain(|s| s.id != id);
        }
    }

    fn handlers(&self, subject: &str) -> Vec<BusHandler> {
        self.subjects
            .get(subject)
            .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
            .unwrap_or_default()
    }
}

pub struct MemoryBus {
    network: Arc<MemoryBusNetwork>,
    server_id: String,
}

#[async_trait::async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, subject: &str, envelope: BusEnvelope) -> Result<(), BusError> {
        // Snapshot first so a handler that subscribes or unsubscribes does
        // not deadlock against the map.
        let handlers = self.network.handlers(subject);
        for handler in handlers {
            handler(envelope.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        handler: BusHandler,
    ) -> Result<SubscriptionHandle, BusError> {
        let id = self.network.add(subject, handler);
        let network = self.network.clone();
        let subject_owned = subject.to_string();
        Ok(SubscriptionHandle::new(
            subject,
            Box::new(move || network.remove(&subject_owned, id)),
        ))
    }

    fn server_id(&self) -> &str {
        &self.server_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parking_lot::Mutex;

    fn envelope(kind: &str, content: &str, server_id: &str) -> BusEnvelope {
        BusEnvelope {
            message_id: parlor_common::id::prefixed_ulid("msg"),
            content: content.to_string(),
            kind: kind.to_string(),
            sender_id: String::new(),
            sender_name: String::new(),
            room_name: String::new(),
            server_id: server_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn recording_handler() -> (BusHandler, Arc<Mutex<Vec<String>>>) {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: BusHandler = Arc::new(move |env: BusEnvelope| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().push(env.content);
            })
        });
        (handler, seen)
    }

    #[tokio::test]
    async fn delivers_to_every_endpoint_including_publisher() {
        let network = MemoryBusNetwork::new();
        let a = network.endpoint("srv_a");
        let b = network.endpoint("srv_b");

        let (ha, seen_a) = recording_handler();
        let (hb, seen_b) = recording_handler();
        a.subscribe("chat.global", ha).await.unwrap();
        b.subscribe("chat.global", hb).await.unwrap();

        a.publish("chat.global", envelope("chat", "hello", "srv_a"))
            .await
            .unwrap();

        assert_eq!(seen_a.lock().as_slice(), ["hello"]);
        assert_eq!(seen_b.lock().as_slice(), ["hello"]);
    }

    #[tokio::test]
    async fn delivery_preserves_publish_order() {
        let network = MemoryBusNetwork::new();
        let a = network.endpoint("srv_a");

        let (handler, seen) = recording_handler();
        a.subscribe("chat.room.alpha", handler).await.unwrap();

        for i in 0..5 {
            a.publish("chat.room.alpha", envelope("room_message", &i.to_string(), "srv_a"))
                .await
                .unwrap();
        }

        assert_eq!(seen.lock().as_slice(), ["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let network = MemoryBusNetwork::new();
        let a = network.endpoint("srv_a");

        let (handler, seen) = recording_handler();
        let sub = a.subscribe("room.sync", handler).await.unwrap();

        a.publish("room.sync", envelope("room_sync", "one", "srv_a"))
            .await
            .unwrap();
        sub.unsubscribe();
        a.publish("room.sync", envelope("room_sync", "two", "srv_a"))
            .await
            .unwrap();

        assert_eq!(seen.lock().as_slice(), ["one"]);
    }

    #[tokio::test]
    async fn subjects_are_isolated() {
        let network = MemoryBusNetwork::new();
        let a = network.endpoint("srv_a");

        let (handler, seen) = recording_handler();
        a.subscribe(&crate::bus::room_subject("alpha"), handler)
            .await
            .unwrap();

        a.publish(
            &crate::bus::room_subject("beta"),
            envelope("room_message", "wrong room", "srv_a"),
        )
        .await
        .unwrap();

        assert!(seen.lock().is_empty());
    }
}
