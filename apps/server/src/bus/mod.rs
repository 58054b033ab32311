//! Narrow seam to the external message bus.
//!
//! The bridge only needs `publish`, `subscribe`, and `server_id`, so the
//! whole bus stays behind this trait and the dedup properties are
//! unit-testable without real infrastructure.

pub mod memory;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::BusError;

pub const SUBJECT_GLOBAL_CHAT: &str = "chat.global";
pub const SUBJECT_ROOM_PREFIX: &str = "chat.room";
pub const SUBJECT_PRESENCE_PREFIX: &str = "presence";
pub const SUBJECT_ROOM_SYNC: &str = "room.sync";

/// Subject for a specific room's broadcasts.
pub fn room_subject(room_name: &str) -> String {
    format!("{SUBJECT_ROOM_PREFIX}.{room_name}")
}

/// Subject reserved for presence updates. Not published by the core.
pub fn presence_subject(room_name: &str) -> String {
    format!("{SUBJECT_PRESENCE_PREFIX}.{room_name}")
}

/// Wire payload exchanged over the bus.
///
/// `server_id` is mandatory on publish; `message_id` is the only field a
/// receiver needs to decide rebroadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub message_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub room_name: String,
    pub server_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Delivery callback. Runs on bus-client tasks; must not be invoked while
/// Hub locks are held.
pub type BusHandler =
    std::sync::Arc<dyn Fn(BusEnvelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle to an active subscription. `unsubscribe` tears it down; dropping
/// the handle without calling it leaves the subscription in place.
pub struct SubscriptionHandle {
    subject: String,
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl SubscriptionHandle {
    pub fn new(subject: impl Into<String>, cancel: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            subject: subject.into(),
            cancel: Mutex::new(Some(cancel)),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn unsubscribe(self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel();
        }
    }
}

/// Publish/subscribe transport connecting peer server instances.
#[async_trait::async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, subject: &str, envelope: BusEnvelope) -> Result<(), BusError>;

    async fn subscribe(
        &self,
        subject: &str,
        handler: BusHandler,
    ) -> Result<SubscriptionHandle, BusError>;

    /// Identifier embedded in every publish so receivers can skip their
    /// own echoes.
    fn server_id(&self) -> &str;
}
