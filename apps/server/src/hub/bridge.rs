//! Deduplicating bridge to the external bus.
//!
//! The bridge owns three kinds of subscriptions: `chat.global`,
//! `room.sync`, and one `chat.room.<name>` per room this server has local
//! members in. Ingress drops envelopes whose origin id matches this
//! server; egress stamps every publish with this server's id and a fresh
//! message id, and nothing that already carries a message id is ever
//! republished. Together those two rules deliver each message exactly once
//! per server.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use crate::bus::{
    room_subject, BusEnvelope, BusHandler, SubscriptionHandle, SUBJECT_GLOBAL_CHAT,
    SUBJECT_ROOM_SYNC,
};
use crate::envelope::{Envelope, EnvelopeKind};
use crate::room::Room;
use parlor_common::id;

use super::Hub;

/// Public room descriptor carried on `room.sync`.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RoomDescriptor {
    pub name: String,
    pub private: bool,
    pub password_hash: Option<String>,
    pub max_clients: usize,
}

/// Live subscriptions, torn down on Hub shutdown.
#[derive(Default)]
pub(crate) struct BridgeSubscriptions {
    standing: Vec<SubscriptionHandle>,
    rooms: HashMap<String, SubscriptionHandle>,
}

impl Hub {
    /// Install the standing `chat.global` and `room.sync` subscriptions.
    pub(crate) async fn install_bridge(&self) {
        let Some(bus) = &self.bus else { return };

        match bus
            .subscribe(SUBJECT_GLOBAL_CHAT, global_handler(self.self_ref.clone()))
            .await
        {
            Ok(handle) => self.subscriptions.lock().standing.push(handle),
            Err(err) => tracing::warn!(?err, "failed to subscribe to global chat"),
        }

        match bus
            .subscribe(SUBJECT_ROOM_SYNC, room_sync_handler(self.self_ref.clone()))
            .await
        {
            Ok(handle) => self.subscriptions.lock().standing.push(handle),
            Err(err) => tracing::warn!(?err, "failed to subscribe to room sync"),
        }
    }

    /// Subscribe to a room's subject, once per room.
    pub(crate) async fn subscribe_room_subject(&self, room: &Arc<Room>) {
        let Some(bus) = &self.bus else { return };
        if self.subscriptions.lock().rooms.contains_key(&room.name) {
            return;
        }

        let subject = room_subject(&room.name);
        let handler = room_handler(self.self_ref.clone(), room.name.clone());
        match bus.subscribe(&subject, handler).await {
            Ok(handle) => {
                let mut subs = self.subscriptions.lock();
                if subs.rooms.contains_key(&room.name) {
                    // Lost a subscribe race; keep the first subscription.
                    drop(subs);
                    handle.unsubscribe();
                } else {
                    subs.rooms.insert(room.name.clone(), handle);
                    tracing::debug!(subject = %subject, "subscribed to room subject");
                }
            }
            Err(err) => tracing::warn!(?err, subject = %subject, "room subscribe failed"),
        }
    }

    pub(crate) fn drop_room_subscription(&self, name: &str) {
        if let Some(handle) = self.subscriptions.lock().rooms.remove(name) {
            tracing::debug!(subject = %handle.subject(), "unsubscribed from room subject");
            handle.unsubscribe();
        }
    }

    pub(crate) fn teardown_bridge(&self) {
        let mut subs = self.subscriptions.lock();
        for handle in subs.standing.drain(..) {
            handle.unsubscribe();
        }
        for (_, handle) in subs.rooms.drain() {
            handle.unsubscribe();
        }
    }

    /// Publish a locally originated global envelope on `chat.global`.
    pub(crate) async fn publish_global(&self, envelope: &Envelope) {
        let Some(bus) = &self.bus else { return };
        let payload = self.to_bus_envelope(envelope, None);
        if let Err(err) = bus.publish(SUBJECT_GLOBAL_CHAT, payload).await {
            tracing::warn!(?err, "failed to publish global message");
        }
    }

    /// Publish a locally originated room envelope on the room's subject.
    pub(crate) async fn publish_room(&self, room: &Arc<Room>, envelope: &Envelope) {
        let Some(bus) = &self.bus else { return };
        let subject = room_subject(&room.name);
        let payload = self.to_bus_envelope(envelope, Some(&room.name));
        if let Err(err) = bus.publish(&subject, payload).await {
            tracing::warn!(?err, subject = %subject, "failed to publish room message");
        }
    }

    /// Announce a new room so peer servers materialize it.
    pub(crate) async fn publish_room_sync(&self, room: &Arc<Room>) {
        let Some(bus) = &self.bus else { return };
        let descriptor = RoomDescriptor {
            name: room.name.clone(),
            private: room.private,
            password_hash: room.password_hash().map(str::to_string),
            max_clients: room.max_clients,
        };
        let content = match serde_json::to_string(&descriptor) {
            Ok(content) => content,
            Err(err) => {
                tracing::error!(?err, "failed to encode room descriptor");
                return;
            }
        };

        let mut payload =
            self.to_bus_envelope(&Envelope::local(EnvelopeKind::RoomSync, content), None);
        payload.room_name = room.name.clone();
        if let Err(err) = bus.publish(SUBJECT_ROOM_SYNC, payload).await {
            tracing::warn!(?err, room = %room.name, "failed to publish room sync");
        }
    }

    /// Announce a room deletion so peer servers drop it.
    pub(crate) async fn publish_room_delete(&self, name: &str) {
        let Some(bus) = &self.bus else { return };
        let mut payload =
            self.to_bus_envelope(&Envelope::local(EnvelopeKind::DeleteRoom, ""), None);
        payload.room_name = name.to_string();
        if let Err(err) = bus.publish(SUBJECT_ROOM_SYNC, payload).await {
            tracing::warn!(?err, room = %name, "failed to publish room deletion");
        }
    }

    /// Materialize a room announced by a peer. A descriptor for a room
    /// that already exists is a no-op.
    pub(crate) fn materialize_room(&self, descriptor: RoomDescriptor) {
        let mut state = self.state.write();
        if state.rooms.contains_key(&descriptor.name) {
            return;
        }
        let room = Room::new(
            &descriptor.name,
            descriptor.private,
            descriptor.password_hash,
            descriptor.max_clients,
        );
        state.rooms.insert(room.name.clone(), room.clone());
        drop(state);
        tracing::info!(room = %room.name, "room synced from bus");
    }

    /// Stamp a local envelope for the wire: fresh message id, this
    /// server's origin id, and sender identity resolved from the registry.
    fn to_bus_envelope(&self, envelope: &Envelope, room_name: Option<&str>) -> BusEnvelope {
        let sender = envelope
            .sender
            .as_ref()
            .and_then(|id| self.state.read().sessions.get(id).cloned());

        BusEnvelope {
            message_id: id::prefixed_ulid(id::prefix::MESSAGE),
            content: envelope.content.clone(),
            kind: envelope.kind.as_str().to_string(),
            sender_id: sender
                .as_ref()
                .and_then(|s| s.user_id.clone())
                .unwrap_or_default(),
            sender_name: sender.map(|s| s.name.clone()).unwrap_or_default(),
            room_name: room_name.map(str::to_string).unwrap_or_default(),
            server_id: self.server_id.clone(),
            timestamp: envelope.timestamp,
        }
    }
}

/// `chat.global` ingress: drop own echoes, then feed the Broadcast path
/// with the message id preserved so it is never republished.
fn global_handler(hub: Weak<Hub>) -> BusHandler {
    Arc::new(move |payload: BusEnvelope| {
        let hub = hub.clone();
        Box::pin(async move {
            let Some(hub) = hub.upgrade() else { return };
            if payload.server_id == hub.server_id {
                tracing::debug!("skipping global message from own server");
                return;
            }
            let Some(kind) = EnvelopeKind::from_str(&payload.kind) else {
                tracing::debug!(kind = %payload.kind, "dropping unknown bus envelope kind");
                return;
            };
            hub.broadcast(Envelope {
                message_id: Some(payload.message_id),
                content: payload.content,
                kind,
                sender: None,
                target: None,
                origin: Some(payload.server_id),
                timestamp: payload.timestamp,
            })
            .await;
        })
    })
}

/// `chat.room.<name>` ingress: drop own echoes, then fan out locally with
/// the message id preserved.
fn room_handler(hub: Weak<Hub>, room_name: String) -> BusHandler {
    Arc::new(move |payload: BusEnvelope| {
        let hub = hub.clone();
        let room_name = room_name.clone();
        Box::pin(async move {
            let Some(hub) = hub.upgrade() else { return };
            if payload.server_id == hub.server_id {
                tracing::debug!(room = %room_name, "skipping room message from own server");
                return;
            }
            let Some(room) = hub.get_room(&room_name) else {
                tracing::debug!(room = %room_name, "dropping bus message for unknown room");
                return;
            };
            let Some(kind) = EnvelopeKind::from_str(&payload.kind) else {
                return;
            };
            hub.broadcast_to_room(
                &room,
                Envelope {
                    message_id: Some(payload.message_id),
                    content: payload.content,
                    kind,
                    sender: None,
                    target: Some(room_name),
                    origin: Some(payload.server_id),
                    timestamp: payload.timestamp,
                },
            )
            .await;
        })
    })
}

/// `room.sync` ingress: materialize created rooms, drop deleted ones.
fn room_sync_handler(hub: Weak<Hub>) -> BusHandler {
    Arc::new(move |payload: BusEnvelope| {
        let hub = hub.clone();
        Box::pin(async move {
            let Some(hub) = hub.upgrade() else { return };
            if payload.server_id == hub.server_id {
                return;
            }
            match EnvelopeKind::from_str(&payload.kind) {
                Some(EnvelopeKind::RoomSync) => {
                    match serde_json::from_str::<RoomDescriptor>(&payload.content) {
                        Ok(descriptor) => hub.materialize_room(descriptor),
                        Err(err) => {
                            tracing::warn!(?err, "failed to decode room sync descriptor");
                        }
                    }
                }
                Some(EnvelopeKind::DeleteRoom) => {
                    if !payload.room_name.is_empty() {
                        tracing::info!(room = %payload.room_name, "room deletion synced from bus");
                        hub.remove_room_locally(&payload.room_name);
                        hub.drop_room_subscription(&payload.room_name);
                    }
                }
                _ => {}
            }
        })
    })
}
