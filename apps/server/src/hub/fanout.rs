//! Synchronous delivery of one envelope to every current member of a room.

use std::sync::Arc;

use crate::envelope::{Envelope, EnvelopeKind};
use crate::room::Room;
use crate::session::Session;

use super::Hub;

impl Hub {
    /// Deliver an envelope to a room's members.
    ///
    /// The member set is snapshotted under the room's read lock before any
    /// network write. Writes happen inline on the calling task so that,
    /// per room and per server, delivery order matches call order.
    pub async fn broadcast_to_room(&self, room: &Arc<Room>, envelope: Envelope) {
        let members = room.members();

        // Locally originated envelopes go out on the room's bus subject
        // before local delivery. A populated message id marks the envelope
        // as bus-originated or synthesized; republishing it would loop.
        if envelope.message_id.is_none() {
            self.publish_room(room, &envelope).await;
        }

        if envelope.content.len() > self.max_message_size {
            tracing::warn!(
                room = %room.name,
                size = envelope.content.len(),
                limit = self.max_message_size,
                "rejecting oversize envelope"
            );
            return;
        }

        self.persist_room_message(room, &envelope).await;

        let formatted = format!("[{}] {}", room.name, envelope.content);
        let mut failed: Vec<Arc<Session>> = Vec::new();
        for member in &members {
            if !member.has_transport() {
                continue;
            }
            if envelope.kind == EnvelopeKind::RoomMessage
                && envelope.sender.as_ref() == Some(&member.id)
            {
                continue;
            }
            if member.send(&formatted).await.is_err() {
                tracing::warn!(
                    session = %member.name,
                    room = %room.name,
                    "room write failed; scheduling unregister"
                );
                failed.push(member.clone());
            }
        }

        for session in failed {
            self.unregister(session).await;
        }
    }

    async fn persist_room_message(&self, room: &Arc<Room>, envelope: &Envelope) {
        if envelope.kind != EnvelopeKind::RoomMessage || envelope.message_id.is_some() {
            return;
        }
        let (Some(repo), Some(room_id)) = (self.repo.as_ref(), room.persistence_id()) else {
            return;
        };
        let Some(sender_id) = &envelope.sender else { return };
        let sender = self.state.read().sessions.get(sender_id).cloned();
        let Some(sender) = sender else { return };
        let (Some(user_id), true) = (&sender.user_id, sender.authenticated) else {
            return;
        };

        if let Err(err) = repo
            .create_message(Some(&room_id), user_id, &sender.name, &envelope.content)
            .await
        {
            tracing::warn!(?err, room = %room.name, "failed to persist room message");
        }
    }
}
