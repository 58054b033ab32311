//! Room registry: create, lookup, list, delete, and bootstrap.

use std::sync::Arc;

use crate::envelope::{clock_prefix, Envelope, EnvelopeKind, RoomSummary, StoredMessage};
use crate::error::{HubError, RepositoryError};
use crate::room::Room;
use crate::session::{Session, SessionId};

use super::Hub;

/// Room names are 1–50 bytes.
const MAX_ROOM_NAME_LEN: usize = 50;

/// Hash a room password with Argon2id and a random salt.
pub(crate) fn hash_room_password(password: &str) -> Result<String, HubError> {
    use argon2::Argon2;
    use password_hash::rand_core::OsRng;
    use password_hash::{PasswordHasher, SaltString};

    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|err| {
            tracing::error!(?err, "room password hashing failed");
            HubError::Internal
        })
}

impl Hub {
    /// Create a room and announce it on `room.sync`.
    ///
    /// The store's unique constraint is the cluster-global guard: a
    /// conflict reported by the Repository rolls the in-memory room back
    /// and surfaces as `AlreadyExists`; any other persistence failure is
    /// logged and the in-memory room stands.
    pub async fn create_room(
        &self,
        name: &str,
        private: bool,
        password: &str,
        max_clients: usize,
    ) -> Result<Arc<Room>, HubError> {
        if name.is_empty() || name.len() > MAX_ROOM_NAME_LEN {
            return Err(HubError::InvalidName);
        }

        if let Some(repo) = &self.repo {
            match repo.room_by_name(name).await {
                Ok(Some(_)) => return Err(HubError::AlreadyExists),
                Ok(None) => {}
                Err(err) => tracing::warn!(?err, room = %name, "room existence check failed"),
            }
        }

        let password_hash = if private && !password.is_empty() {
            Some(hash_room_password(password)?)
        } else {
            None
        };

        let room = Room::new(name, private, password_hash, max_clients);
        {
            let mut state = self.state.write();
            if state.rooms.contains_key(name) {
                return Err(HubError::AlreadyExists);
            }
            state.rooms.insert(name.to_string(), room.clone());
        }

        if let Some(repo) = &self.repo {
            match repo
                .create_room(name, private, room.password_hash(), None)
                .await
            {
                Ok(record) => room.set_persistence_id(record.id),
                Err(RepositoryError::Conflict) => {
                    self.state.write().rooms.remove(name);
                    return Err(HubError::AlreadyExists);
                }
                Err(err) => {
                    tracing::warn!(?err, room = %name, "failed to persist room");
                }
            }
        }

        self.publish_room_sync(&room).await;

        tracing::info!(room = %name, private, max_clients, "room created");
        Ok(room)
    }

    pub fn get_room(&self, name: &str) -> Option<Arc<Room>> {
        self.state.read().rooms.get(name).cloned()
    }

    /// Public descriptors of every room, with `is_creator` resolved for
    /// the asking session.
    pub fn room_list(&self, session: &SessionId) -> Vec<RoomSummary> {
        let rooms: Vec<Arc<Room>> = self.state.read().rooms.values().cloned().collect();
        rooms
            .iter()
            .map(|room| RoomSummary {
                name: room.name.clone(),
                private: room.private,
                client_count: room.member_count(),
                is_creator: room.is_creator(session),
            })
            .collect()
    }

    /// Delete a room cluster-wide. Only the creator may delete; members'
    /// current room is cleared, never reassigned.
    pub async fn delete_room(&self, session: &Arc<Session>, name: &str) -> Result<(), HubError> {
        let room = self.get_room(name).ok_or(HubError::RoomNotFound)?;
        if !room.is_creator(&session.id) {
            return Err(HubError::NotCreator);
        }

        let notice = Envelope::local(
            EnvelopeKind::DeleteRoom,
            format!(
                "{} Room '{}' has been deleted by {}",
                clock_prefix(),
                name,
                session.name
            ),
        );
        self.broadcast(notice).await;

        self.remove_room_locally(name);
        self.drop_room_subscription(name);
        self.publish_room_delete(name).await;

        if let (Some(repo), Some(room_id)) = (self.repo.as_ref(), room.persistence_id()) {
            if let Err(err) = repo.delete_room(&room_id).await {
                tracing::warn!(?err, room = %name, "failed to delete persisted room");
            }
        }

        tracing::info!(room = %name, "room deleted");
        Ok(())
    }

    /// Remove a room from the registry and clear every member's
    /// current-room index entry. Used by delete and by cluster deletion
    /// propagation.
    pub(crate) fn remove_room_locally(&self, name: &str) {
        let mut state = self.state.write();
        let _op = self.room_op.lock();
        let Some(room) = state.rooms.remove(name) else {
            return;
        };
        room.deactivate();
        for member in room.members() {
            // Only clear index entries that still point at this room; a
            // member may have raced into another room.
            if state
                .session_rooms
                .get(&member.id)
                .is_some_and(|r| Arc::ptr_eq(r, &room))
            {
                state.session_rooms.remove(&member.id);
            }
            room.remove_member(&member.id);
        }
    }

    /// Bootstrap: install every persisted room with no creator.
    pub async fn load_rooms(&self) {
        let Some(repo) = &self.repo else { return };
        let records = match repo.all_rooms().await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(?err, "failed to load persisted rooms");
                return;
            }
        };

        let count = records.len();
        let mut state = self.state.write();
        for record in records {
            if state.rooms.contains_key(&record.name) {
                continue;
            }
            let room = Room::new(
                &record.name,
                record.private,
                record.password_hash.clone(),
                self.default_room_capacity,
            );
            room.set_persistence_id(record.id);
            state.rooms.insert(record.name, room);
        }
        drop(state);

        tracing::info!(count, "loaded persisted rooms");
    }

    /// History for `get_messages`. Rooms that were never persisted have no
    /// history.
    pub async fn room_history(
        &self,
        name: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredMessage>, HubError> {
        let room = self.get_room(name).ok_or(HubError::RoomNotFound)?;
        let (Some(repo), Some(room_id)) = (self.repo.as_ref(), room.persistence_id()) else {
            return Ok(Vec::new());
        };

        let records = repo
            .messages_for_room(&room_id, limit, offset)
            .await
            .map_err(|err| {
                tracing::warn!(?err, room = %name, "failed to load messages");
                HubError::Internal
            })?;

        Ok(records
            .into_iter()
            .map(|record| StoredMessage {
                sender: record.sender_name,
                content: record.content,
                timestamp: record.created_at,
            })
            .collect())
    }
}
