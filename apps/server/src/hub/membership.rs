//! Places a session in at most one room at a time.
//!
//! Join and leave mutate the registries under the registry lock and the
//! room-operation lock (in that order), with no I/O inside the critical
//! section; repository writes, bus subscriptions, and notification
//! fan-outs run after the locks are released.

use std::sync::Arc;

use crate::envelope::{clock_prefix, Envelope, EnvelopeKind};
use crate::error::HubError;
use crate::room::Room;
use crate::session::Session;

use super::{Hub, HubState};

impl Hub {
    /// Move a session into a room, leaving its previous room if any.
    ///
    /// The mutation sequence rolls back the provisional member-set add on
    /// password failure, so a failed join leaves the room unchanged.
    pub async fn join_room(
        &self,
        session: &Arc<Session>,
        room: &Arc<Room>,
        password: &str,
    ) -> Result<(), HubError> {
        let left: Option<Arc<Room>>;
        {
            let mut state = self.state.write();
            let _op = self.room_op.lock();

            // First joiner claims ownership.
            room.claim_creator(&session.id);

            if !room.is_active() {
                return Err(HubError::RoomInactive);
            }
            if !room.try_add_member(session.clone()) {
                return Err(HubError::RoomFull);
            }
            if room.private && !room.verify_password(password) {
                // Roll back the provisional add.
                room.remove_member(&session.id);
                return Err(HubError::InvalidPassword);
            }

            left = leave_previous_locked(&mut state, session, room);
            state
                .session_rooms
                .insert(session.id.clone(), room.clone());
        }

        if let Some(previous) = left {
            self.run_leave_effects(session, &previous, false).await;
        }

        if let (Some(repo), Some(user_id), Some(room_id)) = (
            self.repo.as_ref(),
            session.user_id.as_ref(),
            room.persistence_id(),
        ) {
            if session.authenticated {
                if let Err(err) = repo.add_member(&room_id, user_id).await {
                    tracing::warn!(?err, room = %room.name, "failed to persist membership");
                }
            }
        }

        self.subscribe_room_subject(room).await;

        let joined = Envelope::synthesized(
            EnvelopeKind::RoomJoin,
            format!("{} {} has joined the room", clock_prefix(), session.name),
        );
        self.broadcast_to_room(room, joined).await;

        let welcome = format!("{} Welcome to room '{}'!", clock_prefix(), room.name);
        if session.send(&welcome).await.is_err() {
            tracing::warn!(session = %session.name, "welcome write failed; scheduling unregister");
            self.unregister(session.clone()).await;
            return Err(HubError::WriteFailure);
        }

        tracing::info!(session = %session.name, room = %room.name, "joined room");
        Ok(())
    }

    /// Remove a session from its current room. No-op when the session is
    /// not in one.
    pub async fn leave_room(&self, session: &Arc<Session>) {
        let left = {
            let mut state = self.state.write();
            let _op = self.room_op.lock();
            leave_locked(&mut state, session)
        };

        if let Some(room) = left {
            self.run_leave_effects(session, &room, true).await;
            tracing::info!(session = %session.name, room = %room.name, "left room");
        }
    }

    /// Deferred leave effects: membership row removal, the leaver's
    /// confirmation frame (explicit leaves only), the room-scoped
    /// notification, and dropping the room's bus subscription once no
    /// local members remain.
    pub(crate) async fn run_leave_effects(
        &self,
        session: &Arc<Session>,
        room: &Arc<Room>,
        confirm: bool,
    ) {
        if let (Some(repo), Some(user_id), Some(room_id)) = (
            self.repo.as_ref(),
            session.user_id.as_ref(),
            room.persistence_id(),
        ) {
            if session.authenticated {
                if let Err(err) = repo.remove_member(&room_id, user_id).await {
                    tracing::warn!(?err, room = %room.name, "failed to remove membership row");
                }
            }
        }

        if confirm {
            let confirmation =
                format!("ROOM_LEAVE_SUCCESS:You have left the room \"{}\"", room.name);
            if session.send(&confirmation).await.is_err() {
                tracing::debug!(session = %session.name, "leave confirmation write failed");
            }
        }

        // Unlike the join notification, this one carries no message id, so
        // peer servers relay it to their local members.
        let notice = Envelope::local(
            EnvelopeKind::RoomLeave,
            format!("{} {} has left the room", clock_prefix(), session.name),
        );
        self.broadcast_to_room(room, notice).await;

        if room.member_count() == 0 {
            self.drop_room_subscription(&room.name);
        }
    }
}

/// Remove a session from its current room and the index. Caller holds the
/// registry write lock and the room-operation lock.
pub(crate) fn leave_locked(state: &mut HubState, session: &Arc<Session>) -> Option<Arc<Room>> {
    let room = state.session_rooms.remove(&session.id)?;
    room.remove_member(&session.id);
    Some(room)
}

/// Like [`leave_locked`], but keeps the session in place when its current
/// room is the one being joined (re-joining a room must not evict the
/// member that was just provisionally added).
fn leave_previous_locked(
    state: &mut HubState,
    session: &Arc<Session>,
    joining: &Arc<Room>,
) -> Option<Arc<Room>> {
    let previous = state.session_rooms.get(&session.id)?;
    if Arc::ptr_eq(previous, joining) {
        return None;
    }
    leave_locked(state, session)
}
