//! Named broadcast groups and their member sets.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::session::{Session, SessionId};

struct RoomState {
    members: HashMap<SessionId, Arc<Session>>,
    active: bool,
    /// First joiner claims ownership; immutable once set.
    creator: Option<SessionId>,
    /// Id of the persisted row, when the Repository accepted the room.
    persistence_id: Option<String>,
}

/// A named broadcast group. The member set lives behind the room's own
/// lock; the Hub is the only code that mutates it, under the documented
/// lock order.
pub struct Room {
    pub name: String,
    pub private: bool,
    /// Argon2id PHC string. Only meaningful when `private`.
    password_hash: Option<String>,
    pub max_clients: usize,
    pub created_at: DateTime<Utc>,
    state: RwLock<RoomState>,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("private", &self.private)
            .field("max_clients", &self.max_clients)
            .field("members", &self.member_count())
            .finish_non_exhaustive()
    }
}

impl Room {
    pub fn new(
        name: impl Into<String>,
        private: bool,
        password_hash: Option<String>,
        max_clients: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            private,
            password_hash,
            max_clients,
            created_at: Utc::now(),
            state: RwLock::new(RoomState {
                members: HashMap::new(),
                active: true,
                creator: None,
                persistence_id: None,
            }),
        })
    }

    /// Provisionally add a member. Fails when the room is at capacity.
    pub fn try_add_member(&self, session: Arc<Session>) -> bool {
        let mut state = self.state.write();
        if state.members.len() >= self.max_clients && !state.members.contains_key(&session.id) {
            return false;
        }
        state.members.insert(session.id.clone(), session);
        true
    }

    pub fn remove_member(&self, id: &SessionId) -> bool {
        self.state.write().members.remove(id).is_some()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.state.read().members.contains_key(id)
    }

    pub fn member_count(&self) -> usize {
        self.state.read().members.len()
    }

    /// Snapshot of the current member set. Taken under the read lock and
    /// released before any network write happens.
    pub fn members(&self) -> Vec<Arc<Session>> {
        self.state.read().members.values().cloned().collect()
    }

    pub fn is_active(&self) -> bool {
        self.state.read().active
    }

    pub fn deactivate(&self) {
        self.state.write().active = false;
    }

    /// Set the creator if the room has none. Returns whether this call
    /// claimed it.
    pub fn claim_creator(&self, id: &SessionId) -> bool {
        let mut state = self.state.write();
        if state.creator.is_none() {
            state.creator = Some(id.clone());
            true
        } else {
            false
        }
    }

    pub fn is_creator(&self, id: &SessionId) -> bool {
        self.state.read().creator.as_ref() == Some(id)
    }

    pub fn creator(&self) -> Option<SessionId> {
        self.state.read().creator.clone()
    }

    pub fn persistence_id(&self) -> Option<String> {
        self.state.read().persistence_id.clone()
    }

    pub fn set_persistence_id(&self, id: impl Into<String>) {
        self.state.write().persistence_id = Some(id.into());
    }

    pub fn password_hash(&self) -> Option<&str> {
        self.password_hash.as_deref()
    }

    /// Verify a join password against the stored Argon2id hash. Rooms
    /// without a hash accept any password.
    pub fn verify_password(&self, password: &str) -> bool {
        use argon2::Argon2;
        use password_hash::{PasswordHash, PasswordVerifier};

        let Some(hash) = self.password_hash.as_deref() else {
            return true;
        };
        let Ok(parsed) = PasswordHash::new(hash) else {
            return false;
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }
}
