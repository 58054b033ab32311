//! Abstraction over the relational store for rooms, messages, and
//! memberships.
//!
//! Backed by a database in production and an in-memory map in tests and
//! single-node deployments. The in-memory implementation enforces the same
//! unique-name constraint the store's schema would, so `create_room`
//! collision handling is exercisable without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::RepositoryError;
use parlor_common::id;

#[derive(Debug, Clone)]
pub struct RoomRecord {
    pub id: String,
    pub name: String,
    pub private: bool,
    pub password_hash: Option<String>,
    pub creator_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: String,
    /// `None` for global (room-less) chat messages.
    pub room_id: Option<String>,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn create_room(
        &self,
        name: &str,
        private: bool,
        password_hash: Option<&str>,
        creator_id: Option<&str>,
    ) -> Result<RoomRecord, RepositoryError>;

    async fn room_by_name(&self, name: &str) -> Result<Option<RoomRecord>, RepositoryError>;

    async fn all_rooms(&self) -> Result<Vec<RoomRecord>, RepositoryError>;

    async fn delete_room(&self, id: &str) -> Result<(), RepositoryError>;

    async fn create_message(
        &self,
        room_id: Option<&str>,
        sender_id: &str,
        sender_name: &str,
        content: &str,
    ) -> Result<MessageRecord, RepositoryError>;

    /// Messages for a room, newest last, windowed by limit/offset.
    async fn messages_for_room(
        &self,
        room_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MessageRecord>, RepositoryError>;

    async fn add_member(&self, room_id: &str, user_id: &str) -> Result<(), RepositoryError>;

    async fn remove_member(&self, room_id: &str, user_id: &str) -> Result<(), RepositoryError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tables {
    rooms: HashMap<String, RoomRecord>,
    messages: Vec<MessageRecord>,
    members: HashMap<String, Vec<String>>,
}

#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_room(
        &self,
        name: &str,
        private: bool,
        password_hash: Option<&str>,
        creator_id: Option<&str>,
    ) -> Result<RoomRecord, RepositoryError> {
        let mut tables = self.tables.lock();
        if tables.rooms.values().any(|r| r.name == name) {
            return Err(RepositoryError::Conflict);
        }
        let record = RoomRecord {
            id: id::prefixed_ulid(id::prefix::ROOM),
            name: name.to_string(),
            private,
            password_hash: password_hash.map(str::to_string),
            creator_id: creator_id.map(str::to_string),
            created_at: Utc::now(),
        };
        tables.rooms.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn room_by_name(&self, name: &str) -> Result<Option<RoomRecord>, RepositoryError> {
        Ok(self
            .tables
            .lock()
            .rooms
            .values()
            .find(|r| r.name == name)
            .cloned())
    }

    async fn all_rooms(&self) -> Result<Vec<RoomRecord>, RepositoryError> {
        Ok(self.tables.lock().rooms.values().cloned().collect())
    }

    async fn delete_room(&self, id: &str) -> Result<(), RepositoryError> {
        let mut tables = self.tables.lock();
        tables.rooms.remove(id).ok_or(RepositoryError::NotFound)?;
        tables.members.remove(id);
        Ok(())
    }

    async fn create_message(
        &self,
        room_id: Option<&str>,
        sender_id: &str,
        sender_name: &str,
        content: &str,
    ) -> Result<MessageRecord, RepositoryError> {
        let record = MessageRecord {
            id: id::prefixed_ulid(id::prefix::MESSAGE),
            room_id: room_id.map(str::to_string),
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        self.tables.lock().messages.push(record.clone());
        Ok(record)
    }

    async fn messages_for_room(
        &self,
        room_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MessageRecord>, RepositoryError> {
        Ok(self
            .tables
            .lock()
            .messages
            .iter()
            .filter(|m| m.room_id.as_deref() == Some(room_id))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn add_member(&self, room_id: &str, user_id: &str) -> Result<(), RepositoryError> {
        let mut tables = self.tables.lock();
        let members = tables.members.entry(room_id.to_string()).or_default();
        if !members.iter().any(|m| m == user_id) {
            members.push(user_id.to_string());
        }
        Ok(())
    }

    async fn remove_member(&self, room_id: &str, user_id: &str) -> Result<(), RepositoryError> {
        if let Some(members) = self.tables.lock().members.get_mut(room_id) {
            members.retain(|m| m != user_id);
        }
        Ok(())
    }
}
