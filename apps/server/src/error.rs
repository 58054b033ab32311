use thiserror::Error;

/// Errors produced by Hub operations.
///
/// `Display` strings are the user-visible texts; the dispatch layer
/// prefixes them with `Error: ` before writing them back to the client.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("invalid room name")]
    InvalidName,
    #[error("room already exists")]
    AlreadyExists,
    #[error("room is not active")]
    RoomInactive,
    #[error("room is full")]
    RoomFull,
    #[error("invalid password")]
    InvalidPassword,
    #[error("room does not exist")]
    RoomNotFound,
    #[error("only the room creator can delete this room")]
    NotCreator,
    #[error("failed to write to session")]
    WriteFailure,
    #[error("server is shutting down")]
    Shutdown,
    #[error("internal error")]
    Internal,
}

/// Transport write/close failures. Any of these marks the session as gone;
/// no retry is attempted.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("write timed out")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Repository failures are degradations: callers log and proceed with the
/// in-memory state.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("record already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("storage error: {0}")]
    Storage(String),
}

/// Bus failures are degradations: the server continues without the bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus is not connected")]
    NotConnected,
    #[error("bus error: {0}")]
    Other(String),
}
