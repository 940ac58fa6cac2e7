//! Error types for the chat service
//!
//! Defines application-level errors spanning transport, actor, and
//! persistence failures. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::storage::StorageError;
use crate::types::RoomId;

/// Application-level errors
///
/// Covers both fatal errors (connection termination) and
/// business errors (send error message to client).
#[derive(Debug, Error)]
pub enum ChatError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection disappeared mid-operation (fatal for that connection)
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation argument rejected by an actor, state unchanged
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted on a connection with no bound username
    #[error("No username bound to this connection")]
    NotAuthenticated,

    /// State store read or write failed
    #[error("Persistence failure: {0}")]
    Persistence(#[from] StorageError),

    /// The actor behind the given key could not be reached
    #[error("Actor unavailable for key {0}")]
    DirectoryUnavailable(String),
}

impl ChatError {
    /// The rejection for a non-positive room number
    pub(crate) fn invalid_room(room: RoomId) -> Self {
        Self::InvalidArgument(format!("room number must be positive, got {room}"))
    }

    /// A dead mailbox or dropped reply on an actor call
    pub(crate) fn unavailable(key: impl Into<String>) -> Self {
        Self::DirectoryUnavailable(key.into())
    }
}
