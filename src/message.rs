//! Message protocol definitions
//!
//! The chat message value type plus the JSON-based bidirectional wire
//! protocol, using Serde's tagged enum for type-safe
//! serialization/deserialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::types::RoomId;

/// One posted chat message
///
/// Immutable once stored. The timestamp is assigned by the room actor that
/// appends the message, not by the sender, so ordering within a room is
/// decided in one place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Sender's username
    pub username: String,
    /// Sender's login count at the time of sending
    pub login_count: u32,
    /// Message text
    pub message: String,
    /// Assigned when the room stored the message
    pub timestamp: DateTime<Utc>,
}

/// Client → Server message
///
/// All messages from client to server. Uses tagged enum with snake_case naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Move to another numbered room
    ChangeRoom { room: i64 },
    /// Post a message to the current room
    SendMessage { text: String },
}

/// Server → Client message
///
/// All messages from server to client. Uses tagged enum with snake_case naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Another user joined the room
    UserJoined { username: String, login_count: u32 },
    /// Another user left the room
    UserLeft { username: String },
    /// A message was posted to the room
    ReceiveMessage { message: ChatMessage },
    /// The caller's room change completed, recent history included
    RoomChanged {
        room: RoomId,
        recent_messages: Vec<ChatMessage>,
    },
    /// Error occurred
    Error { code: ErrorCode, message: String },
}

/// Error codes for ServerMessage::Error
///
/// Represents different error scenarios that can be communicated to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// An operation argument was rejected (e.g. a non-positive room number)
    InvalidArgument,
    /// Attempted an operation before the connect protocol completed
    NotAuthenticated,
    /// The state store failed the operation
    PersistenceFailure,
    /// The actor owning the key could not be reached
    DirectoryUnavailable,
    /// Invalid message format
    InvalidMessage,
    /// Fatal errors with no dedicated code
    Internal,
}

/// Convert a gateway error to the ServerMessage rejection sent to the caller
impl From<&ChatError> for ServerMessage {
    fn from(err: &ChatError) -> Self {
        let code = match err {
            ChatError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            ChatError::NotAuthenticated => ErrorCode::NotAuthenticated,
            ChatError::Persistence(_) => ErrorCode::PersistenceFailure,
            ChatError::DirectoryUnavailable(_) => ErrorCode::DirectoryUnavailable,
            ChatError::Json(_) => ErrorCode::InvalidMessage,
            // Fatal errors are not typically converted (connection closes)
            _ => ErrorCode::Internal,
        };
        ServerMessage::Error {
            code,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_deserialize() {
        let json = r#"{"type": "change_room", "room": 3}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::ChangeRoom { room } => assert_eq!(room, 3),
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_server_message_serialize() {
        let msg = ServerMessage::UserJoined {
            username: "Alice".to_string(),
            login_count: 2,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"user_joined\""));
        assert!(json.contains("\"username\":\"Alice\""));
        assert!(json.contains("\"login_count\":2"));
    }

    #[test]
    fn test_error_code_serialize() {
        let msg = ServerMessage::Error {
            code: ErrorCode::InvalidArgument,
            message: "Test".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"code\":\"invalid_argument\""));
    }

    #[test]
    fn test_error_conversion_picks_matching_code() {
        let err = ChatError::NotAuthenticated;
        match ServerMessage::from(&err) {
            ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::NotAuthenticated),
            _ => panic!("Wrong variant"),
        }
    }
}
