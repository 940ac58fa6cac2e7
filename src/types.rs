//! Basic type definitions for the chat service
//!
//! Provides newtype wrappers for type safety:
//! - `ConnectionId`: UUID-based unique connection identifier
//! - `RoomId`: numeric room key

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique connection identifier (newtype pattern)
///
/// Wraps a UUID v4 for type-safe identification of one WebSocket
/// connection. Implements Hash and Eq for use as HashMap keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric room key
///
/// Rooms are addressed by number and every user starts out in room 1.
/// The wrapper accepts any i64 so that a non-positive number can travel to
/// the user session actor, which rejects it; validity is an actor-level
/// contract, not a construction-time one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub i64);

impl RoomId {
    /// The room every new user starts in
    pub const DEFAULT: RoomId = RoomId(1);

    /// Whether this is a usable (positive) room number
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_default_room_is_valid() {
        assert_eq!(RoomId::DEFAULT, RoomId(1));
        assert!(RoomId::DEFAULT.is_valid());
    }

    #[test]
    fn test_non_positive_rooms_are_invalid() {
        assert!(!RoomId(0).is_valid());
        assert!(!RoomId(-5).is_valid());
        assert!(RoomId(42).is_valid());
    }

    #[test]
    fn test_room_id_serializes_as_bare_number() {
        let json = serde_json::to_string(&RoomId(7)).unwrap();
        assert_eq!(json, "7");
        let back: RoomId = serde_json::from_str("7").unwrap();
        assert_eq!(back, RoomId(7));
    }
}
