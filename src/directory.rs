//! Actor directory
//!
//! Resolves a stable key, username or room number, to the live handle for
//! that entity's actor, activating the actor lazily on first reference.
//! One task per key with its own mailbox gives the single-writer
//! guarantee: no two commands against the same key run concurrently, while
//! commands against different keys proceed in parallel.
//!
//! There is no idle eviction; an actor stays active for the process
//! lifetime. An actor whose task has stopped (for example after a failed
//! activation load) is re-activated on the next resolve.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::room::{self, RoomHandle};
use crate::storage::StateStore;
use crate::types::RoomId;
use crate::user::{self, UserHandle};

/// Directory of live actor handles, keyed by entity
pub struct Directory {
    store: Arc<dyn StateStore>,
    users: Mutex<HashMap<String, UserHandle>>,
    rooms: Mutex<HashMap<RoomId, RoomHandle>>,
}

impl Directory {
    /// Create a directory whose actors persist through the given store
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            users: Mutex::new(HashMap::new()),
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Handle for the session actor owning `username`, activating it if
    /// needed
    pub async fn user(&self, username: &str) -> UserHandle {
        let mut users = self.users.lock().await;
        match users.get(username) {
            Some(handle) if !handle.is_closed() => handle.clone(),
            _ => {
                let handle = user::spawn(username, self.store.clone());
                users.insert(username.to_string(), handle.clone());
                handle
            }
        }
    }

    /// Handle for the actor owning `room`, activating it if needed
    pub async fn room(&self, room: RoomId) -> RoomHandle {
        let mut rooms = self.rooms.lock().await;
        match rooms.get(&room) {
            Some(handle) if !handle.is_closed() => handle.clone(),
            _ => {
                let handle = room::spawn(room, self.store.clone());
                rooms.insert(room, handle.clone());
                handle
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn directory() -> Directory {
        Directory::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_same_username_resolves_to_same_actor() {
        let directory = directory();

        let first = directory.user("alice").await;
        first.increment_login_count().await.unwrap();

        // A second resolve observes the same state
        let second = directory.user("alice").await;
        assert_eq!(second.login_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_distinct_usernames_are_distinct_actors() {
        let directory = directory();

        directory.user("alice").await.increment_login_count().await.unwrap();
        assert_eq!(directory.user("bob").await.login_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_same_room_resolves_to_same_actor() {
        let directory = directory();

        directory.room(RoomId(2)).await.user_joined("alice").await.unwrap();
        assert_eq!(directory.room(RoomId(2)).await.user_count().await.unwrap(), 1);
        assert_eq!(directory.room(RoomId(3)).await.user_count().await.unwrap(), 0);
    }
}
