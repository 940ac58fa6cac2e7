//! Room actor
//!
//! One actor per numbered room owns that room's message history and the set
//! of usernames currently present. History is persisted with a fixed
//! capacity, oldest messages evicted first. Presence is volatile: the set
//! starts empty at every activation, so it does not survive a restart even
//! though the history does.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::error::ChatError;
use crate::message::ChatMessage;
use crate::storage::{load_json, room_key, save_json, StateStore};
use crate::types::RoomId;

/// Mailbox capacity for one room actor
const MAILBOX_CAPACITY: usize = 64;

/// Maximum number of messages retained per room
pub const MAX_HISTORY: usize = 100;

/// Persisted per-room state
///
/// The deque is kept ascending by timestamp (ties keep insertion order),
/// so the front is always the oldest message and eviction pops the front.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomState {
    messages: VecDeque<ChatMessage>,
}

/// Commands sent through a RoomHandle to the room actor
#[derive(Debug)]
enum RoomCommand {
    /// Read the most recent messages
    GetRecentMessages {
        count: i64,
        reply: oneshot::Sender<Vec<ChatMessage>>,
    },
    /// Append a message, trim, persist
    AddMessage {
        username: String,
        message: String,
        login_count: u32,
        reply: oneshot::Sender<Result<ChatMessage, ChatError>>,
    },
    /// Read how many users are present
    GetUserCount { reply: oneshot::Sender<usize> },
    /// Record a username as present
    UserJoined {
        username: String,
        reply: oneshot::Sender<()>,
    },
    /// Record a username as gone
    UserLeft {
        username: String,
        reply: oneshot::Sender<()>,
    },
}

/// Handle to one room's actor
///
/// Cheap to clone; every method is a request/response over the actor's
/// mailbox. A closed mailbox surfaces as `DirectoryUnavailable` and the
/// directory re-activates the actor on the next resolve.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    room: RoomId,
    sender: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    /// The `count` most recent messages, ascending by timestamp
    ///
    /// Returns everything the room holds when it has fewer than `count`
    /// messages; a non-positive `count` returns an empty list.
    pub async fn recent_messages(&self, count: i64) -> Result<Vec<ChatMessage>, ChatError> {
        self.call(|reply| RoomCommand::GetRecentMessages { count, reply })
            .await
    }

    /// Append a message with an actor-assigned timestamp, trim the history
    /// to capacity, persist, and return the stored message
    ///
    /// Not idempotent: retrying after an ambiguous failure appends again.
    pub async fn add_message(
        &self,
        username: &str,
        message: &str,
        login_count: u32,
    ) -> Result<ChatMessage, ChatError> {
        self.call(|reply| RoomCommand::AddMessage {
            username: username.to_string(),
            message: message.to_string(),
            login_count,
            reply,
        })
        .await?
    }

    /// Number of usernames currently present (volatile)
    pub async fn user_count(&self) -> Result<usize, ChatError> {
        self.call(|reply| RoomCommand::GetUserCount { reply }).await
    }

    /// Record a username as present; already present is a no-op
    pub async fn user_joined(&self, username: &str) -> Result<(), ChatError> {
        self.call(|reply| RoomCommand::UserJoined {
            username: username.to_string(),
            reply,
        })
        .await
    }

    /// Record a username as gone; not present is a no-op, never an error
    pub async fn user_left(&self, username: &str) -> Result<(), ChatError> {
        self.call(|reply| RoomCommand::UserLeft {
            username: username.to_string(),
            reply,
        })
        .await
    }

    /// Whether the actor behind this handle has stopped
    pub(crate) fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Send one command and wait for its reply
    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<T, ChatError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(command(reply))
            .await
            .map_err(|_| ChatError::unavailable(room_key(self.room)))?;
        rx.await
            .map_err(|_| ChatError::unavailable(room_key(self.room)))
    }
}

/// Activate the actor for one room
///
/// History is loaded inside the spawned task; commands sent before the
/// load completes wait in the mailbox. A failed load stops the actor,
/// which fails pending calls with `DirectoryUnavailable`.
pub(crate) fn spawn(room: RoomId, store: Arc<dyn StateStore>) -> RoomHandle {
    let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);
    let handle = RoomHandle { room, sender };

    tokio::spawn(async move {
        let mut state: RoomState = match load_json(store.as_ref(), &room_key(room)).await {
            Ok(state) => state,
            Err(e) => {
                error!("Failed to activate room actor {}: {}", room, e);
                return;
            }
        };
        // Restore the ascending order in case the backend handed the
        // history back unordered. Stable, so equal timestamps keep their
        // stored order.
        state.messages.make_contiguous().sort_by_key(|m| m.timestamp);
        debug!(
            "Room actor {} activated with {} messages",
            room,
            state.messages.len()
        );

        let actor = RoomActor {
            room,
            state,
            members: HashSet::new(),
            store,
            receiver,
        };
        actor.run().await;
    });

    handle
}

/// The room actor
struct RoomActor {
    room: RoomId,
    state: RoomState,
    /// Present usernames; intentionally not persisted, so presence resets
    /// to empty at every activation
    members: HashSet<String>,
    store: Arc<dyn StateStore>,
    receiver: mpsc::Receiver<RoomCommand>,
}

impl RoomActor {
    /// Run the actor event loop until every handle is dropped
    async fn run(mut self) {
        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd).await;
        }
        debug!("Room actor {} stopped", self.room);
    }

    /// Process a single command
    async fn handle_command(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::GetRecentMessages { count, reply } => {
                let _ = reply.send(self.recent_messages(count));
            }
            RoomCommand::AddMessage {
                username,
                message,
                login_count,
                reply,
            } => {
                let _ = reply.send(self.add_message(username, message, login_count).await);
            }
            RoomCommand::GetUserCount { reply } => {
                let _ = reply.send(self.members.len());
            }
            RoomCommand::UserJoined { username, reply } => {
                self.members.insert(username.clone());
                info!("User '{}' joined room {}", username, self.room);
                let _ = reply.send(());
            }
            RoomCommand::UserLeft { username, reply } => {
                self.members.remove(&username);
                info!("User '{}' left room {}", username, self.room);
                let _ = reply.send(());
            }
        }
    }

    fn recent_messages(&self, count: i64) -> Vec<ChatMessage> {
        if count <= 0 {
            return Vec::new();
        }
        let take = (count as usize).min(self.state.messages.len());
        let start = self.state.messages.len() - take;
        self.state.messages.iter().skip(start).cloned().collect()
    }

    async fn add_message(
        &mut self,
        username: String,
        message: String,
        login_count: u32,
    ) -> Result<ChatMessage, ChatError> {
        // Timestamps never run backwards within a room: clamp against the
        // newest stored message in case the wall clock was adjusted.
        let timestamp = match self.state.messages.back() {
            Some(last) => Utc::now().max(last.timestamp),
            None => Utc::now(),
        };
        let chat_message = ChatMessage {
            username,
            login_count,
            message,
            timestamp,
        };

        self.state.messages.push_back(chat_message.clone());
        while self.state.messages.len() > MAX_HISTORY {
            self.state.messages.pop_front();
        }

        // One write per append, after trimming.
        save_json(self.store.as_ref(), &room_key(self.room), &self.state).await?;

        info!(
            "Message stored in room {} from '{}' ({} total)",
            self.room,
            chat_message.username,
            self.state.messages.len()
        );
        Ok(chat_message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn test_add_message_returns_stored_message() {
        let room = spawn(RoomId(1), store());
        let stored = room.add_message("alice", "hello", 3).await.unwrap();
        assert_eq!(stored.username, "alice");
        assert_eq!(stored.message, "hello");
        assert_eq!(stored.login_count, 3);
    }

    #[tokio::test]
    async fn test_recent_messages_ascending_and_bounded() {
        let room = spawn(RoomId(1), store());
        for i in 0..10 {
            room.add_message("alice", &format!("msg-{i}"), 1).await.unwrap();
        }

        let last_three = room.recent_messages(3).await.unwrap();
        let texts: Vec<&str> = last_three.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(texts, ["msg-7", "msg-8", "msg-9"]);
        assert!(last_three.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        // Fewer messages than asked for: return all of them
        let all = room.recent_messages(50).await.unwrap();
        assert_eq!(all.len(), 10);
    }

    #[tokio::test]
    async fn test_recent_messages_non_positive_count_is_empty() {
        let room = spawn(RoomId(1), store());
        room.add_message("alice", "hello", 1).await.unwrap();

        assert!(room.recent_messages(0).await.unwrap().is_empty());
        assert!(room.recent_messages(-5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_capped_at_oldest_evicted() {
        let room = spawn(RoomId(1), store());
        for i in 0..105 {
            room.add_message("alice", &format!("msg-{i}"), 1).await.unwrap();
        }

        let all = room.recent_messages(200).await.unwrap();
        assert_eq!(all.len(), MAX_HISTORY);
        assert_eq!(all.first().unwrap().message, "msg-5");
        assert_eq!(all.last().unwrap().message, "msg-104");
    }

    #[tokio::test]
    async fn test_timestamps_non_decreasing() {
        let room = spawn(RoomId(1), store());
        for i in 0..20 {
            room.add_message("alice", &format!("msg-{i}"), 1).await.unwrap();
        }
        let all = room.recent_messages(20).await.unwrap();
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_join_and_leave_are_idempotent() {
        let room = spawn(RoomId(1), store());

        room.user_joined("alice").await.unwrap();
        room.user_joined("alice").await.unwrap();
        assert_eq!(room.user_count().await.unwrap(), 1);

        room.user_left("alice").await.unwrap();
        room.user_left("alice").await.unwrap();
        assert_eq!(room.user_count().await.unwrap(), 0);

        // Leaving a room you never joined is fine too
        room.user_left("ghost").await.unwrap();
        assert_eq!(room.user_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_history_durable_but_presence_volatile() {
        let store = store();

        let room = spawn(RoomId(7), store.clone());
        room.add_message("alice", "one", 1).await.unwrap();
        room.add_message("alice", "two", 1).await.unwrap();
        room.user_joined("alice").await.unwrap();
        assert_eq!(room.user_count().await.unwrap(), 1);
        drop(room);

        let revived = spawn(RoomId(7), store);
        let history = revived.recent_messages(10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message, "one");
        // The join did not survive, only the messages did
        assert_eq!(revived.user_count().await.unwrap(), 0);
    }
}
