//! User session actor
//!
//! One actor per username owns that user's login count and current room
//! assignment. The actor runs as its own task with a bounded mpsc mailbox,
//! so commands against the same user are processed one at a time; the actor
//! needs no locking and never calls into another actor.
//!
//! State is loaded from the store at activation and written through on
//! every mutation, before the reply is sent.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::error::ChatError;
use crate::storage::{load_json, save_json, user_key, StateStore};
use crate::types::RoomId;

/// Mailbox capacity for one user session actor
const MAILBOX_CAPACITY: usize = 64;

/// Persisted per-user state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserState {
    /// Completed connections, monotonically non-decreasing
    pub login_count: u32,
    /// Room the user is assigned to, always positive
    pub current_room: RoomId,
}

impl Default for UserState {
    fn default() -> Self {
        Self {
            login_count: 0,
            current_room: RoomId::DEFAULT,
        }
    }
}

/// Commands sent through a UserHandle to the session actor
#[derive(Debug)]
enum UserCommand {
    /// Read the login count
    GetLoginCount { reply: oneshot::Sender<u32> },
    /// Add one login and persist
    IncrementLoginCount {
        reply: oneshot::Sender<Result<(), ChatError>>,
    },
    /// Read the current room
    GetCurrentRoom { reply: oneshot::Sender<RoomId> },
    /// Assign a new room and persist
    SetCurrentRoom {
        room: RoomId,
        reply: oneshot::Sender<Result<(), ChatError>>,
    },
}

/// Handle to one user's session actor
///
/// Cheap to clone; every method is a request/response over the actor's
/// mailbox. A closed mailbox surfaces as `DirectoryUnavailable` and the
/// directory re-activates the actor on the next resolve.
#[derive(Debug, Clone)]
pub struct UserHandle {
    username: String,
    sender: mpsc::Sender<UserCommand>,
}

impl UserHandle {
    /// Read the current login count
    pub async fn login_count(&self) -> Result<u32, ChatError> {
        self.call(|reply| UserCommand::GetLoginCount { reply }).await
    }

    /// Increment the login count by exactly one and persist
    ///
    /// Not idempotent: retrying after an ambiguous failure increments again.
    pub async fn increment_login_count(&self) -> Result<(), ChatError> {
        self.call(|reply| UserCommand::IncrementLoginCount { reply })
            .await?
    }

    /// Read the room the user is currently assigned to
    pub async fn current_room(&self) -> Result<RoomId, ChatError> {
        self.call(|reply| UserCommand::GetCurrentRoom { reply }).await
    }

    /// Assign a new room and persist
    ///
    /// Rejects a non-positive room number with `InvalidArgument`, leaving
    /// state untouched. Callers are responsible for short-circuiting a
    /// change to the room the user is already in.
    pub async fn set_current_room(&self, room: RoomId) -> Result<(), ChatError> {
        self.call(|reply| UserCommand::SetCurrentRoom { room, reply })
            .await?
    }

    /// Whether the actor behind this handle has stopped
    pub(crate) fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Send one command and wait for its reply
    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> UserCommand,
    ) -> Result<T, ChatError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(command(reply))
            .await
            .map_err(|_| ChatError::unavailable(user_key(&self.username)))?;
        rx.await
            .map_err(|_| ChatError::unavailable(user_key(&self.username)))
    }
}

/// Activate the session actor for one username
///
/// State is loaded inside the spawned task; commands sent before the load
/// completes wait in the mailbox. A failed load stops the actor, which
/// fails pending calls with `DirectoryUnavailable`.
pub(crate) fn spawn(username: &str, store: Arc<dyn StateStore>) -> UserHandle {
    let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);
    let handle = UserHandle {
        username: username.to_string(),
        sender,
    };
    let username = username.to_string();

    tokio::spawn(async move {
        let state: UserState = match load_json(store.as_ref(), &user_key(&username)).await {
            Ok(state) => state,
            Err(e) => {
                error!("Failed to activate user actor '{}': {}", username, e);
                return;
            }
        };
        debug!(
            "User actor '{}' activated (logins: {}, room: {})",
            username, state.login_count, state.current_room
        );

        let actor = UserActor {
            username,
            state,
            store,
            receiver,
        };
        actor.run().await;
    });

    handle
}

/// The user session actor
struct UserActor {
    username: String,
    state: UserState,
    store: Arc<dyn StateStore>,
    receiver: mpsc::Receiver<UserCommand>,
}

impl UserActor {
    /// Run the actor event loop until every handle is dropped
    async fn run(mut self) {
        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd).await;
        }
        debug!("User actor '{}' stopped", self.username);
    }

    /// Process a single command
    async fn handle_command(&mut self, cmd: UserCommand) {
        match cmd {
            UserCommand::GetLoginCount { reply } => {
                let _ = reply.send(self.state.login_count);
            }
            UserCommand::IncrementLoginCount { reply } => {
                let _ = reply.send(self.increment_login_count().await);
            }
            UserCommand::GetCurrentRoom { reply } => {
                let _ = reply.send(self.state.current_room);
            }
            UserCommand::SetCurrentRoom { room, reply } => {
                let _ = reply.send(self.set_current_room(room).await);
            }
        }
    }

    async fn increment_login_count(&mut self) -> Result<(), ChatError> {
        self.state.login_count += 1;
        self.persist().await?;
        info!(
            "User '{}' login count is now {}",
            self.username, self.state.login_count
        );
        Ok(())
    }

    async fn set_current_room(&mut self, room: RoomId) -> Result<(), ChatError> {
        if !room.is_valid() {
            return Err(ChatError::invalid_room(room));
        }
        let old_room = self.state.current_room;
        self.state.current_room = room;
        self.persist().await?;
        info!(
            "User '{}' moved from room {} to room {}",
            self.username, old_room, room
        );
        Ok(())
    }

    /// Write state through to the store
    ///
    /// The in-memory mutation is kept even when the write fails; the next
    /// successful write reconciles by overwriting the whole state.
    async fn persist(&self) -> Result<(), ChatError> {
        save_json(self.store.as_ref(), &user_key(&self.username), &self.state)
            .await
            .map_err(ChatError::from)
    }
}
