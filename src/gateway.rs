//! Connection gateway
//!
//! Orchestrates the multi-actor protocols behind the client-facing events
//! (connect, disconnect, room change, message send) and fans the resulting
//! notifications out to every connection subscribed to the affected room.
//!
//! The gateway holds the only session-local state in the system: which
//! username each connection authenticated as, and which room group each
//! connection is subscribed to. Entity state lives in the actors; the
//! gateway reads and mutates it strictly through directory handles,
//! awaiting each reply before the next protocol step. The steps are not
//! transactional: a failure mid-protocol can leave presence and the user's
//! room assignment briefly inconsistent, which is accepted because
//! presence is volatile anyway.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::directory::Directory;
use crate::error::ChatError;
use crate::message::ServerMessage;
use crate::storage::StateStore;
use crate::types::{ConnectionId, RoomId};

/// How many messages of room history a completed room change reports back
const RECENT_HISTORY: i64 = 5;

/// One registered connection
///
/// `username` stays `None` until the connect protocol completes;
/// operations on an unbound connection are rejected with
/// `NotAuthenticated`.
#[derive(Debug)]
struct Connection {
    username: Option<String>,
    sender: mpsc::Sender<ServerMessage>,
}

/// The connection gateway
///
/// Shared across all connection handler tasks behind an `Arc`.
pub struct Gateway {
    directory: Directory,
    /// All registered connections: ConnectionId -> Connection
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    /// Room notification groups: RoomId -> subscribed connections
    groups: RwLock<HashMap<RoomId, HashSet<ConnectionId>>>,
}

impl Gateway {
    /// Create a gateway whose actors persist through the given store
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            directory: Directory::new(store),
            connections: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// The actor directory backing this gateway
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Register a freshly accepted connection and its outbound channel
    ///
    /// The connection stays unauthenticated until `on_connect` succeeds.
    pub async fn register(&self, connection_id: ConnectionId, sender: mpsc::Sender<ServerMessage>) {
        let mut connections = self.connections.write().await;
        connections.insert(
            connection_id,
            Connection {
                username: None,
                sender,
            },
        );
        debug!(
            "Connection {} registered ({} total)",
            connection_id,
            connections.len()
        );
    }

    /// Run the connect protocol for a registered connection
    ///
    /// Resolves the effective username (falling back to a name derived
    /// from the connection id), counts the login, joins the user's current
    /// room, subscribes the connection to that room's notifications, and
    /// tells the room's other subscribers. The username is bound to the
    /// connection only once all of that succeeded; on failure the caller
    /// is expected to close the connection.
    pub async fn on_connect(
        &self,
        connection_id: ConnectionId,
        raw_username: Option<String>,
    ) -> Result<(), ChatError> {
        let username = match raw_username.filter(|name| !name.is_empty()) {
            Some(name) => name,
            None => format!("User_{connection_id}"),
        };

        let user = self.directory.user(&username).await;
        user.increment_login_count().await?;
        let login_count = user.login_count().await?;
        let current_room = user.current_room().await?;

        self.directory
            .room(current_room)
            .await
            .user_joined(&username)
            .await?;
        self.subscribe(connection_id, current_room).await;
        self.bind_username(connection_id, &username).await?;

        self.broadcast(
            current_room,
            &ServerMessage::UserJoined {
                username: username.clone(),
                login_count,
            },
            Some(connection_id),
        )
        .await;

        info!(
            "User '{}' connected on {} into room {} (login #{})",
            username, connection_id, current_room, login_count
        );
        Ok(())
    }

    /// Tear down a connection
    ///
    /// Always drops the registration and every group subscription. When a
    /// username was bound (connect completed at some point), the user also
    /// leaves their current room and its remaining subscribers are told;
    /// otherwise nothing beyond the local cleanup happens.
    pub async fn on_disconnect(&self, connection_id: ConnectionId) -> Result<(), ChatError> {
        let username = {
            let mut connections = self.connections.write().await;
            connections
                .remove(&connection_id)
                .and_then(|connection| connection.username)
        };
        self.unsubscribe_all(connection_id).await;

        let Some(username) = username else {
            debug!("Connection {} closed before connecting", connection_id);
            return Ok(());
        };

        let user = self.directory.user(&username).await;
        let current_room = user.current_room().await?;
        self.directory
            .room(current_room)
            .await
            .user_left(&username)
            .await?;
        self.broadcast(
            current_room,
            &ServerMessage::UserLeft {
                username: username.clone(),
            },
            Some(connection_id),
        )
        .await;

        info!("User '{}' disconnected ({})", username, connection_id);
        Ok(())
    }

    /// Move a connection's user to another room
    ///
    /// A change to the room the user is already in is a silent no-op. The
    /// old room is left (and notified) before the new room number is
    /// validated and assigned, so an invalid number fails the operation
    /// after the leave already happened; the user recovers by changing
    /// rooms again or reconnecting.
    pub async fn change_room(
        &self,
        connection_id: ConnectionId,
        new_room: RoomId,
    ) -> Result<(), ChatError> {
        let username = self.bound_username(connection_id).await?;
        let user = self.directory.user(&username).await;
        let current_room = user.current_room().await?;

        if current_room == new_room {
            debug!(
                "User '{}' asked to change to their current room {}",
                username, new_room
            );
            return Ok(());
        }

        // Leave the old room first.
        self.directory
            .room(current_room)
            .await
            .user_left(&username)
            .await?;
        self.unsubscribe(connection_id, current_room).await;
        self.broadcast(
            current_room,
            &ServerMessage::UserLeft {
                username: username.clone(),
            },
            Some(connection_id),
        )
        .await;

        user.set_current_room(new_room).await?;
        let login_count = user.login_count().await?;

        let room = self.directory.room(new_room).await;
        room.user_joined(&username).await?;
        self.subscribe(connection_id, new_room).await;
        self.broadcast(
            new_room,
            &ServerMessage::UserJoined {
                username: username.clone(),
                login_count,
            },
            Some(connection_id),
        )
        .await;

        let recent_messages = room.recent_messages(RECENT_HISTORY).await?;
        self.send_to(
            connection_id,
            ServerMessage::RoomChanged {
                room: new_room,
                recent_messages,
            },
        )
        .await;

        info!(
            "User '{}' changed from room {} to room {}",
            username, current_room, new_room
        );
        Ok(())
    }

    /// Post a message from a connection's user to their current room
    ///
    /// The stored message, with its actor-assigned timestamp, is broadcast
    /// to every subscriber of the room, the sender included.
    pub async fn send_message(
        &self,
        connection_id: ConnectionId,
        text: String,
    ) -> Result<(), ChatError> {
        let username = self.bound_username(connection_id).await?;
        let user = self.directory.user(&username).await;
        let current_room = user.current_room().await?;
        let login_count = user.login_count().await?;

        let message = self
            .directory
            .room(current_room)
            .await
            .add_message(&username, &text, login_count)
            .await?;
        self.broadcast(
            current_room,
            &ServerMessage::ReceiveMessage { message },
            None,
        )
        .await;

        debug!("User '{}' posted to room {}", username, current_room);
        Ok(())
    }

    /// Bind a username to a registered connection
    async fn bind_username(
        &self,
        connection_id: ConnectionId,
        username: &str,
    ) -> Result<(), ChatError> {
        let mut connections = self.connections.write().await;
        match connections.get_mut(&connection_id) {
            Some(connection) => {
                connection.username = Some(username.to_string());
                Ok(())
            }
            None => Err(ChatError::ConnectionClosed),
        }
    }

    /// Username bound to a connection, or `NotAuthenticated`
    async fn bound_username(&self, connection_id: ConnectionId) -> Result<String, ChatError> {
        let connections = self.connections.read().await;
        connections
            .get(&connection_id)
            .and_then(|connection| connection.username.clone())
            .ok_or(ChatError::NotAuthenticated)
    }

    /// Subscribe a connection to a room's notifications
    async fn subscribe(&self, connection_id: ConnectionId, room: RoomId) {
        let mut groups = self.groups.write().await;
        groups.entry(room).or_default().insert(connection_id);
    }

    /// Drop a connection's subscription to one room
    async fn unsubscribe(&self, connection_id: ConnectionId, room: RoomId) {
        let mut groups = self.groups.write().await;
        if let Some(group) = groups.get_mut(&room) {
            group.remove(&connection_id);
            if group.is_empty() {
                groups.remove(&room);
            }
        }
    }

    /// Drop every subscription a connection holds
    async fn unsubscribe_all(&self, connection_id: ConnectionId) {
        let mut groups = self.groups.write().await;
        groups.retain(|_, group| {
            group.remove(&connection_id);
            !group.is_empty()
        });
    }

    /// Push a notification to every subscriber of a room except `exclude`
    ///
    /// Fire-and-forget per connection: a full outbound buffer drops that
    /// connection's copy, a closed channel drops the subscription itself.
    async fn broadcast(&self, room: RoomId, message: &ServerMessage, exclude: Option<ConnectionId>) {
        let targets: Vec<(ConnectionId, mpsc::Sender<ServerMessage>)> = {
            let groups = self.groups.read().await;
            let Some(group) = groups.get(&room) else {
                return;
            };
            let connections = self.connections.read().await;
            group
                .iter()
                .filter(|id| Some(**id) != exclude)
                .filter_map(|id| {
                    connections
                        .get(id)
                        .map(|connection| (*id, connection.sender.clone()))
                })
                .collect()
        };

        let mut stale = Vec::new();
        for (connection_id, sender) in targets {
            match sender.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!("Dropping notification for slow connection {}", connection_id);
                }
                Err(TrySendError::Closed(_)) => stale.push(connection_id),
            }
        }

        if !stale.is_empty() {
            let mut groups = self.groups.write().await;
            if let Some(group) = groups.get_mut(&room) {
                for connection_id in &stale {
                    group.remove(connection_id);
                }
                if group.is_empty() {
                    groups.remove(&room);
                }
            }
        }
    }

    /// Push to a single connection (fire-and-forget)
    async fn send_to(&self, connection_id: ConnectionId, message: ServerMessage) {
        let sender = {
            let connections = self.connections.read().await;
            connections
                .get(&connection_id)
                .map(|connection| connection.sender.clone())
        };
        if let Some(sender) = sender {
            if sender.try_send(message).is_err() {
                debug!("Dropping reply for connection {}", connection_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    /// A connected fake client: its connection id plus the receiving end
    /// of the outbound channel the server writes into
    struct TestClient {
        id: ConnectionId,
        rx: mpsc::Receiver<ServerMessage>,
    }

    impl TestClient {
        /// Everything pushed so far
        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(msg);
            }
            out
        }
    }

    fn gateway() -> Gateway {
        Gateway::new(Arc::new(MemoryStore::new()))
    }

    async fn register(gateway: &Gateway) -> TestClient {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(32);
        gateway.register(id, tx).await;
        TestClient { id, rx }
    }

    async fn connect(gateway: &Gateway, username: &str) -> TestClient {
        let client = register(gateway).await;
        gateway
            .on_connect(client.id, Some(username.to_string()))
            .await
            .unwrap();
        client
    }

    #[tokio::test]
    async fn test_connect_lands_in_default_room_and_notifies_others() {
        let gateway = gateway();
        let mut bob = connect(&gateway, "bob").await;
        let mut alice = connect(&gateway, "alice").await;

        // Bob, already in room 1, hears about alice
        let events = bob.drain();
        assert!(events.iter().any(|e| matches!(
            e,
            ServerMessage::UserJoined { username, login_count } if username == "alice" && *login_count == 1
        )));

        // Alice does not hear about herself
        assert!(alice.drain().is_empty());

        let user = gateway.directory().user("alice").await;
        assert_eq!(user.login_count().await.unwrap(), 1);
        assert_eq!(user.current_room().await.unwrap(), RoomId::DEFAULT);
        let room = gateway.directory().room(RoomId::DEFAULT).await;
        assert_eq!(room.user_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_missing_username_gets_generated_fallback() {
        let gateway = gateway();
        let mut bob = connect(&gateway, "bob").await;

        let anon = register(&gateway).await;
        gateway.on_connect(anon.id, None).await.unwrap();

        let events = bob.drain();
        let joined = events.iter().find_map(|e| match e {
            ServerMessage::UserJoined { username, .. } => Some(username.clone()),
            _ => None,
        });
        assert_eq!(joined, Some(format!("User_{}", anon.id)));
    }

    #[tokio::test]
    async fn test_send_message_reaches_everyone_including_sender() {
        let gateway = gateway();
        let mut alice = connect(&gateway, "alice").await;
        let mut bob = connect(&gateway, "bob").await;
        alice.drain();
        bob.drain();

        gateway.send_message(alice.id, "hello".to_string()).await.unwrap();

        for client in [&mut alice, &mut bob] {
            let events = client.drain();
            assert_eq!(events.len(), 1);
            match &events[0] {
                ServerMessage::ReceiveMessage { message } => {
                    assert_eq!(message.username, "alice");
                    assert_eq!(message.message, "hello");
                    assert_eq!(message.login_count, 1);
                }
                other => panic!("Unexpected event: {other:?}"),
            }
        }

        // And the room keeps it
        let room = gateway.directory().room(RoomId::DEFAULT).await;
        let history = room.recent_messages(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "hello");
    }

    #[tokio::test]
    async fn test_change_room_moves_user_and_reports_history() {
        let gateway = gateway();
        let mut alice = connect(&gateway, "alice").await;
        let mut bob = connect(&gateway, "bob").await;

        // Carol moves into room 2 while it is still empty and gets the
        // confirmation with no history
        let mut carol = connect(&gateway, "carol").await;
        gateway.change_room(carol.id, RoomId(2)).await.unwrap();
        let events = carol.drain();
        match events.last() {
            Some(ServerMessage::RoomChanged {
                room,
                recent_messages,
            }) => {
                assert_eq!(*room, RoomId(2));
                assert!(recent_messages.is_empty());
            }
            other => panic!("Unexpected event: {other:?}"),
        }

        gateway.send_message(carol.id, "welcome".to_string()).await.unwrap();
        alice.drain();
        bob.drain();
        carol.drain();

        gateway.change_room(alice.id, RoomId(2)).await.unwrap();

        // Bob, left behind in room 1, sees the leave
        let events = bob.drain();
        assert!(events.iter().any(|e| matches!(
            e,
            ServerMessage::UserLeft { username } if username == "alice"
        )));

        // Carol, in room 2, sees the join
        let events = carol.drain();
        assert!(events.iter().any(|e| matches!(
            e,
            ServerMessage::UserJoined { username, .. } if username == "alice"
        )));

        // Alice gets the confirmation with recent history
        let events = alice.drain();
        match events.last() {
            Some(ServerMessage::RoomChanged {
                room,
                recent_messages,
            }) => {
                assert_eq!(*room, RoomId(2));
                assert_eq!(recent_messages.len(), 1);
                assert_eq!(recent_messages[0].message, "welcome");
            }
            other => panic!("Unexpected event: {other:?}"),
        }

        assert_eq!(
            gateway.directory().user("alice").await.current_room().await.unwrap(),
            RoomId(2)
        );
        let room_one = gateway.directory().room(RoomId::DEFAULT).await;
        assert_eq!(room_one.user_count().await.unwrap(), 1);
        let room_two = gateway.directory().room(RoomId(2)).await;
        assert_eq!(room_two.user_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_change_to_current_room_is_a_silent_noop() {
        let gateway = gateway();
        let mut alice = connect(&gateway, "alice").await;
        let mut bob = connect(&gateway, "bob").await;
        alice.drain();
        bob.drain();

        gateway.change_room(alice.id, RoomId::DEFAULT).await.unwrap();

        assert!(alice.drain().is_empty());
        assert!(bob.drain().is_empty());
        let room = gateway.directory().room(RoomId::DEFAULT).await;
        assert_eq!(room.user_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_invalid_room_number_fails_after_leaving() {
        let gateway = gateway();
        let mut alice = connect(&gateway, "alice").await;
        let mut bob = connect(&gateway, "bob").await;
        alice.drain();
        bob.drain();

        let err = gateway.change_room(alice.id, RoomId(0)).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidArgument(_)));

        // The assignment is unchanged, but the old room was already left:
        // the documented non-transactional window
        assert_eq!(
            gateway.directory().user("alice").await.current_room().await.unwrap(),
            RoomId::DEFAULT
        );
        let events = bob.drain();
        assert!(events.iter().any(|e| matches!(
            e,
            ServerMessage::UserLeft { username } if username == "alice"
        )));
    }

    #[tokio::test]
    async fn test_failed_change_cuts_subscriber_off_until_a_real_move() {
        let gateway = gateway();
        let mut alice = connect(&gateway, "alice").await;
        let mut bob = connect(&gateway, "bob").await;
        alice.drain();
        bob.drain();

        gateway.change_room(alice.id, RoomId(0)).await.unwrap_err();
        alice.drain();
        bob.drain();

        // Alice is still assigned to room 1 but no longer subscribed to it
        gateway.send_message(bob.id, "anyone?".to_string()).await.unwrap();
        assert!(alice.drain().is_empty());

        // Changing to the room she is nominally in short-circuits, so the
        // subscription is not restored either
        gateway.change_room(alice.id, RoomId::DEFAULT).await.unwrap();
        gateway.send_message(bob.id, "still there?".to_string()).await.unwrap();
        assert!(alice.drain().is_empty());

        // An actual move re-subscribes
        gateway.change_room(alice.id, RoomId(2)).await.unwrap();
        alice.drain();
        gateway.send_message(alice.id, "made it".to_string()).await.unwrap();
        assert_eq!(alice.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_operations_before_connect_are_rejected() {
        let gateway = gateway();
        let client = register(&gateway).await;

        let err = gateway
            .send_message(client.id, "hi".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotAuthenticated));

        let err = gateway.change_room(client.id, RoomId(2)).await.unwrap_err();
        assert!(matches!(err, ChatError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_disconnect_notifies_remaining_subscribers() {
        let gateway = gateway();
        let alice = connect(&gateway, "alice").await;
        let mut bob = connect(&gateway, "bob").await;
        bob.drain();

        gateway.on_disconnect(alice.id).await.unwrap();

        let events = bob.drain();
        assert!(events.iter().any(|e| matches!(
            e,
            ServerMessage::UserLeft { username } if username == "alice"
        )));
        let room = gateway.directory().room(RoomId::DEFAULT).await;
        assert_eq!(room.user_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_is_silent() {
        let gateway = gateway();
        let mut bob = connect(&gateway, "bob").await;
        bob.drain();

        let client = register(&gateway).await;
        gateway.on_disconnect(client.id).await.unwrap();

        assert!(bob.drain().is_empty());
        let room = gateway.directory().room(RoomId::DEFAULT).await;
        assert_eq!(room.user_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_login_count_rises_across_reconnects() {
        let gateway = gateway();
        let mut bob = connect(&gateway, "bob").await;

        let alice = connect(&gateway, "alice").await;
        gateway.on_disconnect(alice.id).await.unwrap();
        let _alice_again = connect(&gateway, "alice").await;

        let counts: Vec<u32> = bob
            .drain()
            .iter()
            .filter_map(|e| match e {
                ServerMessage::UserJoined {
                    username,
                    login_count,
                } if username == "alice" => Some(*login_count),
                _ => None,
            })
            .collect();
        assert_eq!(counts, [1, 2]);
    }

    #[tokio::test]
    async fn test_broadcast_survives_a_dead_subscriber() {
        let gateway = gateway();
        let mut alice = connect(&gateway, "alice").await;
        let bob = connect(&gateway, "bob").await;
        let mut carol = connect(&gateway, "carol").await;
        alice.drain();
        carol.drain();

        // Bob's receiver goes away without a disconnect
        drop(bob);

        gateway.send_message(alice.id, "anyone there?".to_string()).await.unwrap();

        assert_eq!(alice.drain().len(), 1);
        assert_eq!(carol.drain().len(), 1);
    }
}
