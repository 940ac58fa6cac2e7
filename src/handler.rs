//! WebSocket connection handler
//!
//! Handles individual client connections: WebSocket handshake (capturing
//! the optional `username` query parameter), the connect protocol, and
//! bidirectional communication with the gateway.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::ChatError;
use crate::gateway::Gateway;
use crate::message::{ClientMessage, ServerMessage};
use crate::types::{ConnectionId, RoomId};

/// Outbound buffer per connection; a full buffer drops notifications for
/// that connection instead of stalling the room
const OUTBOUND_BUFFER: usize = 32;

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake, runs the connect protocol, sets up
/// bidirectional communication, and manages the connection lifecycle.
pub async fn handle_connection(stream: TcpStream, gateway: Arc<Gateway>) -> Result<(), ChatError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    // WebSocket handshake; the callback sees the upgrade request, which is
    // the only place the username query parameter is visible.
    let mut raw_username = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| {
            raw_username = request.uri().query().and_then(username_from_query);
            Ok(response)
        },
    )
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let connection_id = ConnectionId::new();
    info!("Connection {} opened from {}", connection_id, peer_addr);

    // Create channel for gateway -> client messages
    let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER);

    gateway.register(connection_id, msg_tx.clone()).await;

    // Run the connect protocol before accepting any traffic
    if let Err(e) = gateway.on_connect(connection_id, raw_username).await {
        error!("Connect failed for {}: {}", connection_id, e);
        let _ = gateway.on_disconnect(connection_id).await;
        let _ = ws_sender.close().await;
        return Err(e);
    }

    // Spawn read task (WebSocket -> gateway operations)
    let read_gateway = gateway.clone();
    let reply_tx = msg_tx;
    let read_task = tokio::spawn(async move {
        while let Some(msg_result) = ws_receiver.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(client_msg) => {
                            if let Err(e) =
                                dispatch(&read_gateway, connection_id, client_msg).await
                            {
                                warn!("Operation failed for {}: {}", connection_id, e);
                                let _ = reply_tx.try_send(ServerMessage::from(&e));
                            }
                        }
                        Err(e) => {
                            warn!("Invalid JSON from {}: {}", connection_id, e);
                            let _ = reply_tx.try_send(ServerMessage::from(&ChatError::Json(e)));
                        }
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!("Connection {} sent close frame", connection_id);
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    // Pong replies are handled automatically by tungstenite
                }
                Ok(_) => {
                    // Binary or other message types - ignore
                }
                Err(e) => {
                    error!("WebSocket error for {}: {}", connection_id, e);
                    break;
                }
            }
        }
        debug!("Read task ended for {}", connection_id);
    });

    // Spawn write task (ServerMessage -> WebSocket)
    let write_task = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        debug!("WebSocket send failed, ending write task");
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    // Continue - don't break on serialization errors
                }
            }
        }
        debug!("Write task ended for {}", connection_id);

        // Send close frame when done
        let _ = ws_sender.close().await;
    });

    // Wait for either task to complete
    tokio::select! {
        _ = read_task => {
            debug!("Read task completed for {}", connection_id);
        }
        _ = write_task => {
            debug!("Write task completed for {}", connection_id);
        }
    }

    // Tear the session down; remaining subscribers get the leave
    if let Err(e) = gateway.on_disconnect(connection_id).await {
        warn!("Disconnect cleanup failed for {}: {}", connection_id, e);
    }

    info!("Connection {} closed", connection_id);

    Ok(())
}

/// Route one parsed client message to the matching gateway operation
async fn dispatch(
    gateway: &Gateway,
    connection_id: ConnectionId,
    msg: ClientMessage,
) -> Result<(), ChatError> {
    match msg {
        ClientMessage::ChangeRoom { room } => gateway.change_room(connection_id, RoomId(room)).await,
        ClientMessage::SendMessage { text } => gateway.send_message(connection_id, text).await,
    }
}

/// Extract a non-empty `username` value from a raw query string
fn username_from_query(query: &str) -> Option<String> {
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key == "username" && !value.is_empty() {
            return Some(value.into_owned());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username_from_query() {
        assert_eq!(username_from_query("username=alice"), Some("alice".to_string()));
        assert_eq!(
            username_from_query("foo=1&username=bob"),
            Some("bob".to_string())
        );
    }

    #[test]
    fn test_username_from_query_decodes_encoding() {
        assert_eq!(
            username_from_query("username=bob%20jr"),
            Some("bob jr".to_string())
        );
        assert_eq!(username_from_query("username=a+b"), Some("a b".to_string()));
    }

    #[test]
    fn test_username_from_query_rejects_empty() {
        assert_eq!(username_from_query("username="), None);
        assert_eq!(username_from_query("other=x"), None);
        assert_eq!(username_from_query(""), None);
    }
}
