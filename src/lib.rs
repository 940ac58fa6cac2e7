//! Actor-based Group Chat Service Library
//!
//! A multi-room WebSocket chat service where every user and every room is
//! its own actor, built with tokio-tungstenite.
//!
//! # Features
//! - WebSocket connection handling with a `username` query parameter
//! - Per-user login counting and room assignment, persisted
//! - Numbered rooms with capped, persisted message history
//! - Real-time join/leave/message notifications per room
//! - Recent-history replay on room change
//! - Disconnection handling
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - A `user` actor owns one user's login count and room assignment
//! - A `room` actor owns one room's history and volatile presence
//! - The `Directory` activates actors lazily, one task per key, so
//!   commands against the same key never run concurrently
//! - The `Gateway` orchestrates the connect/disconnect/change-room/
//!   send-message protocols and fans notifications out per room
//! - `StateStore` is the persistence seam; actor state loads at
//!   activation and writes through on every mutation
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use roomchat::{handle_connection, Gateway, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     let gateway = Arc::new(Gateway::new(Arc::new(MemoryStore::new())));
//!
//!     while let Ok((stream, _)) = listener.accept().await {
//!         tokio::spawn(handle_connection(stream, gateway.clone()));
//!     }
//! }
//! ```

pub mod directory;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod message;
pub mod room;
pub mod storage;
pub mod types;
pub mod user;

// Re-export main types for convenience
pub use directory::Directory;
pub use error::ChatError;
pub use gateway::Gateway;
pub use handler::handle_connection;
pub use message::{ChatMessage, ClientMessage, ErrorCode, ServerMessage};
pub use room::{RoomHandle, MAX_HISTORY};
pub use storage::{MemoryStore, StateStore, StorageError};
pub use types::{ConnectionId, RoomId};
pub use user::{UserHandle, UserState};
