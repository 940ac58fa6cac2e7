//! Durable state for the actors
//!
//! Actor state is stored as opaque JSON bytes behind the `StateStore`
//! trait; typed access goes through `load_json`/`save_json`. The in-memory
//! implementation backs the server binary and the tests, and a durable
//! backend (disk, Redis) can plug in behind the same trait.
//!
//! Each actor is the single writer for its own key, so the store needs no
//! per-key concurrency control of its own.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::types::RoomId;

/// State store errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend rejected or failed the read/write
    #[error("Store backend error: {0}")]
    Backend(String),

    /// Stored bytes could not be serialized or deserialized
    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Storage key for a user session actor's state
pub fn user_key(username: &str) -> String {
    format!("user:{username}")
}

/// Storage key for a room actor's state
pub fn room_key(room: RoomId) -> String {
    format!("room:{room}")
}

/// Durable key-value storage for actor state
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the stored bytes for a key; `None` if the key was never written
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Overwrite the stored bytes for a key
    async fn save(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;
}

/// Load and deserialize a stored value, falling back to its default when
/// the key has never been written
pub async fn load_json<T>(store: &dyn StateStore, key: &str) -> Result<T, StorageError>
where
    T: DeserializeOwned + Default,
{
    match store.load(key).await? {
        Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
        None => Ok(T::default()),
    }
}

/// Serialize and store a value under a key
pub async fn save_json<T>(store: &dyn StateStore, key: &str, value: &T) -> Result<(), StorageError>
where
    T: Serialize + Sync,
{
    let bytes = serde_json::to_vec(value)?;
    store.save(key, bytes).await
}

/// In-memory state store
///
/// Everything lives in a HashMap and nothing survives the process, which
/// is exactly what the single-process server and the tests want.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    async fn save(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }
}
