//! Shared store for communication between nodes.
//!
//! A [`SharedStore`] is a cheap-to-clone handle onto one key/value map. Every
//! clone sees the same data, so the same store can be handed to a flow run and
//! to every concurrent batch worker inside it. All operations take `&self` and
//! go through a single read/write lock, which makes each `get`/`set` atomic
//! with respect to every other one.

use crate::FlowError;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Well-known key a [`BatchNode`](crate::BatchNode) reads its input collection from.
pub const KEY_ITEMS: &str = "items";

/// Well-known key a [`BatchNode`](crate::BatchNode) writes its ordered results to.
pub const KEY_RESULTS: &str = "results";

/// Concurrency-safe key/value container passed through a flow run.
#[derive(Clone, Default)]
pub struct SharedStore {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl SharedStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store with room for `capacity` entries
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::with_capacity(capacity))),
        }
    }

    /// Sets a value, replacing whatever was stored under `key`.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner.write().insert(key.into(), value.into());
    }

    /// Gets a copy of the value stored under `key`.
    ///
    /// Returns `None` when the key was never set (or was removed).
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().get(key).cloned()
    }

    /// Removes a value, returning it if it existed.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.write().remove(key)
    }

    /// Checks if a key exists.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.read().contains_key(key)
    }

    /// Gets all keys, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Checks if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Clears all data.
    pub fn clear(&self) {
        self.inner.write().clear();
    }

    /// Copies the whole map out under one read lock.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.inner.read().clone()
    }

    /// Serializes `value` and stores it under `key`.
    pub fn set_serializable<T: Serialize>(
        &self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), FlowError> {
        let json_value = serde_json::to_value(value)?;
        self.set(key, json_value);
        Ok(())
    }

    /// Gets the value under `key` and deserializes it into `T`.
    ///
    /// `Ok(None)` means the key is absent; a value of the wrong shape is an error.
    pub fn get_deserializable<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, FlowError> {
        match self.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Like [`get_deserializable`](Self::get_deserializable) but a missing key
    /// is reported as [`FlowError::KeyNotFound`].
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T, FlowError> {
        self.get_deserializable(key)?
            .ok_or_else(|| FlowError::KeyNotFound(key.to_string()))
    }
}

impl fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedStore")
            .field("len", &self.len())
            .finish()
    }
}

impl From<HashMap<String, Value>> for SharedStore {
    fn from(map: HashMap<String, Value>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }
}
