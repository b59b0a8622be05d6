//! The pluggable key-value store the engine persists through. The concrete
//! backend (on-disk, RocksDB, browser storage, ...) is an external
//! collaborator; this module only defines the trait and an in-memory test
//! double, following the shape of `witnet_wallet::db::Database`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::StorageError;

pub type Result<T> = std::result::Result<T, StorageError>;

/// A named-blob key-value store. Durability is only guaranteed after
/// [`Storage::write`] returns; `put` may buffer.
pub trait Storage {
    fn get_opt<V>(&self, key: &str) -> Result<Option<V>>
    where
        V: DeserializeOwned;

    fn get<V>(&self, key: &str) -> Result<V>
    where
        V: DeserializeOwned,
    {
        self.get_opt(key)?
            .ok_or_else(|| StorageError::KeyNotFound(key.to_string()))
    }

    fn get_or_default<V>(&self, key: &str) -> Result<V>
    where
        V: DeserializeOwned + Default,
    {
        Ok(self.get_opt(key)?.unwrap_or_default())
    }

    fn put<V>(&self, key: &str, value: &V) -> Result<()>
    where
        V: Serialize;

    /// Flush buffered writes to durable storage.
    fn write(&self) -> Result<()>;
}

impl<T: Storage + ?Sized> Storage for Arc<T> {
    fn get_opt<V>(&self, key: &str) -> Result<Option<V>>
    where
        V: DeserializeOwned,
    {
        (**self).get_opt(key)
    }

    fn put<V>(&self, key: &str, value: &V) -> Result<()>
    where
        V: Serialize,
    {
        (**self).put(key, value)
    }

    fn write(&self) -> Result<()> {
        (**self).write()
    }
}

/// A process-local [`Storage`] backed by a `HashMap`, used by tests and as a
/// reference implementation.
#[derive(Default)]
pub struct InMemoryStorage {
    values: Mutex<HashMap<String, serde_json::Value>>,
    flushes: Mutex<u64>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times [`Storage::write`] has been called; exposed for tests
    /// that assert the engine actually flushes on the expected transitions.
    pub fn flush_count(&self) -> u64 {
        *self.flushes.lock().unwrap()
    }
}

impl Storage for InMemoryStorage {
    fn get_opt<V>(&self, key: &str) -> Result<Option<V>>
    where
        V: DeserializeOwned,
    {
        let values = self.values.lock().unwrap();
        match values.get(key) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    fn put<V>(&self, key: &str, value: &V) -> Result<()>
    where
        V: Serialize,
    {
        let json = serde_json::to_value(value)?;
        self.values.lock().unwrap().insert(key.to_string(), json);
        Ok(())
    }

    fn write(&self) -> Result<()> {
        *self.flushes.lock().unwrap() += 1;
        Ok(())
    }
}
