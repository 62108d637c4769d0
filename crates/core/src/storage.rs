//! Storage trait: durable JSON records addressed by key path.
//!
//! Keys look like `["message", session_id, message_id]`. A write replaces the
//! whole record, so a concurrent reader observes either the old or the new
//! value, never a mix.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StorageError;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Read one record. Missing keys yield `StorageError::NotFound`.
    async fn read(&self, key: &[&str]) -> Result<serde_json::Value, StorageError>;

    /// Replace one record.
    async fn write(&self, key: &[&str], value: serde_json::Value) -> Result<(), StorageError>;

    /// Remove one record. Removing a missing key is not an error.
    async fn remove(&self, key: &[&str]) -> Result<(), StorageError>;

    /// List the keys directly or transitively under `prefix`, sorted.
    async fn list(&self, prefix: &[&str]) -> Result<Vec<Vec<String>>, StorageError>;
}

/// Typed helpers over any [`Storage`].
#[async_trait]
pub trait StorageExt: Storage {
    async fn read_as<T: DeserializeOwned>(&self, key: &[&str]) -> Result<T, StorageError> {
        let value = self.read(key).await?;
        serde_json::from_value(value).map_err(|e| StorageError::Corrupt {
            key: key.join("/"),
            reason: e.to_string(),
        })
    }

    async fn write_as<T: Serialize + Sync>(&self, key: &[&str], value: &T) -> Result<(), StorageError> {
        let json = serde_json::to_value(value).map_err(|e| StorageError::Corrupt {
            key: key.join("/"),
            reason: e.to_string(),
        })?;
        self.write(key, json).await
    }
}

impl<S: Storage + ?Sized> StorageExt for S {}
