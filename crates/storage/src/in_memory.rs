//! In-memory backend: useful for testing and ephemeral sessions.

use async_trait::async_trait;
use corvid_core::error::StorageError;
use corvid_core::storage::Storage;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Stores records in a sorted map keyed by the full key path.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    records: Arc<RwLock<BTreeMap<Vec<String>, serde_json::Value>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

fn owned(key: &[&str]) -> Vec<String> {
    key.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl Storage for InMemoryStorage {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn read(&self, key: &[&str]) -> Result<serde_json::Value, StorageError> {
        self.records
            .read()
            .await
            .get(&owned(key))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.join("/")))
    }

    async fn write(&self, key: &[&str], value: serde_json::Value) -> Result<(), StorageError> {
        self.records.write().await.insert(owned(key), value);
        Ok(())
    }

    async fn remove(&self, key: &[&str]) -> Result<(), StorageError> {
        self.records.write().await.remove(&owned(key));
        Ok(())
    }

    async fn list(&self, prefix: &[&str]) -> Result<Vec<Vec<String>>, StorageError> {
        let records = self.records.read().await;
        Ok(records
            .keys()
            .filter(|k| k.len() > prefix.len() && k.iter().zip(prefix).all(|(a, b)| a == b))
            .cloned()
            .collect())
    }
}
