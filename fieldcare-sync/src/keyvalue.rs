//! Durable key/value collaborator used for watermarks and preferences

use crate::error::SyncResult;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> SyncResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> SyncResult<()>;

    async fn remove(&self, key: &str) -> SyncResult<()>;

    /// Remove every key starting with `prefix`
    async fn remove_prefix(&self, prefix: &str) -> SyncResult<()>;
}

/// Volatile key/value store
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> SyncResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> SyncResult<()> {
        self.entries.write().retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }
}
