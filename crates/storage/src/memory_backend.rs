//! In-memory storage backend for tests and ephemeral sessions.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{CheckpointRecord, StorageBackend, StorageError};

#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Option<serde_json::Value>,
    checkpoints: HashMap<String, (serde_json::Value, serde_json::Value)>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed saves is not tracked; tests that need to observe
    /// persistence inspect the blob directly.
    pub fn peek_state(&self) -> Option<serde_json::Value> {
        self.inner.lock().expect("storage mutex poisoned").state.clone()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn load(&self) -> Result<Option<serde_json::Value>, StorageError> {
        Ok(self.inner.lock().expect("storage mutex poisoned").state.clone())
    }

    async fn save(&self, blob: &serde_json::Value) -> Result<(), StorageError> {
        self.inner.lock().expect("storage mutex poisoned").state = Some(blob.clone());
        Ok(())
    }

    async fn list_checkpoints(&self) -> Result<Vec<serde_json::Value>, StorageError> {
        let inner = self.inner.lock().expect("storage mutex poisoned");
        Ok(inner.checkpoints.values().map(|(meta, _)| meta.clone()).collect())
    }

    async fn get_checkpoint(&self, id: &str) -> Result<CheckpointRecord, StorageError> {
        let inner = self.inner.lock().expect("storage mutex poisoned");
        let (meta, blob) = inner
            .checkpoints
            .get(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        Ok(CheckpointRecord {
            id: id.to_string(),
            meta: meta.clone(),
            blob: blob.clone(),
        })
    }

    async fn put_checkpoint(&self, record: &CheckpointRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("storage mutex poisoned");
        inner
            .checkpoints
            .insert(record.id.clone(), (record.meta.clone(), record.blob.clone()));
        Ok(())
    }

    async fn delete_checkpoint(&self, id: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("storage mutex poisoned");
        inner
            .checkpoints
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }
}
