//! Storage contract — load/save the full state blob and named checkpoints.
//!
//! The backend is pluggable behind [`StorageBackend`]; the core ships a
//! filesystem implementation and an in-memory one for tests. Writes are
//! atomic at the blob level: a reader never observes a partially written
//! state file.

mod fs_backend;
mod memory_backend;

pub use fs_backend::FsStorage;
pub use memory_backend::MemoryStorage;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt blob: {0}")]
    Corrupt(String),
    #[error("unknown checkpoint: {0}")]
    NotFound(String),
}

/// Raw checkpoint record as the backend sees it: opaque metadata JSON plus
/// the serialized state blob. The state crate owns the actual shapes; keeping
/// the backend untyped lets it store blobs it cannot interpret (forward
/// compatibility across versions).
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub id: String,
    pub meta: serde_json::Value,
    pub blob: serde_json::Value,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Load the live state blob, or `None` on first run.
    async fn load(&self) -> Result<Option<serde_json::Value>, StorageError>;

    /// Atomically replace the live state blob.
    async fn save(&self, blob: &serde_json::Value) -> Result<(), StorageError>;

    async fn list_checkpoints(&self) -> Result<Vec<serde_json::Value>, StorageError>;

    async fn get_checkpoint(&self, id: &str) -> Result<CheckpointRecord, StorageError>;

    async fn put_checkpoint(&self, record: &CheckpointRecord) -> Result<(), StorageError>;

    async fn delete_checkpoint(&self, id: &str) -> Result<(), StorageError>;
}
