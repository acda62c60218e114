//! Filesystem storage — `state.json` plus one file per checkpoint under
//! `checkpoints/`.
//!
//! Crash-safety: every write goes to a `.tmp` sibling, is fsync'd, then
//! renamed over the destination. A crash before the rename leaves the old
//! file untouched; a crash after leaves a consistent new file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::{CheckpointRecord, StorageBackend, StorageError};

#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_path(&self) -> PathBuf {
        self.root.join("state.json")
    }

    fn checkpoint_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    fn checkpoint_path(&self, id: &str) -> PathBuf {
        // Checkpoint ids are UUIDs generated by the state layer; reject
        // anything that could escape the directory.
        let safe: String = id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();
        self.checkpoint_dir().join(format!("{safe}.json"))
    }

    async fn write_atomic(path: &Path, payload: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = {
            let filename = path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "state.json".to_string());
            path.with_file_name(format!("{filename}.tmp"))
        };

        let write_result: Result<(), StorageError> = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .await?;
            file.write_all(payload).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FsStorage {
    async fn load(&self) -> Result<Option<serde_json::Value>, StorageError> {
        let path = self.state_path();
        match tokio::fs::read(&path).await {
            Ok(raw) => {
                let blob = serde_json::from_slice(&raw)
                    .map_err(|err| StorageError::Corrupt(err.to_string()))?;
                Ok(Some(blob))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, blob: &serde_json::Value) -> Result<(), StorageError> {
        let payload = serde_json::to_vec(blob)
            .map_err(|err| StorageError::Corrupt(err.to_string()))?;
        Self::write_atomic(&self.state_path(), &payload).await
    }

    async fn list_checkpoints(&self) -> Result<Vec<serde_json::Value>, StorageError> {
        let dir = self.checkpoint_dir();
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            let raw = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<serde_json::Value>(&raw) {
                Ok(record) => {
                    if let Some(meta) = record.get("meta") {
                        out.push(meta.clone());
                    }
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping unreadable checkpoint file");
                }
            }
        }

        Ok(out)
    }

    async fn get_checkpoint(&self, id: &str) -> Result<CheckpointRecord, StorageError> {
        let path = self.checkpoint_path(id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(id.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let record: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|err| StorageError::Corrupt(err.to_string()))?;
        let meta = record
            .get("meta")
            .cloned()
            .ok_or_else(|| StorageError::Corrupt("checkpoint missing meta".to_string()))?;
        let blob = record
            .get("blob")
            .cloned()
            .ok_or_else(|| StorageError::Corrupt("checkpoint missing blob".to_string()))?;
        Ok(CheckpointRecord {
            id: id.to_string(),
            meta,
            blob,
        })
    }

    async fn put_checkpoint(&self, record: &CheckpointRecord) -> Result<(), StorageError> {
        let payload = serde_json::to_vec(&serde_json::json!({
            "meta": record.meta,
            "blob": record.blob,
        }))
        .map_err(|err| StorageError::Corrupt(err.to_string()))?;
        Self::write_atomic(&self.checkpoint_path(&record.id), &payload).await
    }

    async fn delete_checkpoint(&self, id: &str) -> Result<(), StorageError> {
        let path = self.checkpoint_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn load_returns_none_on_first_run() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = FsStorage::new(dir.path());
        assert!(storage.load().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = FsStorage::new(dir.path());
        let blob = json!({"version": 1, "human": {"facts": []}});
        storage.save(&blob).await?;
        assert_eq!(storage.load().await?, Some(blob));
        Ok(())
    }

    #[tokio::test]
    async fn save_leaves_no_tmp_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = FsStorage::new(dir.path());
        storage.save(&json!({"version": 1})).await?;
        assert!(!dir.path().join("state.json.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn checkpoint_lifecycle() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = FsStorage::new(dir.path());
        let record = CheckpointRecord {
            id: "abc-123".to_string(),
            meta: json!({"id": "abc-123", "name": "before risky edit", "slot": 10}),
            blob: json!({"version": 1}),
        };
        storage.put_checkpoint(&record).await?;

        let listed = storage.list_checkpoints().await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["name"], "before risky edit");

        let fetched = storage.get_checkpoint("abc-123").await?;
        assert_eq!(fetched.blob, json!({"version": 1}));

        storage.delete_checkpoint("abc-123").await?;
        assert!(matches!(
            storage.get_checkpoint("abc-123").await,
            Err(StorageError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_state_surfaces_as_corrupt() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        tokio::fs::write(dir.path().join("state.json"), b"{not json").await?;
        let storage = FsStorage::new(dir.path());
        assert!(matches!(storage.load().await, Err(StorageError::Corrupt(_))));
        Ok(())
    }
}
