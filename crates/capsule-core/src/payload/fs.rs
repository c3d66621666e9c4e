use std::path::PathBuf;

use async_trait::async_trait;
use capsule_shared::PayloadRef;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use super::{PayloadError, PayloadStore};

/// Ciphertext files on local disk, one file per payload named by UUID.
#[derive(Debug, Clone)]
pub struct FsPayloadStore {
    base_path: PathBuf,
}

impl FsPayloadStore {
    pub async fn new(base_path: PathBuf) -> Result<Self, PayloadError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            PayloadError::Storage(format!(
                "Failed to create payload directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Payload store initialized");

        Ok(Self { base_path })
    }

    /// Only refs that parse as UUIDs map to a path, so a ref can never
    /// escape the base directory.
    fn path_for(&self, payload: &PayloadRef) -> Result<PathBuf, PayloadError> {
        let id = Uuid::parse_str(payload.as_str())
            .map_err(|_| PayloadError::NotFound(payload.clone()))?;
        Ok(self.base_path.join(id.to_string()))
    }
}

#[async_trait]
impl PayloadStore for FsPayloadStore {
    async fn put(&self, data: &[u8]) -> Result<PayloadRef, PayloadError> {
        let id = Uuid::new_v4();
        let path = self.base_path.join(id.to_string());
        let tmp = self.base_path.join(format!("{id}.tmp"));

        // Write then rename, so a crash never leaves a truncated payload
        // under a live ref.
        fs::write(&tmp, data)
            .await
            .map_err(|e| PayloadError::Storage(format!("Failed to write payload {id}: {e}")))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| PayloadError::Storage(format!("Failed to commit payload {id}: {e}")))?;

        debug!(id = %id, size = data.len(), "Stored payload");
        Ok(PayloadRef(id.to_string()))
    }

    async fn get(&self, payload: &PayloadRef) -> Result<Vec<u8>, PayloadError> {
        let path = self.path_for(payload)?;

        match fs::read(&path).await {
            Ok(data) => {
                debug!(payload = %payload, size = data.len(), "Retrieved payload");
                Ok(data)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PayloadError::NotFound(payload.clone()))
            }
            Err(e) => Err(PayloadError::Storage(format!(
                "Failed to read payload {payload}: {e}"
            ))),
        }
    }

    async fn delete(&self, payload: &PayloadRef) -> Result<(), PayloadError> {
        let path = self.path_for(payload)?;

        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(payload = %payload, "Deleted payload");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PayloadError::NotFound(payload.clone()))
            }
            Err(e) => Err(PayloadError::Storage(format!(
                "Failed to delete payload {payload}: {e}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (FsPayloadStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FsPayloadStore::new(dir.path().join("payloads")).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (store, _dir) = test_store().await;

        let payload = store.put(b"encrypted-payload").await.unwrap();
        assert_eq!(store.get(&payload).await.unwrap(), b"encrypted-payload");
    }

    #[tokio::test]
    async fn test_no_temp_files_left() {
        let (store, dir) = test_store().await;
        store.put(b"data").await.unwrap();

        let mut entries = fs::read_dir(dir.path().join("payloads")).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let name = entry.file_name();
            assert!(!name.to_string_lossy().ends_with(".tmp"));
        }
    }

    #[tokio::test]
    async fn test_delete() {
        let (store, _dir) = test_store().await;
        let payload = store.put(b"delete-me").await.unwrap();

        store.delete(&payload).await.unwrap();
        assert_eq!(
            store.get(&payload).await,
            Err(PayloadError::NotFound(payload.clone()))
        );
        assert!(store.delete(&payload).await.is_err());
    }

    #[tokio::test]
    async fn test_not_found() {
        let (store, _dir) = test_store().await;
        let missing = PayloadRef(Uuid::new_v4().to_string());
        assert!(matches!(
            store.get(&missing).await,
            Err(PayloadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_traversal_ref_rejected() {
        let (store, _dir) = test_store().await;
        let evil = PayloadRef("../../etc/passwd".into());
        assert!(matches!(store.get(&evil).await, Err(PayloadError::NotFound(_))));
    }
}
