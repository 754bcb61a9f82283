// src/adapters/storage.rs

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::ports::{ObjectStorage, StorageError};

/// Stores objects as files under one directory. The content type of each object
/// is kept next to it in `<key>.type`.
pub struct FsObjectStorage {
    root: PathBuf,
}

impl FsObjectStorage {
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn paths(&self, key: &str) -> Result<(PathBuf, PathBuf), StorageError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }

        Ok((self.root.join(key), self.root.join(format!("{}.type", key))))
    }
}

async fn read_or_not_found(path: &Path, key: &str) -> Result<Vec<u8>, StorageError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(StorageError::NotFound(key.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ObjectStorage for FsObjectStorage {
    async fn put(&self, key: &str, content_type: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let (data, meta) = self.paths(key)?;
        tokio::fs::write(&data, bytes).await?;
        tokio::fs::write(&meta, content_type).await?;
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<String, StorageError> {
        let (_, meta) = self.paths(key)?;
        let bytes = read_or_not_found(&meta, key).await?;
        Ok(String::from_utf8_lossy(&bytes).trim().to_string())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let (data, _) = self.paths(key)?;
        read_or_not_found(&data, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsObjectStorage::new(dir.path()).unwrap();

        storage.put("abc_123", "application/pdf", b"%PDF").await.unwrap();

        assert_eq!(storage.head("abc_123").await.unwrap(), "application/pdf");
        assert_eq!(storage.get("abc_123").await.unwrap(), b"%PDF");
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsObjectStorage::new(dir.path()).unwrap();

        assert!(matches!(storage.get("nope").await, Err(StorageError::NotFound(_))));
        assert!(matches!(storage.head("nope").await, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsObjectStorage::new(dir.path()).unwrap();

        assert!(matches!(
            storage.get("../etc/passwd").await,
            Err(StorageError::InvalidKey(_))
        ));
    }
}
