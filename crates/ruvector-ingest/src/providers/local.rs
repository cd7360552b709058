//! Local filesystem blob store

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

use super::blob_store::BlobStore;

/// Local blob store: `<root>/<bucket>/<name>`
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Create a new local blob store
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Resolve an object path, rejecting names that escape the bucket
    fn object_path(&self, bucket: &str, name: &str) -> Result<PathBuf> {
        let safe = |part: &str| {
            !part.is_empty()
                && Path::new(part)
                    .components()
                    .all(|c| matches!(c, Component::Normal(_)))
        };
        if !safe(bucket) || !safe(name) {
            return Err(Error::storage(format!("Invalid object key: {}/{}", bucket, name)));
        }
        Ok(self.root.join(bucket).join(name))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn get(&self, bucket: &str, name: &str) -> Result<Vec<u8>> {
        let path = self.object_path(bucket, name)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::ObjectNotFound {
                bucket: bucket.to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(Error::storage(format!("Failed to read {}/{}: {}", bucket, name, e))),
        }
    }

    async fn put(&self, bucket: &str, name: &str, data: &[u8]) -> Result<()> {
        let path = self.object_path(bucket, name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        Ok(())
    }

    async fn exists(&self, bucket: &str, name: &str) -> Result<bool> {
        let path = self.object_path(bucket, name)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    fn name(&self) -> &str {
        "local-filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path().to_path_buf()).unwrap();

        assert!(!store.exists("kb1", "a.txt").await.unwrap());
        store.put("kb1", "a.txt", b"hello").await.unwrap();
        assert!(store.exists("kb1", "a.txt").await.unwrap());
        assert_eq!(store.get("kb1", "a.txt").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_missing_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path().to_path_buf()).unwrap();

        let err = store.get("kb1", "missing.pdf").await.unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound { .. }));
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path().to_path_buf()).unwrap();

        assert!(store.put("kb1", "../escape", b"x").await.is_err());
        assert!(store.get("..", "a").await.is_err());
    }
}
