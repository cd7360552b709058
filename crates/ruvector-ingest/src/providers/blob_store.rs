//! Blob storage trait for uploaded files and extracted images

use async_trait::async_trait;
use crate::error::Result;

/// Trait for object storage addressed by (bucket, name)
///
/// Implementations:
/// - `LocalBlobStore`: Local filesystem, one directory per bucket
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read an object; `Error::ObjectNotFound` when absent
    async fn get(&self, bucket: &str, name: &str) -> Result<Vec<u8>>;

    /// Write an object, replacing any previous content
    async fn put(&self, bucket: &str, name: &str, data: &[u8]) -> Result<()>;

    /// Check if an object exists
    async fn exists(&self, bucket: &str, name: &str) -> Result<bool>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
